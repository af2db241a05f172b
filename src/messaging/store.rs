//! `outbound_messages` and `hosted_orders` access.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{HOSTED_PENDING_STATUSES, STATUS_FAILED, STATUS_RETRY_PENDING};
use crate::db::{self, Database, Result};
use crate::types::OrgId;

/// A stored outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub org_id: OrgId,
    pub from: String,
    pub to: String,
    pub body: String,
    pub media_urls: Vec<String>,
    pub provider_status: String,
    pub provider_message_id: Option<String>,
    pub send_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when a message is first recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboundMessage {
    pub id: Uuid,
    pub org_id: OrgId,
    pub from: String,
    pub to: String,
    pub body: String,
    pub media_urls: Vec<String>,
    pub provider_status: String,
}

type MessageRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    Option<i64>,
    Option<i64>,
    i64,
);

const SELECT_MESSAGE: &str = "SELECT id, org_id, from_number, to_number, body, media_urls, provider_status,
        provider_message_id, send_attempts, last_attempt_at, next_retry_at, created_at
     FROM outbound_messages";

fn message_from_row(row: MessageRow) -> Result<OutboundMessage> {
    let (
        id,
        org_id,
        from,
        to,
        body,
        media_urls,
        provider_status,
        provider_message_id,
        send_attempts,
        last_attempt_at,
        next_retry_at,
        created_at,
    ) = row;
    let opt_time = |ms: Option<i64>| {
        ms.map(|ms| db::from_millis("outbound_messages", ms))
            .transpose()
    };
    Ok(OutboundMessage {
        id: db::parse_uuid("outbound_messages", &id)?,
        org_id: OrgId(db::parse_uuid("outbound_messages", &org_id)?),
        from,
        to,
        body,
        media_urls: serde_json::from_str(&media_urls)?,
        provider_status,
        provider_message_id,
        send_attempts: send_attempts.clamp(0, i64::from(u32::MAX)) as u32,
        last_attempt_at: opt_time(last_attempt_at)?,
        next_retry_at: opt_time(next_retry_at)?,
        created_at: db::from_millis("outbound_messages", created_at)?,
    })
}

/// Outbound message records.
#[derive(Debug, Clone)]
pub struct MessageStore {
    db: Database,
}

impl MessageStore {
    pub fn new(db: Database) -> Self {
        MessageStore { db }
    }

    /// Records a message. Returns false if a message with this id exists.
    pub async fn insert(&self, message: &NewOutboundMessage) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO outbound_messages
                (id, org_id, from_number, to_number, body, media_urls, provider_status, send_attempts, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(message.id.to_string())
        .bind(message.org_id.to_string())
        .bind(&message.from)
        .bind(&message.to)
        .bind(&message.body)
        .bind(serde_json::to_string(&message.media_urls)?)
        .bind(&message.provider_status)
        .bind(db::to_millis(Utc::now()))
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<OutboundMessage>> {
        let row: Option<MessageRow> = sqlx::query_as(&format!("{SELECT_MESSAGE} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.map(message_from_row).transpose()
    }

    /// Failed messages with attempts left whose retry time has come.
    ///
    /// Messages never scheduled (`next_retry_at` NULL) come first.
    pub async fn list_retry_candidates(
        &self,
        limit: u32,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboundMessage>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "{SELECT_MESSAGE}
             WHERE provider_status IN (?, ?)
               AND send_attempts < ?
               AND (next_retry_at IS NULL OR next_retry_at <= ?)
             ORDER BY next_retry_at, created_at
             LIMIT ?"
        ))
        .bind(STATUS_FAILED)
        .bind(STATUS_RETRY_PENDING)
        .bind(i64::from(max_attempts))
        .bind(db::to_millis(now))
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(message_from_row).collect()
    }

    /// Counts a failed attempt and schedules the next one.
    pub async fn schedule_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE outbound_messages
             SET send_attempts = send_attempts + 1, provider_status = ?, last_attempt_at = ?, next_retry_at = ?
             WHERE id = ?",
        )
        .bind(STATUS_RETRY_PENDING)
        .bind(db::to_millis(now))
        .bind(db::to_millis(next_retry_at))
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Counts a failed attempt and leaves the message `failed` with no
    /// scheduled retry. Once attempts reach the cap this is terminal.
    pub async fn mark_failed(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE outbound_messages
             SET send_attempts = send_attempts + 1, provider_status = ?, last_attempt_at = ?, next_retry_at = NULL
             WHERE id = ?",
        )
        .bind(STATUS_FAILED)
        .bind(db::to_millis(now))
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Records a successful send.
    pub async fn mark_sent(
        &self,
        id: Uuid,
        provider_message_id: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE outbound_messages
             SET send_attempts = send_attempts + 1, provider_status = ?, provider_message_id = ?,
                 last_attempt_at = ?, next_retry_at = NULL
             WHERE id = ?",
        )
        .bind(status)
        .bind(provider_message_id)
        .bind(db::to_millis(now))
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// A locally tracked hosted-number order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedOrder {
    pub id: Uuid,
    pub clinic_id: OrgId,
    pub e164_number: String,
    pub provider_order_id: Option<String>,
    pub status: String,
    pub last_error: String,
    pub updated_at: DateTime<Utc>,
}

type HostedRow = (String, String, String, Option<String>, String, String, i64);

const SELECT_HOSTED: &str =
    "SELECT id, clinic_id, e164_number, provider_order_id, status, last_error, updated_at FROM hosted_orders";

fn hosted_from_row(row: HostedRow) -> Result<HostedOrder> {
    let (id, clinic_id, e164_number, provider_order_id, status, last_error, updated_at) = row;
    Ok(HostedOrder {
        id: db::parse_uuid("hosted_orders", &id)?,
        clinic_id: OrgId(db::parse_uuid("hosted_orders", &clinic_id)?),
        e164_number,
        provider_order_id,
        status,
        last_error,
        updated_at: db::from_millis("hosted_orders", updated_at)?,
    })
}

/// Hosted-number order records.
#[derive(Debug, Clone)]
pub struct HostedOrderStore {
    db: Database,
}

impl HostedOrderStore {
    pub fn new(db: Database) -> Self {
        HostedOrderStore { db }
    }

    /// Orders not yet in a terminal state, least recently updated first.
    pub async fn pending(&self, limit: u32) -> Result<Vec<HostedOrder>> {
        let [a, b, c] = HOSTED_PENDING_STATUSES;
        let rows: Vec<HostedRow> = sqlx::query_as(&format!(
            "{SELECT_HOSTED} WHERE status IN (?, ?, ?) ORDER BY updated_at LIMIT ?"
        ))
        .bind(a)
        .bind(b)
        .bind(c)
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(hosted_from_row).collect()
    }

    /// Inserts an order, or updates the one already tracked for this clinic
    /// and number. Returns the stored id.
    pub async fn upsert(&self, order: &HostedOrder) -> Result<Uuid> {
        let (id,): (String,) = sqlx::query_as(
            "INSERT INTO hosted_orders
                (id, clinic_id, e164_number, provider_order_id, status, last_error, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (clinic_id, e164_number) DO UPDATE SET
                provider_order_id = COALESCE(excluded.provider_order_id, hosted_orders.provider_order_id),
                status = excluded.status,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
             RETURNING id",
        )
        .bind(order.id.to_string())
        .bind(order.clinic_id.to_string())
        .bind(&order.e164_number)
        .bind(&order.provider_order_id)
        .bind(&order.status)
        .bind(&order.last_error)
        .bind(db::to_millis(order.updated_at))
        .fetch_one(self.db.pool())
        .await?;
        db::parse_uuid("hosted_orders", &id)
    }

    /// Records the latest provider status for an order.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: &str,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE hosted_orders SET status = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(last_error)
        .bind(db::to_millis(now))
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<HostedOrder>> {
        let row: Option<HostedRow> = sqlx::query_as(&format!("{SELECT_HOSTED} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.map(hosted_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::STATUS_PENDING_SEND;
    use chrono::Duration;

    fn new_message(status: &str) -> NewOutboundMessage {
        NewOutboundMessage {
            id: Uuid::new_v4(),
            org_id: OrgId::new_v4(),
            from: "+15550001111".to_string(),
            to: "+15552223333".to_string(),
            body: "hello".to_string(),
            media_urls: vec!["https://cdn.example/a.png".to_string()],
            provider_status: status.to_string(),
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent_by_id() {
        let store = MessageStore::new(Database::in_memory().await.unwrap());
        let msg = new_message(STATUS_PENDING_SEND);

        assert!(store.insert(&msg).await.unwrap());
        assert!(!store.insert(&msg).await.unwrap());

        let stored = store.get(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.media_urls, msg.media_urls);
        assert_eq!(stored.send_attempts, 0);
        assert_eq!(stored.provider_status, STATUS_PENDING_SEND);
    }

    #[tokio::test]
    async fn retry_candidates_respect_status_attempts_and_schedule() {
        let store = MessageStore::new(Database::in_memory().await.unwrap());
        let now = Utc::now();

        let failed = new_message(STATUS_FAILED);
        let sent = new_message("delivered");
        let later = new_message(STATUS_FAILED);
        for m in [&failed, &sent, &later] {
            store.insert(m).await.unwrap();
        }
        store.schedule_retry(later.id, now + Duration::minutes(5), now).await.unwrap();

        let due: Vec<_> = store
            .list_retry_candidates(10, 5, now)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(due, vec![failed.id]);

        let due_later: Vec<_> = store
            .list_retry_candidates(10, 5, now + Duration::minutes(10))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(due_later, vec![failed.id, later.id]);

        // One attempt used; a cap of one excludes it.
        assert_eq!(
            store
                .list_retry_candidates(10, 1, now + Duration::minutes(10))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn mark_sent_clears_schedule() {
        let store = MessageStore::new(Database::in_memory().await.unwrap());
        let now = Utc::now();
        let msg = new_message(STATUS_FAILED);
        store.insert(&msg).await.unwrap();
        store.schedule_retry(msg.id, now, now).await.unwrap();

        assert!(store.mark_sent(msg.id, "prov-1", "queued", now).await.unwrap());
        let stored = store.get(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.provider_status, "queued");
        assert_eq!(stored.provider_message_id.as_deref(), Some("prov-1"));
        assert_eq!(stored.send_attempts, 2);
        assert!(stored.next_retry_at.is_none());
        assert!(store.list_retry_candidates(10, 5, now).await.unwrap().is_empty());
    }

    fn hosted(clinic: OrgId, number: &str, status: &str) -> HostedOrder {
        HostedOrder {
            id: Uuid::new_v4(),
            clinic_id: clinic,
            e164_number: number.to_string(),
            provider_order_id: Some(format!("ord-{number}")),
            status: status.to_string(),
            last_error: String::new(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn hosted_upsert_keeps_one_row_per_clinic_number() {
        let store = HostedOrderStore::new(Database::in_memory().await.unwrap());
        let clinic = OrgId::new_v4();
        let first = hosted(clinic, "+15550001111", "pending");
        let id = store.upsert(&first).await.unwrap();
        assert_eq!(id, first.id);

        let again = HostedOrder {
            provider_order_id: None,
            ..hosted(clinic, "+15550001111", "verifying")
        };
        assert_eq!(store.upsert(&again).await.unwrap(), first.id);

        let stored = store.get(first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "verifying");
        assert_eq!(stored.provider_order_id, first.provider_order_id);
    }

    #[tokio::test]
    async fn hosted_pending_excludes_terminal_orders() {
        let store = HostedOrderStore::new(Database::in_memory().await.unwrap());
        let clinic = OrgId::new_v4();
        let open = hosted(clinic, "+1", "documents_submitted");
        let done = hosted(clinic, "+2", "active");
        store.upsert(&open).await.unwrap();
        store.upsert(&done).await.unwrap();

        let pending: Vec<_> = store.pending(10).await.unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(pending, vec![open.id]);

        store.update_status(open.id, "active", "", Utc::now()).await.unwrap();
        assert!(store.pending(10).await.unwrap().is_empty());
    }
}
