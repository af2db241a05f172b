//! Durable storage for outbox entries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::db::{self, Database, Result};

/// A durable record of a domain event awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: Uuid,
    /// Scopes the event to a tenant.
    pub aggregate_key: String,
    /// Versioned event name, e.g. `payment_succeeded.v1`.
    pub event_type: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Decodes the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }
}

type EntryRow = (String, String, String, Vec<u8>, i64, Option<i64>);

fn entry_from_row(row: EntryRow) -> Result<OutboxEntry> {
    let (id, aggregate_key, event_type, payload, created_at, delivered_at) = row;
    Ok(OutboxEntry {
        id: db::parse_uuid("outbox", &id)?,
        aggregate_key,
        event_type,
        payload,
        created_at: db::from_millis("outbox", created_at)?,
        delivered_at: delivered_at
            .map(|ms| db::from_millis("outbox", ms))
            .transpose()?,
    })
}

/// Reads and marks outbox entries. Inserts go through a caller transaction.
#[derive(Debug, Clone)]
pub struct OutboxStore {
    db: Database,
}

impl OutboxStore {
    pub fn new(db: Database) -> Self {
        OutboxStore { db }
    }

    /// Inserts an entry on `conn`, which should be the transaction carrying the
    /// state change the event describes.
    pub async fn insert(
        conn: &mut SqliteConnection,
        aggregate_key: &str,
        event_type: &str,
        payload: &[u8],
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO outbox (id, aggregate_key, event_type, payload, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(aggregate_key)
        .bind(event_type)
        .bind(payload)
        .bind(db::to_millis(Utc::now()))
        .execute(&mut *conn)
        .await?;
        Ok(id)
    }

    /// Serializes `event` as JSON and inserts it.
    pub async fn insert_json<T: Serialize>(
        conn: &mut SqliteConnection,
        aggregate_key: &str,
        event_type: &str,
        event: &T,
    ) -> Result<Uuid> {
        let payload = serde_json::to_vec(event)?;
        Self::insert(conn, aggregate_key, event_type, &payload).await
    }

    /// Returns up to `limit` undelivered entries, oldest first.
    ///
    /// Entries created in the same millisecond keep their insertion order.
    pub async fn fetch_pending(&self, limit: u32) -> Result<Vec<OutboxEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT id, aggregate_key, event_type, payload, created_at, delivered_at
             FROM outbox
             WHERE delivered_at IS NULL
             ORDER BY created_at, seq
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }

    /// Stamps the entry as delivered.
    ///
    /// Returns false if the entry does not exist or was already delivered; the
    /// original delivery time is never overwritten.
    pub async fn mark_delivered(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE outbox SET delivered_at = ? WHERE id = ? AND delivered_at IS NULL",
        )
        .bind(db::to_millis(Utc::now()))
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(
            "SELECT id, aggregate_key, event_type, payload, created_at, delivered_at
             FROM outbox WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.db.pool())
        .await?;
        row.map(entry_from_row).transpose()
    }

    /// Number of entries still awaiting delivery.
    pub async fn count_pending(&self) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE delivered_at IS NULL")
                .fetch_one(self.db.pool())
                .await?;
        Ok(count.max(0) as u64)
    }
}
