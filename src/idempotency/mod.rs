//! Idempotency ledger for inbound provider events.
//!
//! Providers deliver each event at least once. Every event is reduced to a
//! deterministic identifier derived from `(provider, external event id)` and
//! recorded in `processed_events` the first time its side effects commit.
//!
//! # Claiming
//!
//! The primary key on `processed_events` decides races: two handlers inserting
//! the same derived id cannot both succeed. [`IdempotencyGuard::claim_in`] runs
//! inside the caller's transaction so the claim commits or rolls back together
//! with the state it protects.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::debug;
use uuid::Uuid;

use crate::db::{self, Database, Result, StoreError};

/// Namespace for processed-event identifiers.
const PROCESSED_EVENT_NAMESPACE: Uuid = Uuid::from_u128(0x1c4b4ef0_0f1f_4f8b_8a9c_7c0fba51cdbd);

/// Derives the stable identifier for a provider event.
///
/// Surrounding whitespace in the external id is ignored. An empty id has no
/// identity and is rejected.
pub fn derive_event_id(provider: &str, external_event_id: &str) -> Result<Uuid> {
    let trimmed = external_event_id.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidArgument("event id is required"));
    }
    let name = format!("{provider}:{trimmed}");
    Ok(Uuid::new_v5(&PROCESSED_EVENT_NAMESPACE, name.as_bytes()))
}

/// A recorded claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEvent {
    pub event_id: Uuid,
    pub provider: String,
    pub external_event_id: String,
    pub processed_at: DateTime<Utc>,
}

/// Records and queries processed provider events.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    db: Database,
}

impl IdempotencyGuard {
    pub fn new(db: Database) -> Self {
        IdempotencyGuard { db }
    }

    /// Returns true if the event was already claimed.
    pub async fn already_claimed(&self, provider: &str, external_event_id: &str) -> Result<bool> {
        let id = derive_event_id(provider, external_event_id)?;
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM processed_events WHERE event_id = ?")
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.is_some())
    }

    /// Claims the event in its own statement. Returns false if already claimed.
    pub async fn claim(&self, provider: &str, external_event_id: &str) -> Result<bool> {
        let mut conn = self.db.pool().acquire().await?;
        Self::claim_in(&mut conn, provider, external_event_id).await
    }

    /// Claims the event on the given connection, usually an open transaction.
    ///
    /// Returns true only for the single caller whose insert created the row.
    pub async fn claim_in(
        conn: &mut SqliteConnection,
        provider: &str,
        external_event_id: &str,
    ) -> Result<bool> {
        let id = derive_event_id(provider, external_event_id)?;
        let result = sqlx::query(
            "INSERT INTO processed_events (event_id, provider, external_event_id, processed_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(id.to_string())
        .bind(provider)
        .bind(external_event_id.trim())
        .bind(db::to_millis(Utc::now()))
        .execute(&mut *conn)
        .await?;

        let claimed = result.rows_affected() > 0;
        debug!(
            provider = %provider,
            event_id = %external_event_id.trim(),
            claimed,
            "Idempotency claim"
        );
        Ok(claimed)
    }

    /// Looks up the audit record for a claimed event.
    pub async fn get(&self, provider: &str, external_event_id: &str) -> Result<Option<ProcessedEvent>> {
        let id = derive_event_id(provider, external_event_id)?;
        let row: Option<(String, String, String, i64)> = sqlx::query_as(
            "SELECT event_id, provider, external_event_id, processed_at
             FROM processed_events WHERE event_id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|(event_id, provider, external_event_id, processed_at)| {
            Ok(ProcessedEvent {
                event_id: db::parse_uuid("processed_events", &event_id)?,
                provider,
                external_event_id,
                processed_at: db::from_millis("processed_events", processed_at)?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    async fn guard() -> IdempotencyGuard {
        IdempotencyGuard::new(Database::in_memory().await.unwrap())
    }

    #[test]
    fn derived_id_is_deterministic_and_trim_insensitive() {
        let a = derive_event_id("square", "evt_123").unwrap();
        let b = derive_event_id("square", "  evt_123\n").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.get_version_num(), 5);
    }

    #[test]
    fn derived_id_differs_by_provider() {
        let square = derive_event_id("square", "evt_123").unwrap();
        let stripe = derive_event_id("stripe", "evt_123").unwrap();
        assert_ne!(square, stripe);
    }

    #[test]
    fn empty_event_id_is_rejected() {
        assert!(matches!(
            derive_event_id("square", "   "),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn first_claim_wins() {
        let guard = guard().await;
        assert!(!guard.already_claimed("square", "evt_1").await.unwrap());
        assert!(guard.claim("square", "evt_1").await.unwrap());
        assert!(!guard.claim("square", "evt_1").await.unwrap());
        assert!(guard.already_claimed("square", " evt_1 ").await.unwrap());
    }

    #[tokio::test]
    async fn same_external_id_is_independent_across_providers() {
        let guard = guard().await;
        assert!(guard.claim("square", "evt_1").await.unwrap());
        assert!(guard.claim("stripe", "evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn rolled_back_claim_is_released() {
        let db = Database::in_memory().await.unwrap();
        let guard = IdempotencyGuard::new(db.clone());

        let mut tx = db.begin().await.unwrap();
        assert!(IdempotencyGuard::claim_in(&mut tx, "stripe", "evt_9").await.unwrap());
        tx.rollback().await.unwrap();

        assert!(!guard.already_claimed("stripe", "evt_9").await.unwrap());
        assert!(guard.claim("stripe", "evt_9").await.unwrap());
    }

    #[tokio::test]
    async fn get_returns_audit_record() {
        let guard = guard().await;
        guard.claim("square", "evt_audit").await.unwrap();

        let record = guard.get("square", "evt_audit").await.unwrap().unwrap();
        assert_eq!(record.provider, "square");
        assert_eq!(record.external_event_id, "evt_audit");
        assert_eq!(record.event_id, derive_event_id("square", "evt_audit").unwrap());
        assert!(guard.get("square", "missing").await.unwrap().is_none());
    }

    proptest! {
        #[test]
        fn derived_id_ignores_surrounding_whitespace(
            id in "[a-zA-Z0-9_]{1,32}",
            left in "[ \t]{0,3}",
            right in "[ \t\n]{0,3}",
        ) {
            let padded = format!("{left}{id}{right}");
            prop_assert_eq!(
                derive_event_id("square", &id).unwrap(),
                derive_event_id("square", &padded).unwrap()
            );
        }
    }
}
