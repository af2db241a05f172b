//! Windowed counter stores.
//!
//! A counter is a count plus an expiry. The first increment in a fresh window
//! sets the expiry to `now + window`; later increments in the same window
//! leave it untouched. Once the expiry passes, the next increment starts a new
//! window at 1.
//!
//! Member sets follow the same window rule but count distinct members, so
//! adding a member twice in one window counts it once.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::{self, Database, StoreError};

/// Counter state after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    pub count: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CounterError {
    /// The backing database failed.
    #[error("counter store error: {0}")]
    Store(#[from] StoreError),

    /// The store could not be reached in time or is otherwise unusable.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for CounterError {
    fn from(e: sqlx::Error) -> Self {
        CounterError::Store(StoreError::Database(e))
    }
}

/// An atomic increment-with-expiry store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `key` and returns the state after the increment.
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<CounterState, CounterError>;

    /// Reads `key` without incrementing. Expired counters read as `None`.
    async fn current(&self, key: &str, now: DateTime<Utc>)
    -> Result<Option<CounterState>, CounterError>;

    /// Adds `member` to the set at `key` and returns the number of distinct
    /// members in the current window.
    async fn add_member(
        &self,
        key: &str,
        member: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<CounterState, CounterError>;

    /// Deletes `key`, whether it holds a counter or a member set.
    async fn reset(&self, key: &str) -> Result<(), CounterError>;
}

#[derive(Debug)]
struct MemberSet {
    members: HashSet<String>,
    expires_at: DateTime<Utc>,
}

/// Process-local counters. Used in tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, CounterState>>,
    sets: Mutex<HashMap<String, MemberSet>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CounterState>>, CounterError> {
        self.counters
            .lock()
            .map_err(|_| CounterError::Unavailable("counter lock poisoned".to_string()))
    }

    fn lock_sets(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, MemberSet>>, CounterError> {
        self.sets
            .lock()
            .map_err(|_| CounterError::Unavailable("member set lock poisoned".to_string()))
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<CounterState, CounterError> {
        let mut counters = self.lock()?;
        let state = counters
            .entry(key.to_string())
            .and_modify(|state| {
                if state.expires_at <= now {
                    *state = CounterState {
                        count: 1,
                        expires_at: db::add_duration(now, window),
                    };
                } else {
                    state.count += 1;
                }
            })
            .or_insert_with(|| CounterState {
                count: 1,
                expires_at: db::add_duration(now, window),
            });
        Ok(*state)
    }

    async fn current(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CounterState>, CounterError> {
        let counters = self.lock()?;
        Ok(counters.get(key).copied().filter(|s| s.expires_at > now))
    }

    async fn add_member(
        &self,
        key: &str,
        member: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<CounterState, CounterError> {
        let mut sets = self.lock_sets()?;
        let set = sets.entry(key.to_string()).or_insert_with(|| MemberSet {
            members: HashSet::new(),
            expires_at: db::add_duration(now, window),
        });
        if set.expires_at <= now {
            set.members.clear();
            set.expires_at = db::add_duration(now, window);
        }
        set.members.insert(member.to_string());
        Ok(CounterState {
            count: set.members.len() as u64,
            expires_at: set.expires_at,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), CounterError> {
        self.lock()?.remove(key);
        self.lock_sets()?.remove(key);
        Ok(())
    }
}

/// Counters in the shared SQLite database.
///
/// The increment is a single upsert, so concurrent callers never lose counts
/// and only the call that opens a window sets its expiry.
#[derive(Debug, Clone)]
pub struct SqliteCounterStore {
    db: Database,
}

impl SqliteCounterStore {
    pub fn new(db: Database) -> Self {
        SqliteCounterStore { db }
    }

    /// Deletes counters and set members whose window ended at or before
    /// `now`. Returns the number of rows removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, CounterError> {
        let now_ms = db::to_millis(now);
        let counters = sqlx::query("DELETE FROM velocity_counters WHERE expires_at <= ?")
            .bind(now_ms)
            .execute(self.db.pool())
            .await?;
        let members = sqlx::query("DELETE FROM velocity_members WHERE expires_at <= ?")
            .bind(now_ms)
            .execute(self.db.pool())
            .await?;
        Ok(counters.rows_affected() + members.rows_affected())
    }

    fn state_from_row(count: i64, expires_at: i64) -> Result<CounterState, CounterError> {
        Ok(CounterState {
            count: count.max(0) as u64,
            expires_at: db::from_millis("velocity_counters", expires_at)?,
        })
    }
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<CounterState, CounterError> {
        let now_ms = db::to_millis(now);
        let fresh_expiry = db::to_millis(db::add_duration(now, window));

        let (count, expires_at): (i64, i64) = sqlx::query_as(
            "INSERT INTO velocity_counters (key, count, expires_at) VALUES (?1, 1, ?2)
             ON CONFLICT (key) DO UPDATE SET
                 count = CASE WHEN velocity_counters.expires_at <= ?3
                              THEN 1 ELSE velocity_counters.count + 1 END,
                 expires_at = CASE WHEN velocity_counters.expires_at <= ?3
                                   THEN ?2 ELSE velocity_counters.expires_at END
             RETURNING count, expires_at",
        )
        .bind(key)
        .bind(fresh_expiry)
        .bind(now_ms)
        .fetch_one(self.db.pool())
        .await?;

        Self::state_from_row(count, expires_at)
    }

    async fn current(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CounterState>, CounterError> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT count, expires_at FROM velocity_counters WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(db::to_millis(now))
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|(count, expires_at)| Self::state_from_row(count, expires_at))
            .transpose()
    }

    async fn add_member(
        &self,
        key: &str,
        member: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<CounterState, CounterError> {
        let now_ms = db::to_millis(now);
        let fresh_expiry = db::to_millis(db::add_duration(now, window));

        // Every live member of a key shares the expiry of the window's first member.
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM velocity_members WHERE key = ? AND expires_at <= ?")
            .bind(key)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO velocity_members (key, member, expires_at)
             VALUES (?1, ?2, COALESCE((SELECT MAX(expires_at) FROM velocity_members WHERE key = ?1), ?3))
             ON CONFLICT (key, member) DO NOTHING",
        )
        .bind(key)
        .bind(member)
        .bind(fresh_expiry)
        .execute(&mut *tx)
        .await?;
        let (count, expires_at): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(MAX(expires_at), ?2) FROM velocity_members WHERE key = ?1",
        )
        .bind(key)
        .bind(fresh_expiry)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Self::state_from_row(count, expires_at)
    }

    async fn reset(&self, key: &str) -> Result<(), CounterError> {
        sqlx::query("DELETE FROM velocity_counters WHERE key = ?")
            .bind(key)
            .execute(self.db.pool())
            .await?;
        sqlx::query("DELETE FROM velocity_members WHERE key = ?")
            .bind(key)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}
