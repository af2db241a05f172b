//! SQLite storage shared by every component.
//!
//! One pool backs the idempotency ledger, the outbox, the velocity counters and
//! the worker tables. Components that must commit together (claim, payment
//! update, outbox insert) take a `&mut SqliteConnection` borrowed from a
//! caller-owned transaction; everything else goes through the pool.
//!
//! # Time
//!
//! Timestamps are stored as UTC milliseconds. [`to_millis`] and [`from_millis`]
//! convert at the storage boundary so rows never carry local time.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::debug;

pub mod schema;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database rejected or failed a statement.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored or supplied JSON document could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A row holds a value that cannot be decoded into its domain type.
    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },

    /// The caller supplied an argument the store cannot act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A transaction on the shared pool.
pub type Tx = Transaction<'static, Sqlite>;

/// Handle to the relay database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// How long a connection waits on a locked database before failing.
    pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Opens (creating if needed) the database at `url` and applies the schema.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Self::BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Self::BUSY_TIMEOUT)
            .connect_with(options)
            .await?;

        let db = Database { pool };
        db.migrate().await?;
        debug!(url = %url, "Database ready");
        Ok(db)
    }

    /// Opens a private in-memory database.
    ///
    /// Every in-memory connection is its own database, so the pool is pinned
    /// to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Database { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Wraps an existing pool. The schema is not applied.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Database { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Starts a transaction on the pool.
    pub async fn begin(&self) -> Result<Tx> {
        Ok(self.pool.begin().await?)
    }

    /// Applies every schema statement. Safe to run repeatedly.
    pub async fn migrate(&self) -> Result<()> {
        for statement in schema::STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Round-trips a trivial query. Used by the readiness probe.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Converts a timestamp to its stored form.
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Converts a stored timestamp back, reporting which table held a bad value.
pub fn from_millis(table: &'static str, ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        table,
        reason: format!("timestamp out of range: {ms}"),
    })
}

/// Parses a stored UUID column.
pub fn parse_uuid(table: &'static str, raw: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt {
        table,
        reason: format!("bad uuid {raw:?}: {e}"),
    })
}

/// Adds a std duration to a timestamp, saturating far in the future.
pub fn add_duration(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
