//! Short-lived key/value state with expiry.
//!
//! Holds values that must outlive a single request but not much longer, such
//! as single-use state tokens issued during a redirect flow. The SQLite store
//! keeps them across restarts and across instances sharing the database.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::{self, Database, StoreError};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::Store(StoreError::Database(e))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Expiring key/value storage. Expired entries read as absent.
#[async_trait]
pub trait TtlCache: Send + Sync {
    /// Stores `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Reads and deletes in one step. At most one caller gets the value.
    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local cache for tests and single-instance use.
#[derive(Debug, Default)]
pub struct MemoryTtlCache {
    entries: Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
}

impl MemoryTtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (Vec<u8>, DateTime<Utc>)>>> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable("cache lock poisoned".to_string()))
    }
}

#[async_trait]
impl TtlCache for MemoryTtlCache {
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let expires_at = db::add_duration(Utc::now(), ttl);
        self.lock()?.insert(key.to_string(), (value.to_vec(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Utc::now();
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Utc::now();
        Ok(self
            .lock()?
            .remove(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// Cache rows in the shared SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteTtlCache {
    db: Database,
}

impl SqliteTtlCache {
    pub fn new(db: Database) -> Self {
        SqliteTtlCache { db }
    }

    /// Deletes expired rows. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM ttl_cache WHERE expires_at <= ?")
            .bind(db::to_millis(Utc::now()))
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TtlCache for SqliteTtlCache {
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let expires_at = db::to_millis(db::add_duration(Utc::now(), ttl));
        sqlx::query(
            "INSERT INTO ttl_cache (key, value, expires_at) VALUES (?, ?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM ttl_cache WHERE key = ? AND expires_at > ?")
                .bind(key)
                .bind(db::to_millis(Utc::now()))
                .fetch_optional(self.db.pool())
                .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>, i64)> =
            sqlx::query_as("DELETE FROM ttl_cache WHERE key = ? RETURNING value, expires_at")
                .bind(key)
                .fetch_optional(self.db.pool())
                .await?;
        let now = db::to_millis(Utc::now());
        Ok(row.filter(|(_, expires_at)| *expires_at > now).map(|(value, _)| value))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM ttl_cache WHERE key = ?")
            .bind(key)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    async fn put_get_take(cache: &dyn TtlCache) {
        cache.put("state:abc", b"org-1", MINUTE).await.unwrap();
        assert_eq!(cache.get("state:abc").await.unwrap().as_deref(), Some(&b"org-1"[..]));

        assert_eq!(cache.take("state:abc").await.unwrap().as_deref(), Some(&b"org-1"[..]));
        assert!(cache.take("state:abc").await.unwrap().is_none(), "take is single use");
        assert!(cache.get("state:abc").await.unwrap().is_none());
    }

    async fn expiry(cache: &dyn TtlCache) {
        cache.put("short", b"v", Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("short").await.unwrap().is_none());
        assert!(cache.take("short").await.unwrap().is_none());
    }

    async fn overwrite_and_remove(cache: &dyn TtlCache) {
        cache.put("k", b"one", MINUTE).await.unwrap();
        cache.put("k", b"two", MINUTE).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some(&b"two"[..]));
        cache.remove("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_cache_behaviour() {
        let cache = MemoryTtlCache::new();
        put_get_take(&cache).await;
        expiry(&cache).await;
        overwrite_and_remove(&cache).await;
    }

    #[tokio::test]
    async fn sqlite_cache_behaviour() {
        let cache = SqliteTtlCache::new(Database::in_memory().await.unwrap());
        put_get_take(&cache).await;
        expiry(&cache).await;
        overwrite_and_remove(&cache).await;
    }

    #[tokio::test]
    async fn sqlite_purge_removes_only_expired() {
        let cache = SqliteTtlCache::new(Database::in_memory().await.unwrap());
        cache.put("old", b"x", Duration::from_millis(1)).await.unwrap();
        cache.put("new", b"y", MINUTE).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert!(cache.get("new").await.unwrap().is_some());
    }
}
