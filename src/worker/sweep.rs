//! Deletes expired cache entries and velocity windows.
//!
//! Both stores already treat expired rows as absent, so sweeping only bounds
//! table growth.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::PeriodicTask;
use crate::cache::SqliteTtlCache;
use crate::velocity::SqliteCounterStore;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cache_entries: u64,
    pub counters: u64,
}

pub struct ExpirySweeper {
    cache: SqliteTtlCache,
    counters: SqliteCounterStore,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(cache: SqliteTtlCache, counters: SqliteCounterStore) -> Self {
        ExpirySweeper {
            cache,
            counters,
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Zero is ignored.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.interval = interval;
        }
        self
    }

    /// Sweeps both tables. A failure in one does not skip the other.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        match self.cache.purge_expired().await {
            Ok(n) => report.cache_entries = n,
            Err(e) => error!(error = %e, "Cache sweep failed"),
        }
        match self.counters.purge_expired(Utc::now()).await {
            Ok(n) => report.counters = n,
            Err(e) => error!(error = %e, "Velocity counter sweep failed"),
        }
        report
    }
}

#[async_trait]
impl PeriodicTask for ExpirySweeper {
    fn name(&self) -> &'static str {
        "expiry_sweeper"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self, _shutdown: &CancellationToken) {
        let report = self.sweep_once().await;
        if report != SweepReport::default() {
            debug!(
                cache_entries = report.cache_entries,
                counters = report.counters,
                "Expired rows swept"
            );
        }
    }
}
