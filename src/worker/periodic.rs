//! Shared loop for ticker-driven background workers.
//!
//! Each worker implements [`PeriodicTask`] and is driven by [`run_periodic`],
//! which ticks at the task's interval until the shutdown token is cancelled.
//! A tick that is in progress when shutdown fires is allowed to observe the
//! token and return early; the loop exits without starting another.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A unit of background work run on a fixed interval.
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    /// Name used in log fields.
    fn name(&self) -> &'static str;

    /// Time between ticks. Must be non-zero.
    fn interval(&self) -> Duration;

    /// Runs one tick. Implementations log their own failures and should
    /// check `shutdown` between items.
    async fn tick(&self, shutdown: &CancellationToken);
}

/// Drives `task` until `shutdown` is cancelled.
///
/// The first tick runs immediately. Ticks never overlap: a slow tick delays
/// the next one rather than bursting to catch up.
pub async fn run_periodic<T: PeriodicTask>(task: T, shutdown: CancellationToken) {
    let name = task.name();
    let interval = task.interval().max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(worker = name, interval_ms = interval.as_millis() as u64, "Worker started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => task.tick(&shutdown).await,
        }
    }

    info!(worker = name, "Worker stopped");
}
