//! Background delivery of pending outbox entries.
//!
//! Every tick the deliverer fetches a batch of undelivered entries in creation
//! order, hands each to the [`DeliveryHandler`], and marks it delivered only
//! after the handler succeeds. A failed entry stays pending and is retried on
//! a later tick, so delivery is at-least-once and handlers must tolerate
//! repeats.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::store::{OutboxEntry, OutboxStore};
use crate::db::Result;
use crate::worker::PeriodicTask;

/// Default time between delivery passes.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// Default number of entries fetched per pass.
pub const DEFAULT_BATCH_SIZE: u32 = 25;

/// Error returned by a delivery handler.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DeliveryError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl DeliveryError {
    pub fn new(message: impl Into<String>) -> Self {
        DeliveryError {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        DeliveryError {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Consumes outbox entries. Must be idempotent per entry id.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, entry: &OutboxEntry) -> std::result::Result<(), DeliveryError>;
}

#[async_trait]
impl<H: DeliveryHandler + ?Sized> DeliveryHandler for Arc<H> {
    async fn handle(&self, entry: &OutboxEntry) -> std::result::Result<(), DeliveryError> {
        (**self).handle(entry).await
    }
}

/// Counts for a single delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub fetched: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Polls the outbox and delivers entries to a handler.
pub struct Deliverer<H> {
    store: OutboxStore,
    handler: H,
    interval: Duration,
    batch_size: u32,
}

impl<H: DeliveryHandler> Deliverer<H> {
    pub fn new(store: OutboxStore, handler: H) -> Self {
        Deliverer {
            store,
            handler,
            interval: DEFAULT_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Overrides the poll interval. Zero is ignored.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.interval = interval;
        }
        self
    }

    /// Overrides the batch size. Zero is ignored.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        if batch_size > 0 {
            self.batch_size = batch_size;
        }
        self
    }

    /// Runs one delivery pass.
    ///
    /// Only a failure to fetch is returned as an error. Handler failures and
    /// failures to mark an entry delivered are logged and counted; those
    /// entries remain pending.
    #[instrument(skip_all, fields(batch_size = self.batch_size))]
    pub async fn drain_once(&self, shutdown: &CancellationToken) -> Result<DrainReport> {
        let entries = self.store.fetch_pending(self.batch_size).await?;
        let mut report = DrainReport {
            fetched: entries.len(),
            ..DrainReport::default()
        };

        for entry in &entries {
            if shutdown.is_cancelled() {
                debug!("Shutdown requested, abandoning remainder of batch");
                break;
            }

            if let Err(e) = self.handler.handle(entry).await {
                warn!(
                    outbox_id = %entry.id,
                    event_type = %entry.event_type,
                    error = %e,
                    "Outbox handler failed; entry stays pending"
                );
                report.failed += 1;
                continue;
            }

            match self.store.mark_delivered(entry.id).await {
                Ok(true) => report.delivered += 1,
                Ok(false) => {
                    debug!(outbox_id = %entry.id, "Entry was already marked delivered");
                }
                Err(e) => {
                    warn!(
                        outbox_id = %entry.id,
                        error = %e,
                        "Failed to mark outbox entry delivered; it will be redelivered"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.fetched > 0 {
            info!(
                fetched = report.fetched,
                delivered = report.delivered,
                failed = report.failed,
                "Outbox pass complete"
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl<H: DeliveryHandler> PeriodicTask for Deliverer<H> {
    fn name(&self) -> &'static str {
        "outbox_deliverer"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self, shutdown: &CancellationToken) {
        if let Err(e) = self.drain_once(shutdown).await {
            error!(error = %e, "Failed to fetch pending outbox entries");
        }
    }
}
