//! Resends outbound messages whose earlier send failed.
//!
//! Each tick lists failed messages that still have attempts left and whose
//! retry time has come, then sends each again. A failure schedules the next
//! attempt `base * 2^attempts` later (capped at [`RetryConfig::max_delay`]);
//! the attempt that reaches [`RetryConfig::max_attempts`] leaves the message
//! `failed` for good.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{Backoff, PeriodicTask};
use crate::db::{self, Result};
use crate::messaging::{MessageSender, MessageStore, OutboundMessage, STATUS_QUEUED, SendRequest};

/// Retry sender tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total send attempts a message may use, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub interval: Duration,
    pub batch_size: u32,
}

impl RetryConfig {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_BATCH_SIZE: u32 = 25;

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay, self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            base_delay: Self::DEFAULT_BASE_DELAY,
            max_delay: Self::DEFAULT_MAX_DELAY,
            interval: Self::DEFAULT_INTERVAL,
            batch_size: Self::DEFAULT_BATCH_SIZE,
        }
    }
}

/// Counts for one retry pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    pub sent: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
}

/// Periodically resends failed messages.
pub struct RetrySender<S> {
    store: MessageStore,
    sender: S,
    config: RetryConfig,
}

impl<S: MessageSender> RetrySender<S> {
    pub fn new(store: MessageStore, sender: S) -> Self {
        RetrySender {
            store,
            sender,
            config: RetryConfig::default(),
        }
    }

    /// Zero is ignored.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        if max_attempts > 0 {
            self.config.max_attempts = max_attempts;
        }
        self
    }

    /// Zero is ignored.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        if !base_delay.is_zero() {
            self.config.base_delay = base_delay;
        }
        self
    }

    /// Zero is ignored.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.config.interval = interval;
        }
        self
    }

    /// Zero is ignored.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        if batch_size > 0 {
            self.config.batch_size = batch_size;
        }
        self
    }

    pub fn config(&self) -> RetryConfig {
        self.config
    }

    /// Delay before the next attempt after `attempts` have been used.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        self.config.backoff().delay_for_attempt(attempts)
    }

    pub async fn drain_once(&self, shutdown: &CancellationToken) -> Result<RetryReport> {
        self.drain_once_at(Utc::now(), shutdown).await
    }

    /// Runs one pass as if the time were `now`.
    #[instrument(skip_all, fields(max_attempts = self.config.max_attempts))]
    pub async fn drain_once_at(&self, now: DateTime<Utc>, shutdown: &CancellationToken) -> Result<RetryReport> {
        let candidates = self
            .store
            .list_retry_candidates(self.config.batch_size, self.config.max_attempts, now)
            .await?;
        let mut report = RetryReport::default();

        for message in &candidates {
            if shutdown.is_cancelled() {
                debug!("Shutdown requested, leaving remaining retries for later");
                break;
            }
            report.attempted += 1;
            if let Err(e) = self.retry_one(message, now, &mut report).await {
                error!(message_id = %message.id, error = %e, "Failed to record retry outcome");
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                sent = report.sent,
                rescheduled = report.rescheduled,
                exhausted = report.exhausted,
                "Retry pass complete"
            );
        }
        Ok(report)
    }

    async fn retry_one(&self, message: &OutboundMessage, now: DateTime<Utc>, report: &mut RetryReport) -> Result<()> {
        let request = SendRequest {
            from: message.from.clone(),
            to: message.to.clone(),
            body: message.body.clone(),
            media_urls: message.media_urls.clone(),
        };

        match self.sender.send(&request).await {
            Ok(response) => {
                let status = if response.status.is_empty() {
                    STATUS_QUEUED
                } else {
                    response.status.as_str()
                };
                self.store.mark_sent(message.id, &response.id, status, now).await?;
                info!(
                    message_id = %message.id,
                    provider_message_id = %response.id,
                    attempts = message.send_attempts + 1,
                    "Message resent"
                );
                report.sent += 1;
            }
            Err(e) => {
                let attempts = message.send_attempts.saturating_add(1);
                if attempts >= self.config.max_attempts {
                    self.store.mark_failed(message.id, now).await?;
                    error!(
                        message_id = %message.id,
                        attempts,
                        error = %e,
                        "Message send failed permanently"
                    );
                    report.exhausted += 1;
                } else {
                    let delay = self.next_delay(message.send_attempts);
                    self.store
                        .schedule_retry(message.id, db::add_duration(now, delay), now)
                        .await?;
                    warn!(
                        message_id = %message.id,
                        attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "Message resend failed, rescheduling"
                    );
                    report.rescheduled += 1;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: MessageSender> PeriodicTask for RetrySender<S> {
    fn name(&self) -> &'static str {
        "retry_sender"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn tick(&self, shutdown: &CancellationToken) {
        if let Err(e) = self.drain_once(shutdown).await {
            error!(error = %e, "Retry pass failed");
        }
    }
}
