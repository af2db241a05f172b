//! Executes due delayed tasks.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{DelayedTask, DelayedTaskQueue};
use crate::db::{self, Result};
use crate::worker::{Backoff, PeriodicTask};

type BoxError = Box<dyn StdError + Send + Sync>;

/// Failure reported by a task handler.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Worth retrying later.
    #[error("{0}")]
    Transient(BoxError),

    /// Will never succeed; the task is cancelled.
    #[error("{0}")]
    Permanent(BoxError),
}

impl TaskError {
    pub fn transient(e: impl Into<BoxError>) -> Self {
        TaskError::Transient(e.into())
    }

    pub fn permanent(e: impl Into<BoxError>) -> Self {
        TaskError::Permanent(e.into())
    }
}

/// Runs tasks of one kind.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &DelayedTask) -> std::result::Result<(), TaskError>;
}

/// Runner tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    pub interval: Duration,
    pub batch_size: u32,
    /// Runs allowed before a task is abandoned.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RunnerConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_BATCH_SIZE: u32 = 25;
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;
    pub const DEFAULT_BACKOFF: Backoff =
        Backoff::new(Duration::from_secs(30), Duration::from_secs(60 * 60));
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            interval: Self::DEFAULT_INTERVAL,
            batch_size: Self::DEFAULT_BATCH_SIZE,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            backoff: Self::DEFAULT_BACKOFF,
        }
    }
}

/// Counts for one runner pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub fetched: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub abandoned: usize,
    /// Tasks that ran but whose outcome could not be stored. They stay due.
    pub unrecorded: usize,
}

/// What to store for a task after it ran.
enum Disposition {
    Complete,
    Reschedule { visible_after: DateTime<Utc>, error: String },
    Abandon { reason: String },
}

/// Polls the queue and dispatches tasks by kind.
pub struct DelayedTaskRunner {
    queue: DelayedTaskQueue,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    config: RunnerConfig,
}

impl DelayedTaskRunner {
    pub fn new(queue: DelayedTaskQueue, config: RunnerConfig) -> Self {
        DelayedTaskRunner {
            queue,
            handlers: HashMap::new(),
            config,
        }
    }

    pub fn with_handler(mut self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(kind.into(), handler);
        self
    }

    /// Runs every task due now.
    #[instrument(skip_all)]
    pub async fn drain_once(&self, shutdown: &CancellationToken) -> Result<RunReport> {
        let now = Utc::now();
        let tasks = self.queue.fetch_due(now, self.config.batch_size).await?;
        let mut report = RunReport {
            fetched: tasks.len(),
            ..RunReport::default()
        };

        for task in &tasks {
            let Some(handler) = self.handlers.get(&task.kind) else {
                warn!(task_id = %task.id, kind = %task.kind, "No handler for delayed task, cancelling");
                let reason = "no handler for task kind".to_string();
                self.record(task, Disposition::Abandon { reason }, &mut report).await;
                continue;
            };

            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!(task_id = %task.id, "Shutdown during delayed task; it stays due");
                    break;
                }
                outcome = handler.run(task) => outcome,
            };

            let disposition = match outcome {
                Ok(()) => Disposition::Complete,
                Err(TaskError::Permanent(e)) => {
                    warn!(task_id = %task.id, kind = %task.kind, error = %e, "Delayed task failed permanently");
                    Disposition::Abandon { reason: e.to_string() }
                }
                Err(TaskError::Transient(e)) => {
                    let attempts = task.attempts.saturating_add(1);
                    if attempts >= self.config.max_attempts {
                        error!(
                            task_id = %task.id,
                            kind = %task.kind,
                            attempts,
                            error = %e,
                            "Delayed task exhausted its attempts, abandoning"
                        );
                        Disposition::Abandon { reason: e.to_string() }
                    } else {
                        let delay = self.config.backoff.delay_for_attempt(task.attempts);
                        warn!(
                            task_id = %task.id,
                            kind = %task.kind,
                            attempts,
                            retry_in_secs = delay.as_secs(),
                            error = %e,
                            "Delayed task failed, rescheduling"
                        );
                        Disposition::Reschedule {
                            visible_after: db::add_duration(Utc::now(), delay),
                            error: e.to_string(),
                        }
                    }
                }
            };
            self.record(task, disposition, &mut report).await;
        }

        if report.fetched > 0 {
            info!(
                fetched = report.fetched,
                completed = report.completed,
                rescheduled = report.rescheduled,
                abandoned = report.abandoned,
                unrecorded = report.unrecorded,
                "Delayed task pass complete"
            );
        }
        Ok(report)
    }

    /// Stores `disposition` for `task`. A store failure is logged and the
    /// pass moves on to the next task.
    async fn record(&self, task: &DelayedTask, disposition: Disposition, report: &mut RunReport) {
        let stored = match &disposition {
            Disposition::Complete => self.queue.complete(task.id).await,
            Disposition::Reschedule { visible_after, error } => {
                self.queue.reschedule(task.id, *visible_after, error).await
            }
            Disposition::Abandon { reason } => self.queue.cancel(task.id, Some(reason.as_str())).await,
        };

        match (stored, disposition) {
            (Err(e), _) => {
                error!(task_id = %task.id, kind = %task.kind, error = %e, "Could not record delayed task outcome");
                report.unrecorded += 1;
            }
            (Ok(_), Disposition::Complete) => report.completed += 1,
            (Ok(_), Disposition::Reschedule { .. }) => report.rescheduled += 1,
            (Ok(_), Disposition::Abandon { .. }) => report.abandoned += 1,
        }
    }
}

#[async_trait]
impl PeriodicTask for DelayedTaskRunner {
    fn name(&self) -> &'static str {
        "delayed_tasks"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn tick(&self, shutdown: &CancellationToken) {
        if let Err(e) = self.drain_once(shutdown).await {
            error!(error = %e, "Delayed task pass failed");
        }
    }
}
