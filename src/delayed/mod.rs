//! Durable delayed tasks.
//!
//! Work that must happen later, or be retried after a failure, is written to
//! `delayed_tasks` with a visible-after timestamp instead of being held in a
//! sleeping background task. Pending tasks survive restarts, can be inspected
//! and can be cancelled. [`DelayedTaskRunner`] executes them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::db::{self, Database, Result};

pub mod runner;

pub use runner::{DelayedTaskRunner, RunReport, RunnerConfig, TaskError, TaskHandler};

/// A stored task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedTask {
    pub id: Uuid,
    /// Selects the handler.
    pub kind: String,
    pub payload: Vec<u8>,
    /// Failed runs so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub visible_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl DelayedTask {
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    /// True while the task may still run.
    pub fn is_pending(&self) -> bool {
        self.completed_at.is_none() && self.cancelled_at.is_none()
    }
}

type TaskRow = (
    String,
    String,
    Vec<u8>,
    i64,
    Option<String>,
    i64,
    i64,
    Option<i64>,
    Option<i64>,
);

const SELECT_TASK: &str = "SELECT id, kind, payload, attempts, last_error, visible_after, created_at, completed_at, cancelled_at FROM delayed_tasks";

fn task_from_row(row: TaskRow) -> Result<DelayedTask> {
    let (id, kind, payload, attempts, last_error, visible_after, created_at, completed_at, cancelled_at) =
        row;
    let opt_time = |ms: Option<i64>| ms.map(|ms| db::from_millis("delayed_tasks", ms)).transpose();
    Ok(DelayedTask {
        id: db::parse_uuid("delayed_tasks", &id)?,
        kind,
        payload,
        attempts: attempts.clamp(0, i64::from(u32::MAX)) as u32,
        last_error,
        visible_after: db::from_millis("delayed_tasks", visible_after)?,
        created_at: db::from_millis("delayed_tasks", created_at)?,
        completed_at: opt_time(completed_at)?,
        cancelled_at: opt_time(cancelled_at)?,
    })
}

/// Queue operations on `delayed_tasks`.
#[derive(Debug, Clone)]
pub struct DelayedTaskQueue {
    db: Database,
}

impl DelayedTaskQueue {
    pub fn new(db: Database) -> Self {
        DelayedTaskQueue { db }
    }

    /// Stores a task that becomes runnable at `visible_after`.
    pub async fn enqueue(&self, kind: &str, payload: &[u8], visible_after: DateTime<Utc>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO delayed_tasks (id, kind, payload, attempts, visible_after, created_at)
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(id.to_string())
        .bind(kind)
        .bind(payload)
        .bind(db::to_millis(visible_after))
        .bind(db::to_millis(Utc::now()))
        .execute(self.db.pool())
        .await?;
        Ok(id)
    }

    pub async fn enqueue_json<T: Serialize>(
        &self,
        kind: &str,
        payload: &T,
        visible_after: DateTime<Utc>,
    ) -> Result<Uuid> {
        let bytes = serde_json::to_vec(payload)?;
        self.enqueue(kind, &bytes, visible_after).await
    }

    /// Pending tasks visible at `now`, earliest first.
    pub async fn fetch_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<DelayedTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "{SELECT_TASK}
             WHERE completed_at IS NULL AND cancelled_at IS NULL AND visible_after <= ?
             ORDER BY visible_after, created_at
             LIMIT ?"
        ))
        .bind(db::to_millis(now))
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(task_from_row).collect()
    }

    /// Marks a pending task done. Returns false if it was not pending.
    pub async fn complete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE delayed_tasks SET completed_at = ?
             WHERE id = ? AND completed_at IS NULL AND cancelled_at IS NULL",
        )
        .bind(db::to_millis(Utc::now()))
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Records a failed run and hides the task until `visible_after`.
    pub async fn reschedule(&self, id: Uuid, visible_after: DateTime<Utc>, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE delayed_tasks
             SET attempts = attempts + 1, last_error = ?, visible_after = ?
             WHERE id = ? AND completed_at IS NULL AND cancelled_at IS NULL",
        )
        .bind(error)
        .bind(db::to_millis(visible_after))
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Cancels a pending task, optionally recording why.
    pub async fn cancel(&self, id: Uuid, reason: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE delayed_tasks SET cancelled_at = ?, last_error = COALESCE(?, last_error)
             WHERE id = ? AND completed_at IS NULL AND cancelled_at IS NULL",
        )
        .bind(db::to_millis(Utc::now()))
        .bind(reason)
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<DelayedTask>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!("{SELECT_TASK} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.map(task_from_row).transpose()
    }

    pub async fn pending_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM delayed_tasks WHERE completed_at IS NULL AND cancelled_at IS NULL",
        )
        .fetch_one(self.db.pool())
        .await?;
        Ok(count.max(0) as u64)
    }
}
