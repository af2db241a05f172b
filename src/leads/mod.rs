//! Lead records, consumed by ingestion through [`LeadRepository`].
//!
//! Lead CRUD belongs to the wider application; this module carries only the
//! lookup and deposit-status update that payment ingestion needs, plus the
//! delayed-task handler that retries that update.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::db::{self, Database, StoreError};
use crate::delayed::{DelayedTask, TaskError, TaskHandler};
use crate::types::{LeadId, OrgId};

/// Delayed task kind for a deferred deposit-status update.
pub const DEPOSIT_STATUS_TASK: &str = "lead.deposit_status";

#[derive(Debug, Error)]
pub enum LeadError {
    #[error("lead not found: {0}")]
    NotFound(LeadId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for LeadError {
    fn from(e: sqlx::Error) -> Self {
        LeadError::Store(StoreError::Database(e))
    }
}

pub type Result<T> = std::result::Result<T, LeadError>;

/// A prospective patient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lead {
    pub id: LeadId,
    pub org_id: OrgId,
    pub name: String,
    pub phone: String,
    pub service_interest: String,
    pub deposit_status: Option<String>,
    pub priority_level: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(org_id: OrgId, name: impl Into<String>, phone: impl Into<String>) -> Self {
        Lead {
            id: LeadId::new_v4(),
            org_id,
            name: name.into(),
            phone: phone.into(),
            service_interest: String::new(),
            deposit_status: None,
            priority_level: None,
            created_at: Utc::now(),
        }
    }
}

/// Lead lookups used by ingestion.
#[async_trait]
pub trait LeadRepository: Send + Sync {
    /// Fetches a lead scoped to its tenant.
    async fn get_by_id(&self, org_id: OrgId, lead_id: LeadId) -> Result<Lead>;

    /// Records the lead's deposit status and priority.
    async fn update_deposit_status(&self, lead_id: LeadId, status: &str, priority: &str) -> Result<()>;
}

type LeadRow = (String, String, String, String, String, Option<String>, Option<String>, i64);

/// Leads in the shared SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteLeadRepository {
    db: Database,
}

impl SqliteLeadRepository {
    pub fn new(db: Database) -> Self {
        SqliteLeadRepository { db }
    }

    pub async fn insert(&self, lead: &Lead) -> Result<()> {
        let created = db::to_millis(lead.created_at);
        sqlx::query(
            "INSERT INTO leads
                (id, org_id, name, phone, service_interest, deposit_status, priority_level, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(lead.id.to_string())
        .bind(lead.org_id.to_string())
        .bind(&lead.name)
        .bind(&lead.phone)
        .bind(&lead.service_interest)
        .bind(&lead.deposit_status)
        .bind(&lead.priority_level)
        .bind(created)
        .bind(created)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    fn lead_from_row(row: LeadRow) -> Result<Lead> {
        let (id, org_id, name, phone, service_interest, deposit_status, priority_level, created_at) =
            row;
        Ok(Lead {
            id: LeadId(db::parse_uuid("leads", &id)?),
            org_id: OrgId(db::parse_uuid("leads", &org_id)?),
            name,
            phone,
            service_interest,
            deposit_status,
            priority_level,
            created_at: db::from_millis("leads", created_at)?,
        })
    }
}

#[async_trait]
impl LeadRepository for SqliteLeadRepository {
    async fn get_by_id(&self, org_id: OrgId, lead_id: LeadId) -> Result<Lead> {
        let row: Option<LeadRow> = sqlx::query_as(
            "SELECT id, org_id, name, phone, service_interest, deposit_status, priority_level, created_at
             FROM leads WHERE id = ? AND org_id = ?",
        )
        .bind(lead_id.to_string())
        .bind(org_id.to_string())
        .fetch_optional(self.db.pool())
        .await?;

        match row {
            Some(row) => Self::lead_from_row(row),
            None => Err(LeadError::NotFound(lead_id)),
        }
    }

    async fn update_deposit_status(&self, lead_id: LeadId, status: &str, priority: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE leads SET deposit_status = ?, priority_level = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(priority)
        .bind(db::to_millis(Utc::now()))
        .bind(lead_id.to_string())
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(LeadError::NotFound(lead_id));
        }
        Ok(())
    }
}

/// Payload of a [`DEPOSIT_STATUS_TASK`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositStatusUpdate {
    pub lead_id: LeadId,
    pub status: String,
    pub priority: String,
}

/// Applies deferred deposit-status updates.
pub struct DepositStatusTaskHandler {
    leads: Arc<dyn LeadRepository>,
}

impl DepositStatusTaskHandler {
    pub fn new(leads: Arc<dyn LeadRepository>) -> Self {
        DepositStatusTaskHandler { leads }
    }
}

#[async_trait]
impl TaskHandler for DepositStatusTaskHandler {
    async fn run(&self, task: &DelayedTask) -> std::result::Result<(), TaskError> {
        let update: DepositStatusUpdate = task.decode().map_err(TaskError::permanent)?;
        match self
            .leads
            .update_deposit_status(update.lead_id, &update.status, &update.priority)
            .await
        {
            Ok(()) => {
                info!(lead_id = %update.lead_id, status = %update.status, "Deferred deposit status applied");
                Ok(())
            }
            Err(e @ LeadError::NotFound(_)) => Err(TaskError::permanent(e)),
            Err(e) => Err(TaskError::transient(e)),
        }
    }
}
