//! Deposit payment records.
//!
//! A payment row is created when a checkout link is issued and is moved to
//! `succeeded` by webhook ingestion. Status updates made during ingestion run
//! on the caller's transaction.

use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::db::{self, Database, Result, StoreError};
use crate::types::{LeadId, OrgId, PaymentId};

/// Lifecycle of a deposit payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "succeeded" => Some(PaymentStatus::Succeeded),
            "failed" => Some(PaymentStatus::Failed),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored deposit payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub id: PaymentId,
    pub org_id: OrgId,
    pub lead_id: Option<LeadId>,
    pub provider: String,
    pub provider_ref: Option<String>,
    pub status: PaymentStatus,
    pub amount_cents: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a new pending payment.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub org_id: OrgId,
    pub lead_id: Option<LeadId>,
    pub provider: String,
    pub provider_ref: Option<String>,
    pub amount_cents: i64,
}

type PaymentRow = (String, String, Option<String>, String, Option<String>, String, i64, i64, i64);

const SELECT_PAYMENT: &str = "SELECT id, org_id, lead_id, provider, provider_ref, status, amount_cents, created_at, updated_at FROM payments";

fn payment_from_row(row: PaymentRow) -> Result<Payment> {
    let (id, org_id, lead_id, provider, provider_ref, status, amount_cents, created_at, updated_at) =
        row;
    let status = PaymentStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
        table: "payments",
        reason: format!("unknown status {status:?}"),
    })?;
    Ok(Payment {
        id: PaymentId(db::parse_uuid("payments", &id)?),
        org_id: OrgId(db::parse_uuid("payments", &org_id)?),
        lead_id: lead_id
            .map(|l| db::parse_uuid("payments", &l).map(LeadId))
            .transpose()?,
        provider,
        provider_ref,
        status,
        amount_cents,
        created_at: db::from_millis("payments", created_at)?,
        updated_at: db::from_millis("payments", updated_at)?,
    })
}

/// Payment row access.
#[derive(Debug, Clone)]
pub struct PaymentStore {
    db: Database,
}

impl PaymentStore {
    pub fn new(db: Database) -> Self {
        PaymentStore { db }
    }

    /// Inserts a pending payment and returns it.
    pub async fn create(&self, new: NewPayment) -> Result<Payment> {
        let id = PaymentId::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO payments
                (id, org_id, lead_id, provider, provider_ref, status, amount_cents, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(new.org_id.to_string())
        .bind(new.lead_id.map(|l| l.to_string()))
        .bind(&new.provider)
        .bind(&new.provider_ref)
        .bind(PaymentStatus::Pending.as_str())
        .bind(new.amount_cents)
        .bind(db::to_millis(now))
        .bind(db::to_millis(now))
        .execute(self.db.pool())
        .await?;

        self.get(id).await?.ok_or_else(|| StoreError::Corrupt {
            table: "payments",
            reason: format!("payment {id} missing after insert"),
        })
    }

    pub async fn get(&self, id: PaymentId) -> Result<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!("{SELECT_PAYMENT} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.map(payment_from_row).transpose()
    }

    /// Finds a payment by the provider's payment identifier.
    pub async fn get_by_provider_ref(&self, provider_ref: &str) -> Result<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "{SELECT_PAYMENT} WHERE provider_ref = ? ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(provider_ref)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(payment_from_row).transpose()
    }

    /// Sets status and provider reference on `conn`.
    ///
    /// Returns false if no payment has this id.
    pub async fn update_status_in(
        conn: &mut SqliteConnection,
        id: PaymentId,
        status: PaymentStatus,
        provider_ref: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE payments SET status = ?, provider_ref = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(provider_ref)
        .bind(db::to_millis(Utc::now()))
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
