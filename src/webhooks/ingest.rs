//! Turns verified payment notifications into committed state changes.
//!
//! # Flow
//!
//! 1. An event already claimed is acknowledged without work.
//! 2. Non-terminal statuses are acknowledged without work.
//! 3. Correlation ids come from the payload metadata, else from the payment
//!    row matching the provider's payment id, else from the provider order's
//!    metadata. An event that still cannot be correlated is acknowledged and
//!    logged; nothing is mutated.
//! 4. One transaction claims the event, marks the payment succeeded and
//!    inserts a `payment_succeeded.v1` outbox entry. If the claim loses a
//!    race the transaction is rolled back and the event is a duplicate.
//! 5. After commit, providers that carry deposit checkouts mark the lead's
//!    deposit paid. A failure there is deferred to the delayed task queue.
//! 6. When velocity checks are configured, the committed payment counts
//!    toward the lead phone's deposit window and the card's phone set.
//!    Exceeded limits flag the payment in the log; the payment stands.
//!
//! Any storage failure before commit rolls everything back and leaves the
//! event unclaimed, so the provider's retry is processed fresh.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::events::{PAYMENT_SUCCEEDED_V1, PaymentSucceededV1};
use super::provider::{CorrelationMetadata, PaymentNotification};
use crate::clients::OrderMetadataFetcher;
use crate::db::{self, Database, StoreError};
use crate::delayed::DelayedTaskQueue;
use crate::idempotency::IdempotencyGuard;
use crate::leads::{DEPOSIT_STATUS_TASK, DepositStatusUpdate, LeadError, LeadRepository};
use crate::numbers::NumberResolver;
use crate::outbox::OutboxStore;
use crate::payments::{PaymentStatus, PaymentStore};
use crate::types::{InvalidId, LeadId, OrgId, PaymentId};
use crate::velocity::VelocityChecker;

/// Deposit status recorded on the lead after a paid checkout.
pub const DEPOSIT_PAID: &str = "paid";
/// Priority level recorded alongside [`DEPOSIT_PAID`].
pub const DEPOSIT_PRIORITY: &str = "priority";
/// Delay before a failed deposit-status update is retried.
pub const DEPOSIT_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum IngestError {
    /// Storage failed; nothing was committed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A correlation id is present but malformed.
    #[error(transparent)]
    InvalidId(#[from] InvalidId),

    /// The correlated lead does not exist in the tenant.
    #[error("lead not found: {0}")]
    LeadNotFound(LeadId),

    /// The correlated payment row does not exist.
    #[error("payment not found: {0}")]
    PaymentNotFound(PaymentId),

    /// The lead repository failed.
    #[error("lead lookup failed: {0}")]
    Lead(LeadError),
}

impl From<sqlx::Error> for IngestError {
    fn from(e: sqlx::Error) -> Self {
        IngestError::Store(StoreError::Database(e))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// What ingestion did with a notification. Every variant is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// State changed and an outbox entry was written.
    Processed { outbox_id: Uuid },
    /// The event was claimed earlier, or concurrently by another request.
    Duplicate,
    /// The payment is not in its terminal success state.
    NotTerminal,
    /// Terminal, but no correlation ids could be found.
    Unreconciled,
}

/// Applies payment notifications.
#[derive(Clone)]
pub struct PaymentIngestor {
    db: Database,
    guard: IdempotencyGuard,
    payments: PaymentStore,
    leads: Arc<dyn LeadRepository>,
    numbers: Arc<dyn NumberResolver>,
    orders: Option<Arc<dyn OrderMetadataFetcher>>,
    tasks: Option<DelayedTaskQueue>,
    velocity: Option<VelocityChecker>,
}

impl PaymentIngestor {
    pub fn new(db: Database, leads: Arc<dyn LeadRepository>, numbers: Arc<dyn NumberResolver>) -> Self {
        PaymentIngestor {
            guard: IdempotencyGuard::new(db.clone()),
            payments: PaymentStore::new(db.clone()),
            db,
            leads,
            numbers,
            orders: None,
            tasks: None,
            velocity: None,
        }
    }

    /// Enables the order-metadata fallback.
    pub fn with_order_fetcher(mut self, orders: Arc<dyn OrderMetadataFetcher>) -> Self {
        self.orders = Some(orders);
        self
    }

    /// Defers failed post-commit lead updates to `tasks`.
    pub fn with_task_queue(mut self, tasks: DelayedTaskQueue) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Screens committed payments with `velocity`.
    pub fn with_velocity(mut self, velocity: VelocityChecker) -> Self {
        self.velocity = Some(velocity);
        self
    }

    #[instrument(skip_all, fields(provider = notification.provider, event_id = %notification.event_id))]
    pub async fn ingest(&self, notification: &PaymentNotification) -> Result<IngestOutcome> {
        let provider = notification.provider;
        let event_id = notification.event_id.as_str();

        if self.guard.already_claimed(provider, event_id).await? {
            info!("Event already processed");
            return Ok(IngestOutcome::Duplicate);
        }

        if !notification.terminal {
            debug!(status = %notification.status, "Non-terminal payment status, nothing to do");
            return Ok(IngestOutcome::NotTerminal);
        }

        let Some(metadata) = self.resolve_correlation(notification).await? else {
            warn!(
                provider_ref = notification.provider_ref.as_deref().unwrap_or(""),
                order_id = notification.order_id.as_deref().unwrap_or(""),
                "Terminal payment without correlation metadata; acknowledging without changes"
            );
            return Ok(IngestOutcome::Unreconciled);
        };

        let org_id = OrgId::parse(metadata.org_id.as_deref().unwrap_or_default())?;
        let lead_id = LeadId::parse(metadata.lead_id.as_deref().unwrap_or_default())?;
        let payment_id = PaymentId::parse(metadata.booking_intent_id.as_deref().unwrap_or_default())?;
        let scheduled_for = metadata.scheduled_for.as_deref().and_then(parse_scheduled_for);

        let lead = match self.leads.get_by_id(org_id, lead_id).await {
            Ok(lead) => lead,
            Err(LeadError::NotFound(id)) => return Err(IngestError::LeadNotFound(id)),
            Err(e) => return Err(IngestError::Lead(e)),
        };

        let from_number = metadata
            .from_number
            .clone()
            .or_else(|| self.numbers.default_from_number(org_id))
            .unwrap_or_default();
        if from_number.is_empty() {
            warn!(org_id = %org_id, "No sender number for tenant");
        }

        let provider_ref = notification
            .provider_ref
            .clone()
            .unwrap_or_else(|| event_id.to_string());

        let event = PaymentSucceededV1 {
            event_id: event_id.to_string(),
            org_id: org_id.to_string(),
            lead_id: lead_id.to_string(),
            booking_intent_id: payment_id.to_string(),
            provider: provider.to_string(),
            provider_ref: provider_ref.clone(),
            amount_cents: notification.amount_cents,
            occurred_at: notification.occurred_at,
            lead_phone: lead.phone.clone(),
            lead_name: lead.name.clone(),
            service_name: lead.service_interest.clone(),
            from_number,
            scheduled_for,
        };

        let mut tx = self.db.begin().await?;
        if !IdempotencyGuard::claim_in(&mut tx, provider, event_id).await? {
            tx.rollback().await?;
            info!("Lost claim race, event processed concurrently");
            return Ok(IngestOutcome::Duplicate);
        }
        if !PaymentStore::update_status_in(&mut tx, payment_id, PaymentStatus::Succeeded, &provider_ref).await? {
            tx.rollback().await?;
            return Err(IngestError::PaymentNotFound(payment_id));
        }
        let outbox_id =
            OutboxStore::insert_json(&mut tx, &org_id.to_string(), PAYMENT_SUCCEEDED_V1, &event).await?;
        tx.commit().await?;

        info!(
            org_id = %org_id,
            lead_id = %lead_id,
            payment_id = %payment_id,
            outbox_id = %outbox_id,
            "Payment succeeded"
        );

        if notification.marks_deposit_paid {
            self.mark_deposit_paid(lead_id).await;
        }
        self.screen_velocity(org_id, payment_id, &lead.phone, notification.card_fingerprint.as_deref())
            .await;

        Ok(IngestOutcome::Processed { outbox_id })
    }

    /// Finds complete correlation ids for `notification`, or `None`.
    async fn resolve_correlation(
        &self,
        notification: &PaymentNotification,
    ) -> Result<Option<CorrelationMetadata>> {
        let metadata = &notification.metadata;
        if metadata.is_complete() {
            return Ok(Some(metadata.clone()));
        }

        if let Some(provider_ref) = notification.provider_ref.as_deref() {
            if let Some(payment) = self.payments.get_by_provider_ref(provider_ref).await? {
                if let Some(lead_id) = payment.lead_id {
                    debug!(provider_ref, payment_id = %payment.id, "Correlated via payment record");
                    let found = CorrelationMetadata {
                        org_id: Some(payment.org_id.to_string()),
                        lead_id: Some(lead_id.to_string()),
                        booking_intent_id: Some(payment.id.to_string()),
                        ..CorrelationMetadata::default()
                    };
                    return Ok(Some(fill_missing(metadata.clone(), found)));
                }
            }
        }

        if let (Some(orders), Some(order_id)) = (&self.orders, notification.order_id.as_deref()) {
            match orders.fetch_metadata(order_id).await {
                Ok(map) => {
                    let merged = fill_missing(metadata.clone(), CorrelationMetadata::from_map(&map));
                    if merged.is_complete() {
                        debug!(order_id, "Correlated via order metadata");
                        return Ok(Some(merged));
                    }
                }
                Err(e) => warn!(order_id, error = %e, "Order metadata lookup failed"),
            }
        }

        Ok(None)
    }

    async fn screen_velocity(
        &self,
        org_id: OrgId,
        payment_id: PaymentId,
        phone: &str,
        card_fingerprint: Option<&str>,
    ) {
        let Some(velocity) = &self.velocity else {
            return;
        };
        let org = org_id.to_string();
        let mut results = Vec::with_capacity(2);
        if !phone.is_empty() {
            results.push(velocity.check_deposit(&org, phone).await);
        }
        if let Some(fingerprint) = card_fingerprint {
            results.push(velocity.check_card(&org, fingerprint, phone).await);
        }
        for result in results.iter().filter(|r| !r.allowed) {
            warn!(
                payment_id = %payment_id,
                check_type = %result.check_type,
                count = result.current_count,
                max_allowed = result.max_allowed,
                "Payment flagged for review"
            );
        }
    }

    async fn mark_deposit_paid(&self, lead_id: LeadId) {
        let Err(e) = self
            .leads
            .update_deposit_status(lead_id, DEPOSIT_PAID, DEPOSIT_PRIORITY)
            .await
        else {
            debug!(lead_id = %lead_id, "Lead deposit marked paid");
            return;
        };

        warn!(lead_id = %lead_id, error = %e, "Deposit status update failed");
        let Some(tasks) = &self.tasks else {
            return;
        };
        let update = DepositStatusUpdate {
            lead_id,
            status: DEPOSIT_PAID.to_string(),
            priority: DEPOSIT_PRIORITY.to_string(),
        };
        let visible_after = db::add_duration(Utc::now(), DEPOSIT_RETRY_DELAY);
        match tasks.enqueue_json(DEPOSIT_STATUS_TASK, &update, visible_after).await {
            Ok(task_id) => info!(lead_id = %lead_id, task_id = %task_id, "Deposit status update deferred"),
            Err(e) => error!(lead_id = %lead_id, error = %e, "Could not defer deposit status update"),
        }
    }
}

/// Fills fields absent from `primary` with those from `fallback`.
fn fill_missing(primary: CorrelationMetadata, fallback: CorrelationMetadata) -> CorrelationMetadata {
    CorrelationMetadata {
        org_id: primary.org_id.or(fallback.org_id),
        lead_id: primary.lead_id.or(fallback.lead_id),
        booking_intent_id: primary.booking_intent_id.or(fallback.booking_intent_id),
        scheduled_for: primary.scheduled_for.or(fallback.scheduled_for),
        from_number: primary.from_number.or(fallback.from_number),
    }
}

fn parse_scheduled_for(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(at) => Some(at.with_timezone(&Utc)),
        Err(e) => {
            warn!(scheduled_for = %raw, error = %e, "Ignoring unparseable scheduled_for");
            None
        }
    }
}
