//! Domain events produced by webhook ingestion and written to the outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outbox event type for a confirmed deposit payment.
pub const PAYMENT_SUCCEEDED_V1: &str = "payment_succeeded.v1";

/// A deposit payment reached its terminal success state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSucceededV1 {
    /// Provider event id that triggered the transition.
    pub event_id: String,
    pub org_id: String,
    pub lead_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub booking_intent_id: String,
    pub provider: String,
    pub provider_ref: String,
    pub amount_cents: i64,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lead_phone: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lead_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
}
