//! Provider abstraction and the normalized notification it produces.
//!
//! A [`WebhookProvider`] pairs a signature verifier with a payload parser. The
//! HTTP layer looks providers up by name in a [`ProviderRegistry`], so adding
//! a provider means registering one more implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::signature::SignatureVerifier;
use crate::types::EventId;

/// Errors from decoding a provider payload.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Body is not JSON of the expected shape.
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    /// No usable event identifier in the payload.
    #[error("missing event id")]
    MissingEventId,
}

/// How a provider expects a failed signature to be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureRejection {
    /// 401
    Unauthorized,
    /// 403
    Forbidden,
}

/// Correlation fields carried in provider metadata.
///
/// Blank values are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationMetadata {
    pub org_id: Option<String>,
    pub lead_id: Option<String>,
    pub booking_intent_id: Option<String>,
    /// RFC 3339 appointment time, if the checkout carried one.
    pub scheduled_for: Option<String>,
    pub from_number: Option<String>,
}

impl CorrelationMetadata {
    pub fn from_map<S: std::hash::BuildHasher>(map: &HashMap<String, String, S>) -> Self {
        let field = |key: &str| {
            map.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        CorrelationMetadata {
            org_id: field("org_id"),
            lead_id: field("lead_id"),
            booking_intent_id: field("booking_intent_id"),
            scheduled_for: field("scheduled_for"),
            from_number: field("from_number"),
        }
    }

    /// True when tenant, lead and intent are all present.
    pub fn is_complete(&self) -> bool {
        self.org_id.is_some() && self.lead_id.is_some() && self.booking_intent_id.is_some()
    }
}

/// A provider payment event reduced to what ingestion needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotification {
    pub provider: &'static str,
    pub event_id: EventId,
    /// Provider status, verbatim.
    pub status: String,
    /// True when the status is the provider's terminal success state.
    pub terminal: bool,
    pub metadata: CorrelationMetadata,
    /// Provider's payment identifier, used for the payment-row fallback.
    pub provider_ref: Option<String>,
    /// Provider's order identifier, used for the order-metadata fallback.
    pub order_id: Option<String>,
    pub amount_cents: i64,
    pub occurred_at: DateTime<Utc>,
    /// Provider fingerprint of the card used, when the payload carries one.
    pub card_fingerprint: Option<String>,
    /// Whether a committed payment should also mark the lead's deposit paid.
    pub marks_deposit_paid: bool,
}

/// Result of parsing a verified payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedWebhook {
    Payment(PaymentNotification),
    /// A well-formed event this relay does not act on.
    Ignored { event_id: EventId, event_type: String },
}

/// A webhook source.
pub trait WebhookProvider: Send + Sync {
    /// Path segment and idempotency namespace, e.g. `square`.
    fn name(&self) -> &'static str;

    fn verifier(&self) -> &dyn SignatureVerifier;

    fn rejection(&self) -> SignatureRejection;

    fn parse(&self, body: &[u8]) -> Result<ParsedWebhook, ParseError>;
}

/// Providers keyed by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<&'static str, Arc<dyn WebhookProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a provider, replacing any existing one with the same name.
    pub fn register(mut self, provider: Arc<dyn WebhookProvider>) -> Self {
        self.providers.insert(provider.name(), provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn WebhookProvider>> {
        self.providers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.providers.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.providers.keys()).finish()
    }
}
