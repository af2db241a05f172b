//! Stripe checkout session events.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::provider::{
    CorrelationMetadata, ParseError, ParsedWebhook, PaymentNotification, SignatureRejection,
    WebhookProvider,
};
use super::signature::{SignatureVerifier, StripeVerifier};
use crate::types::EventId;

pub const PROVIDER: &str = "stripe";

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
/// Sent once a session completed with an asynchronous payment method settles.
pub const CHECKOUT_SESSION_ASYNC_PAYMENT_SUCCEEDED: &str = "checkout.session.async_payment_succeeded";

#[derive(Debug, Default, Deserialize)]
struct StripeEvent {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    data: StripeData,
}

#[derive(Debug, Default, Deserialize)]
struct StripeData {
    #[serde(default)]
    object: StripeSession,
}

#[derive(Debug, Default, Deserialize)]
struct StripeSession {
    #[serde(default)]
    id: String,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl StripeSession {
    /// A completed session settles funds unless it is still awaiting an
    /// asynchronous payment method.
    fn is_paid(&self) -> bool {
        matches!(
            self.payment_status.as_deref(),
            None | Some("") | Some("paid") | Some("no_payment_required")
        )
    }
}

/// Stripe webhook source: 403 on bad signature, acts on completed and
/// async-settled checkout sessions, and marks the lead's deposit paid after
/// commit.
#[derive(Debug, Clone)]
pub struct StripeProvider {
    verifier: StripeVerifier,
}

impl StripeProvider {
    pub fn new(webhook_secret: impl Into<Vec<u8>>) -> Self {
        StripeProvider {
            verifier: StripeVerifier::new(webhook_secret),
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.verifier = self.verifier.with_tolerance(tolerance);
        self
    }
}

impl WebhookProvider for StripeProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn verifier(&self) -> &dyn SignatureVerifier {
        &self.verifier
    }

    fn rejection(&self) -> SignatureRejection {
        SignatureRejection::Forbidden
    }

    fn parse(&self, body: &[u8]) -> Result<ParsedWebhook, ParseError> {
        let event: StripeEvent = serde_json::from_slice(body)?;
        let event_id = EventId::new(&event.id).ok_or(ParseError::MissingEventId)?;

        let settled = match event.event_type.as_str() {
            CHECKOUT_SESSION_COMPLETED => false,
            CHECKOUT_SESSION_ASYNC_PAYMENT_SUCCEEDED => true,
            _ => {
                return Ok(ParsedWebhook::Ignored {
                    event_id,
                    event_type: event.event_type,
                });
            }
        };

        let session = event.data.object;
        let terminal = settled || session.is_paid();
        let status = if settled {
            "paid".to_string()
        } else {
            session
                .payment_status
                .clone()
                .or_else(|| session.status.clone())
                .unwrap_or_default()
        };

        let provider_ref = session
            .payment_intent
            .clone()
            .filter(|p| !p.trim().is_empty())
            .or_else(|| Some(session.id.trim().to_string()).filter(|s| !s.is_empty()));

        Ok(ParsedWebhook::Payment(PaymentNotification {
            provider: PROVIDER,
            event_id,
            status,
            terminal,
            metadata: CorrelationMetadata::from_map(&session.metadata),
            provider_ref,
            order_id: None,
            amount_cents: session.amount_total.unwrap_or(0).max(0),
            occurred_at: DateTime::from_timestamp(event.created, 0).unwrap_or_else(Utc::now),
            card_fingerprint: None,
            marks_deposit_paid: true,
        }))
    }
}
