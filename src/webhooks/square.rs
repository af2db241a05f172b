//! Square payment notifications.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::provider::{
    CorrelationMetadata, ParseError, ParsedWebhook, PaymentNotification, SignatureRejection,
    WebhookProvider,
};
use super::signature::{SignatureVerifier, SquareVerifier};
use crate::types::EventId;

pub const PROVIDER: &str = "square";

/// Square's terminal success status for a payment.
pub const COMPLETED: &str = "COMPLETED";

#[derive(Debug, Default, Deserialize)]
struct SquareEvent {
    #[serde(default)]
    id: String,
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    data: SquareData,
}

#[derive(Debug, Default, Deserialize)]
struct SquareData {
    #[serde(default)]
    object: SquareObject,
}

#[derive(Debug, Default, Deserialize)]
struct SquareObject {
    #[serde(default)]
    payment: SquarePayment,
}

#[derive(Debug, Default, Deserialize)]
struct SquarePayment {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    order_id: String,
    #[serde(default)]
    amount_money: SquareMoney,
    #[serde(default)]
    card_details: SquareCardDetails,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct SquareCardDetails {
    #[serde(default)]
    card: SquareCard,
}

#[derive(Debug, Default, Deserialize)]
struct SquareCard {
    #[serde(default)]
    fingerprint: String,
}

#[derive(Debug, Default, Deserialize)]
struct SquareMoney {
    #[serde(default)]
    amount: i64,
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Square webhook source: 401 on bad signature, event id from `event_id`
/// falling back to `id`.
#[derive(Debug, Clone)]
pub struct SquareProvider {
    verifier: SquareVerifier,
}

impl SquareProvider {
    pub fn new(signature_key: impl Into<Vec<u8>>) -> Self {
        SquareProvider {
            verifier: SquareVerifier::new(signature_key),
        }
    }
}

impl WebhookProvider for SquareProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn verifier(&self) -> &dyn SignatureVerifier {
        &self.verifier
    }

    fn rejection(&self) -> SignatureRejection {
        SignatureRejection::Unauthorized
    }

    fn parse(&self, body: &[u8]) -> Result<ParsedWebhook, ParseError> {
        let event: SquareEvent = serde_json::from_slice(body)?;

        let event_id = EventId::new(&event.event_id)
            .or_else(|| EventId::new(&event.id))
            .ok_or(ParseError::MissingEventId)?;

        let payment = event.data.object.payment;
        let terminal = payment.status == COMPLETED;

        Ok(ParsedWebhook::Payment(PaymentNotification {
            provider: PROVIDER,
            event_id,
            terminal,
            status: payment.status,
            metadata: CorrelationMetadata::from_map(&payment.metadata),
            provider_ref: non_empty(payment.id),
            order_id: non_empty(payment.order_id),
            amount_cents: payment.amount_money.amount,
            occurred_at: event.created_at.unwrap_or_else(Utc::now),
            card_fingerprint: non_empty(payment.card_details.card.fingerprint),
            marks_deposit_paid: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Result<ParsedWebhook, ParseError> {
        SquareProvider::new("k").parse(value.to_string().as_bytes())
    }

    fn payment(parsed: ParsedWebhook) -> PaymentNotification {
        match parsed {
            ParsedWebhook::Payment(p) => p,
            other => panic!("expected payment, got {other:?}"),
        }
    }

    #[test]
    fn parses_completed_payment() {
        let n = payment(
            parse(json!({
                "event_id": "evt_1",
                "created_at": "2024-05-01T12:00:00Z",
                "data": {"object": {"payment": {
                    "id": "pay_1",
                    "status": "COMPLETED",
                    "order_id": "ord_1",
                    "amount_money": {"amount": 5000, "currency": "USD"},
                    "card_details": {"card": {"fingerprint": "sq-1-fp", "last_4": "1111"}},
                    "metadata": {"org_id": "o", "lead_id": "l", "booking_intent_id": "b"}
                }}}
            }))
            .unwrap(),
        );

        assert_eq!(n.provider, "square");
        assert_eq!(n.event_id.as_str(), "evt_1");
        assert!(n.terminal);
        assert_eq!(n.provider_ref.as_deref(), Some("pay_1"));
        assert_eq!(n.order_id.as_deref(), Some("ord_1"));
        assert_eq!(n.amount_cents, 5000);
        assert_eq!(n.card_fingerprint.as_deref(), Some("sq-1-fp"));
        assert!(n.metadata.is_complete());
        assert_eq!(n.occurred_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
        assert!(!n.marks_deposit_paid);
    }

    #[test]
    fn falls_back_to_id_for_event_id() {
        let n = payment(parse(json!({"id": "evt_fallback"})).unwrap());
        assert_eq!(n.event_id.as_str(), "evt_fallback");
        assert!(!n.terminal);
        assert!(n.provider_ref.is_none());
        assert!(n.card_fingerprint.is_none());
    }

    #[test]
    fn missing_event_id_is_an_error() {
        assert!(matches!(
            parse(json!({"event_id": " ", "id": ""})),
            Err(ParseError::MissingEventId)
        ));
    }

    #[test]
    fn non_terminal_status() {
        let n = payment(
            parse(json!({"event_id": "e", "data": {"object": {"payment": {"status": "APPROVED"}}}}))
                .unwrap(),
        );
        assert!(!n.terminal);
        assert_eq!(n.status, "APPROVED");
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            SquareProvider::new("k").parse(b"{not json"),
            Err(ParseError::Json(_))
        ));
    }
}
