//! Patient confirmation texts for committed payments.
//!
//! [`PaymentConfirmationHandler`] consumes `payment_succeeded.v1` outbox
//! entries. The outbound message id is derived from the outbox entry id, so a
//! redelivered entry finds its earlier message and does not text twice. A
//! send that fails is recorded as `failed` and left to the retry sender.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::messaging::{
    MessageSender, MessageStore, NewOutboundMessage, STATUS_PENDING_SEND, STATUS_QUEUED, SendRequest,
};
use crate::outbox::{DeliveryError, DeliveryHandler, OutboxEntry};
use crate::types::OrgId;
use crate::webhooks::events::{PAYMENT_SUCCEEDED_V1, PaymentSucceededV1};

/// Message id for the confirmation of an outbox entry.
pub fn confirmation_message_id(outbox_id: Uuid) -> Uuid {
    Uuid::new_v5(&outbox_id, b"payment_confirmation")
}

/// Formats cents as dollars, e.g. `$50.00`.
fn format_amount(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!("{sign}${}.{:02}", cents / 100, cents % 100)
}

pub fn confirmation_body(event: &PaymentSucceededV1) -> String {
    match event.scheduled_for {
        Some(at) => {
            let when = at.format("%A, %B %-d at %-I:%M %p UTC");
            match event.service_name.trim() {
                "" => format!("Payment received! Your appointment on {when} is confirmed."),
                service => format!("Payment received! Your {service} appointment on {when} is confirmed."),
            }
        }
        None => format!(
            "Payment of {} received - thank you! Our team will call you within 24 hours to confirm your appointment.",
            format_amount(event.amount_cents)
        ),
    }
}

/// Texts the patient when a payment succeeds.
pub struct PaymentConfirmationHandler<S> {
    messages: MessageStore,
    sender: S,
}

impl<S: MessageSender> PaymentConfirmationHandler<S> {
    pub fn new(messages: MessageStore, sender: S) -> Self {
        PaymentConfirmationHandler { messages, sender }
    }
}

fn store_failure(e: crate::db::StoreError) -> DeliveryError {
    DeliveryError::with_source("message store unavailable", e)
}

#[async_trait]
impl<S: MessageSender> DeliveryHandler for PaymentConfirmationHandler<S> {
    async fn handle(&self, entry: &OutboxEntry) -> Result<(), DeliveryError> {
        if entry.event_type != PAYMENT_SUCCEEDED_V1 {
            return Ok(());
        }
        // Undecodable payloads never become decodable.
        let event: PaymentSucceededV1 = match entry.decode() {
            Ok(event) => event,
            Err(e) => {
                error!(outbox_id = %entry.id, error = %e, "Undecodable payment event, skipping confirmation");
                return Ok(());
            }
        };
        let org_id = match OrgId::parse(&event.org_id) {
            Ok(org_id) => org_id,
            Err(e) => {
                error!(outbox_id = %entry.id, error = %e, "Payment event has bad org id, skipping confirmation");
                return Ok(());
            }
        };
        if event.lead_phone.trim().is_empty() || event.from_number.trim().is_empty() {
            warn!(
                outbox_id = %entry.id,
                lead_id = %event.lead_id,
                has_phone = !event.lead_phone.trim().is_empty(),
                has_from = !event.from_number.trim().is_empty(),
                "No phone or sender number, skipping confirmation"
            );
            return Ok(());
        }

        let message_id = confirmation_message_id(entry.id);
        match self.messages.get(message_id).await.map_err(store_failure)? {
            Some(existing) if existing.provider_status != STATUS_PENDING_SEND => {
                debug!(message_id = %message_id, status = %existing.provider_status, "Confirmation already handled");
                return Ok(());
            }
            Some(_) => {}
            None => {
                self.messages
                    .insert(&NewOutboundMessage {
                        id: message_id,
                        org_id,
                        from: event.from_number.clone(),
                        to: event.lead_phone.clone(),
                        body: confirmation_body(&event),
                        media_urls: Vec::new(),
                        provider_status: STATUS_PENDING_SEND.to_string(),
                    })
                    .await
                    .map_err(store_failure)?;
            }
        }

        let request = SendRequest {
            from: event.from_number.clone(),
            to: event.lead_phone.clone(),
            body: confirmation_body(&event),
            media_urls: Vec::new(),
        };
        let now = Utc::now();
        match self.sender.send(&request).await {
            Ok(response) => {
                let status = if response.status.is_empty() {
                    STATUS_QUEUED
                } else {
                    response.status.as_str()
                };
                self.messages
                    .mark_sent(message_id, &response.id, status, now)
                    .await
                    .map_err(store_failure)?;
                info!(
                    message_id = %message_id,
                    provider_message_id = %response.id,
                    lead_id = %event.lead_id,
                    "Payment confirmation sent"
                );
            }
            Err(e) => {
                self.messages
                    .mark_failed(message_id, now)
                    .await
                    .map_err(store_failure)?;
                warn!(message_id = %message_id, error = %e, "Payment confirmation failed, queued for retry");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::messaging::STATUS_FAILED;
    use crate::test_utils::{FakeSender, outbox_entry};
    use chrono::TimeZone;

    fn event(org: OrgId) -> PaymentSucceededV1 {
        PaymentSucceededV1 {
            event_id: "evt-1".to_string(),
            org_id: org.to_string(),
            lead_id: Uuid::new_v4().to_string(),
            booking_intent_id: Uuid::new_v4().to_string(),
            provider: "stripe".to_string(),
            provider_ref: "pi_1".to_string(),
            amount_cents: 5000,
            occurred_at: Utc::now(),
            lead_phone: "+15552223333".to_string(),
            lead_name: "Ada".to_string(),
            service_name: String::new(),
            from_number: "+15550001111".to_string(),
            scheduled_for: None,
        }
    }

    fn entry_for(event: &PaymentSucceededV1) -> OutboxEntry {
        outbox_entry(PAYMENT_SUCCEEDED_V1, &serde_json::to_vec(event).unwrap())
    }

    #[test]
    fn amounts_format_as_dollars() {
        assert_eq!(format_amount(5000), "$50.00");
        assert_eq!(format_amount(5), "$0.05");
        assert_eq!(format_amount(-125), "-$1.25");
    }

    #[test]
    fn scheduled_body_names_the_time() {
        let mut e = event(OrgId::new_v4());
        e.service_name = "Botox".to_string();
        e.scheduled_for = Some(Utc.with_ymd_and_hms(2024, 5, 3, 15, 30, 0).unwrap());
        assert_eq!(
            confirmation_body(&e),
            "Payment received! Your Botox appointment on Friday, May 3 at 3:30 PM UTC is confirmed."
        );
    }

    #[tokio::test]
    async fn sends_once_per_entry() {
        let store = MessageStore::new(Database::in_memory().await.unwrap());
        let sender = FakeSender::succeeding("prov-1", "");
        let handler = PaymentConfirmationHandler::new(store.clone(), sender.clone());
        let entry = entry_for(&event(OrgId::new_v4()));

        handler.handle(&entry).await.unwrap();
        handler.handle(&entry).await.unwrap();

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("$50.00"));
        let stored = store.get(confirmation_message_id(entry.id)).await.unwrap().unwrap();
        assert_eq!(stored.provider_status, STATUS_QUEUED);
        assert_eq!(stored.provider_message_id.as_deref(), Some("prov-1"));
    }

    #[tokio::test]
    async fn failed_send_is_left_for_retry() {
        let store = MessageStore::new(Database::in_memory().await.unwrap());
        let handler = PaymentConfirmationHandler::new(store.clone(), FakeSender::failing());
        let entry = entry_for(&event(OrgId::new_v4()));

        handler.handle(&entry).await.unwrap();

        let stored = store.get(confirmation_message_id(entry.id)).await.unwrap().unwrap();
        assert_eq!(stored.provider_status, STATUS_FAILED);
        assert_eq!(stored.send_attempts, 1);
        assert_eq!(store.list_retry_candidates(10, 5, Utc::now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_phone_is_skipped() {
        let store = MessageStore::new(Database::in_memory().await.unwrap());
        let sender = FakeSender::succeeding("p", "sent");
        let handler = PaymentConfirmationHandler::new(store.clone(), sender.clone());
        let mut e = event(OrgId::new_v4());
        e.lead_phone.clear();
        let entry = entry_for(&e);

        handler.handle(&entry).await.unwrap();
        assert!(sender.sent().is_empty());
        assert!(store.get(confirmation_message_id(entry.id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn other_event_types_are_ignored() {
        let store = MessageStore::new(Database::in_memory().await.unwrap());
        let sender = FakeSender::succeeding("p", "sent");
        let handler = PaymentConfirmationHandler::new(store, sender.clone());

        handler.handle(&outbox_entry("lead.created.v1", b"{}")).await.unwrap();
        assert!(sender.sent().is_empty());
    }
}
