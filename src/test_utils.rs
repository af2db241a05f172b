//! Shared test doubles and fixtures.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::clients::{ClientError, OrderMetadataFetcher};
use crate::db::{Database, StoreError};
use crate::leads::{Lead, LeadError, LeadRepository, SqliteLeadRepository};
use crate::messaging::{HostedOrderClient, HostedOrderStatus, MessageSender, SendRequest, SendResponse};
use crate::numbers::StaticNumberResolver;
use crate::outbox::{DeliveryError, DeliveryHandler, OutboxEntry};
use crate::payments::{NewPayment, PaymentStore};
use crate::types::{EventId, LeadId, OrgId, PaymentId};
use crate::webhooks::{CorrelationMetadata, PaymentIngestor, PaymentNotification};

/// An unsaved outbox entry with a fresh id.
pub fn outbox_entry(event_type: &str, payload: &[u8]) -> OutboxEntry {
    OutboxEntry {
        id: Uuid::new_v4(),
        aggregate_key: "org".to_string(),
        event_type: event_type.to_string(),
        payload: payload.to_vec(),
        created_at: Utc::now(),
        delivered_at: None,
    }
}

/// Records the entries it delivered and fails the ones it is told to.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<Uuid>>,
    failing: Mutex<HashSet<Uuid>>,
}

impl RecordingHandler {
    pub fn failing_on(ids: impl IntoIterator<Item = Uuid>) -> Self {
        RecordingHandler {
            seen: Mutex::default(),
            failing: Mutex::new(ids.into_iter().collect()),
        }
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Ids of successfully handled entries, in order.
    pub fn seen(&self) -> Vec<Uuid> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryHandler for RecordingHandler {
    async fn handle(&self, entry: &OutboxEntry) -> Result<(), DeliveryError> {
        if self.failing.lock().unwrap().contains(&entry.id) {
            return Err(DeliveryError::new("injected failure"));
        }
        self.seen.lock().unwrap().push(entry.id);
        Ok(())
    }
}

/// Message sender that records every request.
#[derive(Debug, Clone)]
pub struct FakeSender {
    response: Option<SendResponse>,
    sent: Arc<Mutex<Vec<SendRequest>>>,
}

impl FakeSender {
    pub fn succeeding(id: &str, status: &str) -> Self {
        FakeSender {
            response: Some(SendResponse {
                id: id.to_string(),
                status: status.to_string(),
            }),
            sent: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        FakeSender {
            response: None,
            sent: Arc::default(),
        }
    }

    /// Every request received, including failed ones.
    pub fn sent(&self) -> Vec<SendRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSender for FakeSender {
    async fn send(&self, request: &SendRequest) -> Result<SendResponse, ClientError> {
        self.sent.lock().unwrap().push(request.clone());
        match &self.response {
            Some(response) => Ok(SendResponse {
                id: response.id.clone(),
                status: response.status.clone(),
            }),
            None => Err(ClientError::Status {
                status: 503,
                body: "unavailable".to_string(),
            }),
        }
    }
}

/// Hosted-order client answering from a fixed table.
#[derive(Debug, Clone, Default)]
pub struct FakeHostedClient {
    orders: HashMap<String, (String, String)>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeHostedClient {
    pub fn with_status(mut self, order_id: &str, status: &str, last_error: &str) -> Self {
        self.orders
            .insert(order_id.to_string(), (status.to_string(), last_error.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostedOrderClient for FakeHostedClient {
    async fn get_hosted_order(&self, order_id: &str) -> Result<HostedOrderStatus, ClientError> {
        self.calls.lock().unwrap().push(order_id.to_string());
        match self.orders.get(order_id) {
            Some((status, last_error)) => Ok(HostedOrderStatus {
                id: order_id.to_string(),
                phone_number: String::new(),
                status: status.clone(),
                last_error: last_error.clone(),
            }),
            None => Err(ClientError::Status {
                status: 404,
                body: "not found".to_string(),
            }),
        }
    }
}

/// Order metadata for a single known order.
#[derive(Debug, Clone)]
pub struct FixedOrders {
    order_id: String,
    metadata: HashMap<String, String>,
}

impl FixedOrders {
    pub fn new(order_id: &str, metadata: HashMap<String, String>) -> Self {
        FixedOrders {
            order_id: order_id.to_string(),
            metadata,
        }
    }
}

#[async_trait]
impl OrderMetadataFetcher for FixedOrders {
    async fn fetch_metadata(&self, order_id: &str) -> crate::clients::Result<HashMap<String, String>> {
        if order_id == self.order_id {
            Ok(self.metadata.clone())
        } else {
            Err(ClientError::Status {
                status: 404,
                body: "order not found".to_string(),
            })
        }
    }
}

/// Lead repository whose reads work and whose writes always fail.
#[derive(Debug, Clone)]
pub struct FlakyLeads {
    lead: Lead,
}

impl FlakyLeads {
    pub fn new(lead: Lead) -> Self {
        FlakyLeads { lead }
    }
}

#[async_trait]
impl LeadRepository for FlakyLeads {
    async fn get_by_id(&self, org_id: OrgId, lead_id: LeadId) -> Result<Lead, LeadError> {
        if org_id == self.lead.org_id && lead_id == self.lead.id {
            Ok(self.lead.clone())
        } else {
            Err(LeadError::NotFound(lead_id))
        }
    }

    async fn update_deposit_status(&self, _: LeadId, _: &str, _: &str) -> Result<(), LeadError> {
        Err(LeadError::Store(StoreError::InvalidArgument("lead store offline")))
    }
}

/// A tenant with one lead and one pending payment in an in-memory database.
pub struct Fixture {
    pub db: Database,
    pub org_id: OrgId,
    pub lead: Lead,
    pub payment_id: PaymentId,
    pub provider_ref: String,
}

impl Fixture {
    pub async fn new() -> Self {
        let db = Database::in_memory().await.unwrap();
        let org_id = OrgId::new_v4();
        let lead = Lead::new(org_id, "Ada Patient", "+15552223333");
        SqliteLeadRepository::new(db.clone()).insert(&lead).await.unwrap();

        let provider_ref = "pi_fixture".to_string();
        let payment = PaymentStore::new(db.clone())
            .create(NewPayment {
                org_id,
                lead_id: Some(lead.id),
                provider: "stripe".to_string(),
                provider_ref: Some(provider_ref.clone()),
                amount_cents: 5000,
            })
            .await
            .unwrap();

        Fixture {
            db,
            org_id,
            lead,
            payment_id: payment.id,
            provider_ref,
        }
    }

    /// Complete correlation ids for the fixture's lead and payment.
    pub fn metadata(&self) -> CorrelationMetadata {
        CorrelationMetadata {
            org_id: Some(self.org_id.to_string()),
            lead_id: Some(self.lead.id.to_string()),
            booking_intent_id: Some(self.payment_id.to_string()),
            ..CorrelationMetadata::default()
        }
    }

    pub fn ingestor(&self) -> PaymentIngestor {
        PaymentIngestor::new(
            self.db.clone(),
            Arc::new(SqliteLeadRepository::new(self.db.clone())),
            Arc::new(StaticNumberResolver::new().with_fallback("+15550009999")),
        )
    }
}

/// A Stripe-shaped notification carrying `metadata`, or none.
pub fn payment_notification(
    event_id: &str,
    metadata: Option<&CorrelationMetadata>,
    terminal: bool,
) -> PaymentNotification {
    PaymentNotification {
        provider: "stripe",
        event_id: EventId::new(event_id).unwrap(),
        status: if terminal { "paid" } else { "unpaid" }.to_string(),
        terminal,
        metadata: metadata.cloned().unwrap_or_default(),
        provider_ref: None,
        order_id: None,
        amount_cents: 5000,
        occurred_at: Utc::now(),
        card_fingerprint: None,
        marks_deposit_paid: true,
    }
}
