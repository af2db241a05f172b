//! Stock delivery handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::deliverer::{DeliveryError, DeliveryHandler};
use super::store::OutboxEntry;

/// Logs each entry and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl DeliveryHandler for LoggingHandler {
    async fn handle(&self, entry: &OutboxEntry) -> Result<(), DeliveryError> {
        info!(
            outbox_id = %entry.id,
            aggregate_key = %entry.aggregate_key,
            event_type = %entry.event_type,
            payload_bytes = entry.payload.len(),
            "Outbox event"
        );
        Ok(())
    }
}

/// Routes entries to handlers by event type.
///
/// Entries whose type has no route are acknowledged so an unknown event type
/// cannot wedge the outbox.
#[derive(Default, Clone)]
pub struct FanoutHandler {
    routes: HashMap<String, Vec<Arc<dyn DeliveryHandler>>>,
}

impl FanoutHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler for `event_type`. Several handlers may share a type;
    /// they run in registration order and the first failure stops the entry.
    pub fn route(mut self, event_type: impl Into<String>, handler: Arc<dyn DeliveryHandler>) -> Self {
        self.routes.entry(event_type.into()).or_default().push(handler);
        self
    }

    pub fn has_route(&self, event_type: &str) -> bool {
        self.routes.contains_key(event_type)
    }
}

#[async_trait]
impl DeliveryHandler for FanoutHandler {
    async fn handle(&self, entry: &OutboxEntry) -> Result<(), DeliveryError> {
        let Some(handlers) = self.routes.get(&entry.event_type) else {
            debug!(
                outbox_id = %entry.id,
                event_type = %entry.event_type,
                "No route for event type, acknowledging"
            );
            return Ok(());
        };

        for handler in handlers {
            handler.handle(entry).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingHandler, outbox_entry};

    #[tokio::test]
    async fn logging_handler_always_succeeds() {
        let entry = outbox_entry("anything.v1", b"{}");
        assert!(LoggingHandler.handle(&entry).await.is_ok());
    }

    #[tokio::test]
    async fn fanout_routes_by_event_type() {
        let payments = Arc::new(RecordingHandler::default());
        let other = Arc::new(RecordingHandler::default());
        let fanout = FanoutHandler::new()
            .route("payment_succeeded.v1", payments.clone())
            .route("lead_created.v1", other.clone());

        let entry = outbox_entry("payment_succeeded.v1", b"{}");
        fanout.handle(&entry).await.unwrap();

        assert_eq!(payments.seen(), vec![entry.id]);
        assert!(other.seen().is_empty());
    }

    #[tokio::test]
    async fn fanout_acknowledges_unrouted_types() {
        let fanout = FanoutHandler::new();
        assert!(!fanout.has_route("mystery.v1"));
        fanout.handle(&outbox_entry("mystery.v1", b"")).await.unwrap();
    }

    #[tokio::test]
    async fn fanout_stops_at_first_failure() {
        let entry = outbox_entry("payment_succeeded.v1", b"{}");
        let failing = Arc::new(RecordingHandler::failing_on([entry.id]));
        let after = Arc::new(RecordingHandler::default());
        let fanout = FanoutHandler::new()
            .route("payment_succeeded.v1", failing.clone())
            .route("payment_succeeded.v1", after.clone());

        assert!(fanout.handle(&entry).await.is_err());
        assert!(after.seen().is_empty());
    }
}
