//! Refreshes hosted-number orders until the provider reports a terminal
//! state.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::PeriodicTask;
use crate::db::Result;
use crate::messaging::{HostedOrderClient, HostedOrderStore};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_BATCH_SIZE: u32 = 20;

/// Counts for one poll pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub fetched: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Polls the provider for each pending hosted order.
pub struct HostedPoller<C> {
    store: HostedOrderStore,
    client: C,
    interval: Duration,
    batch_size: u32,
}

impl<C: HostedOrderClient> HostedPoller<C> {
    pub fn new(store: HostedOrderStore, client: C) -> Self {
        HostedPoller {
            store,
            client,
            interval: DEFAULT_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Zero is ignored.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.interval = interval;
        }
        self
    }

    /// Zero is ignored.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        if batch_size > 0 {
            self.batch_size = batch_size;
        }
        self
    }

    /// Runs one poll pass. Per-order failures are logged and the order is
    /// left for the next pass.
    #[instrument(skip_all, fields(batch_size = self.batch_size))]
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> Result<PollReport> {
        let orders = self.store.pending(self.batch_size).await?;
        let mut report = PollReport {
            fetched: orders.len(),
            ..PollReport::default()
        };

        for order in &orders {
            if shutdown.is_cancelled() {
                debug!("Shutdown requested, stopping hosted order poll");
                break;
            }
            let Some(provider_order_id) = order.provider_order_id.as_deref().filter(|id| !id.is_empty())
            else {
                debug!(order_id = %order.id, "Hosted order has no provider id yet");
                report.skipped += 1;
                continue;
            };

            let status = match self.client.get_hosted_order(provider_order_id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(order_id = %order.id, provider_order_id, error = %e, "Hosted order poll failed");
                    report.skipped += 1;
                    continue;
                }
            };

            match self
                .store
                .update_status(order.id, &status.status, &status.last_error, Utc::now())
                .await
            {
                Ok(_) => {
                    if status.status != order.status {
                        info!(
                            order_id = %order.id,
                            from = %order.status,
                            to = %status.status,
                            "Hosted order status changed"
                        );
                    }
                    report.updated += 1;
                }
                Err(e) => {
                    error!(order_id = %order.id, error = %e, "Hosted order update failed");
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl<C: HostedOrderClient> PeriodicTask for HostedPoller<C> {
    fn name(&self) -> &'static str {
        "hosted_poller"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self, shutdown: &CancellationToken) {
        if let Err(e) = self.poll_once(shutdown).await {
            error!(error = %e, "Hosted order poll pass failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::messaging::HostedOrder;
    use crate::test_utils::FakeHostedClient;
    use crate::types::OrgId;
    use uuid::Uuid;

    fn order(number: &str, provider_order_id: Option<&str>) -> HostedOrder {
        HostedOrder {
            id: Uuid::new_v4(),
            clinic_id: OrgId::new_v4(),
            e164_number: number.to_string(),
            provider_order_id: provider_order_id.map(str::to_string),
            status: "pending".to_string(),
            last_error: String::new(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn updates_orders_and_skips_failures() {
        let store = HostedOrderStore::new(Database::in_memory().await.unwrap());
        let activated = order("+15550000001", Some("ord-ok"));
        let erroring = order("+15550000002", Some("ord-err"));
        let unsubmitted = order("+15550000003", None);
        for o in [&activated, &erroring, &unsubmitted] {
            store.upsert(o).await.unwrap();
        }

        let client = FakeHostedClient::default().with_status("ord-ok", "active", "");
        let poller = HostedPoller::new(store.clone(), client.clone());

        let report = poller.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped, 2);

        assert_eq!(store.get(activated.id).await.unwrap().unwrap().status, "active");
        assert_eq!(store.get(erroring.id).await.unwrap().unwrap().status, "pending");

        // Failed order is polled again next pass.
        let again = poller.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(again.fetched, 2);
        let mut calls = client.calls();
        calls.sort();
        assert_eq!(calls, vec!["ord-err", "ord-err", "ord-ok"]);
    }

    #[tokio::test]
    async fn records_provider_error_text() {
        let store = HostedOrderStore::new(Database::in_memory().await.unwrap());
        let o = order("+15550000004", Some("ord-x"));
        store.upsert(&o).await.unwrap();
        let client = FakeHostedClient::default().with_status("ord-x", "failed", "ownership not verified");

        HostedPoller::new(store.clone(), client)
            .poll_once(&CancellationToken::new())
            .await
            .unwrap();

        let stored = store.get(o.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "failed");
        assert_eq!(stored.last_error, "ownership not verified");
    }
}
