//! Outbound messaging: the records the retry sender and hosted-order poller
//! work on, and the provider capabilities they call.
//!
//! # Message lifecycle
//!
//! ```text
//! pending_send ──send ok──▶ <provider status>
//!      │
//!      └──send err──▶ failed ──retry err──▶ retry_pending ──retry ok──▶ <provider status>
//!                                   │
//!                                   └──attempts exhausted──▶ failed (terminal)
//! ```
//!
//! A message in `failed` or `retry_pending` with attempts left is a retry
//! candidate once its `next_retry_at` has passed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clients::ClientError;

pub mod store;

pub use store::{HostedOrder, HostedOrderStore, MessageStore, NewOutboundMessage, OutboundMessage};

/// Recorded before the first send attempt.
pub const STATUS_PENDING_SEND: &str = "pending_send";
/// A send failed; eligible for retry while attempts remain.
pub const STATUS_FAILED: &str = "failed";
/// A retry failed and another is scheduled.
pub const STATUS_RETRY_PENDING: &str = "retry_pending";
/// Used when the provider accepts a message without reporting a status.
pub const STATUS_QUEUED: &str = "queued";

/// Hosted-order statuses that still need polling.
pub const HOSTED_PENDING_STATUSES: [&str; 3] = ["pending", "verifying", "documents_submitted"];

/// One outbound SMS or MMS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendRequest {
    pub from: String,
    pub to: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_urls: Vec<String>,
}

/// The provider's acknowledgement of a send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SendResponse {
    pub id: String,
    #[serde(default)]
    pub status: String,
}

/// Provider view of a hosted-number order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostedOrderStatus {
    pub id: String,
    #[serde(default)]
    pub phone_number: String,
    pub status: String,
    #[serde(default)]
    pub last_error: String,
}

/// Sends outbound messages.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, request: &SendRequest) -> Result<SendResponse, ClientError>;
}

/// Reads hosted-number order state from the provider.
#[async_trait]
pub trait HostedOrderClient: Send + Sync {
    async fn get_hosted_order(&self, order_id: &str) -> Result<HostedOrderStatus, ClientError>;
}
