//! Order metadata lookup for payments whose webhook omits correlation
//! metadata.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{ClientError, Result, http_client, read_json};

pub const DEFAULT_BASE_URL: &str = "https://connect.squareup.com";

/// Fetches the custom metadata attached to a provider order.
#[async_trait]
pub trait OrderMetadataFetcher: Send + Sync {
    async fn fetch_metadata(&self, order_id: &str) -> Result<HashMap<String, String>>;
}

#[derive(Debug, Deserialize)]
struct OrderEnvelope {
    order: Order,
}

#[derive(Debug, Deserialize)]
struct Order {
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// Orders API client.
#[derive(Clone)]
pub struct SquareOrdersClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl std::fmt::Debug for SquareOrdersClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SquareOrdersClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SquareOrdersClient {
    /// An empty `base_url` selects [`DEFAULT_BASE_URL`].
    pub fn new(access_token: impl Into<String>, base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = if base_url.trim().is_empty() {
            DEFAULT_BASE_URL
        } else {
            base_url
        };
        Ok(SquareOrdersClient {
            http: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        })
    }
}

#[async_trait]
impl OrderMetadataFetcher for SquareOrdersClient {
    async fn fetch_metadata(&self, order_id: &str) -> Result<HashMap<String, String>> {
        if self.access_token.is_empty() || order_id.trim().is_empty() {
            return Err(ClientError::InvalidRequest("missing access token or order id"));
        }
        let response = self
            .http
            .get(format!("{}/v2/orders/{order_id}", self.base_url))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let envelope: OrderEnvelope = read_json(response).await?;
        Ok(envelope.order.metadata)
    }
}
