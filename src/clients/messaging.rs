//! REST client for the SMS provider.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ClientError, Result, http_client, read_json};
use crate::messaging::{HostedOrderClient, HostedOrderStatus, MessageSender, SendRequest, SendResponse};

/// Responses arrive wrapped as `{"data": {...}}`.
#[derive(Debug, Deserialize)]
struct DataWrapper<T> {
    data: T,
}

#[derive(Debug, Serialize)]
struct SendBody<'a> {
    from: &'a str,
    to: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    media_urls: &'a [String],
}

/// Messaging provider API client.
#[derive(Clone)]
pub struct HttpMessagingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for HttpMessagingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMessagingClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpMessagingClient {
    pub fn new(base_url: &str, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(HttpMessagingClient {
            http: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl MessageSender for HttpMessagingClient {
    async fn send(&self, request: &SendRequest) -> Result<SendResponse> {
        if request.from.trim().is_empty() || request.to.trim().is_empty() {
            return Err(ClientError::InvalidRequest("from and to numbers required"));
        }
        if request.body.trim().is_empty() && request.media_urls.is_empty() {
            return Err(ClientError::InvalidRequest("body or media required"));
        }

        let body = SendBody {
            from: &request.from,
            to: &request.to,
            text: &request.body,
            media_urls: &request.media_urls,
        };
        let response = self
            .http
            .post(self.url("/messages"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let wrapped: DataWrapper<SendResponse> = read_json(response).await?;
        debug!(provider_message_id = %wrapped.data.id, "Message accepted by provider");
        Ok(wrapped.data)
    }
}

#[async_trait]
impl HostedOrderClient for HttpMessagingClient {
    async fn get_hosted_order(&self, order_id: &str) -> Result<HostedOrderStatus> {
        if order_id.trim().is_empty() {
            return Err(ClientError::InvalidRequest("order id required"));
        }
        let response = self
            .http
            .get(self.url(&format!("/hosted_messaging/orders/{order_id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let wrapped: DataWrapper<HostedOrderStatus> = read_json(response).await?;
        Ok(wrapped.data)
    }
}
