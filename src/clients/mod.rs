//! HTTP clients for the outbound provider APIs.
//!
//! Every client is built with a request timeout so no call blocks a worker
//! tick indefinitely.

use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;

pub mod messaging;
pub mod square_orders;

pub use messaging::HttpMessagingClient;
pub use square_orders::{OrderMetadataFetcher, SquareOrdersClient};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from outbound API calls.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection, TLS or timeout failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with a non-success status.
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body was not the expected shape.
    #[error("could not decode provider response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
}

impl ClientError {
    /// True for failures a later attempt may not repeat.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(_) => true,
            ClientError::Status { status, .. } => *status == 429 || *status >= 500,
            ClientError::Decode(_) | ClientError::InvalidRequest(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Builds a client with the given request timeout.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Reads a response, turning non-success statuses into [`ClientError::Status`]
/// and decoding the body as `T`.
pub(crate) async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ClientError::Status {
            status: status.as_u16(),
            body,
        });
    }
    serde_json::from_str(&body).map_err(|e| ClientError::Decode(e.to_string()))
}
