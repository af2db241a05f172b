//! Webhook endpoint handler.
//!
//! Accepts provider deliveries, verifies signatures, and ingests them before
//! returning 200 OK. Ingestion is idempotent, so a provider retry of an
//! already-committed event is also answered with 200.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::webhooks::{
    IngestError, IngestOutcome, ParseError, ParsedWebhook, SignatureRejection, SignedRequest,
};

const HEADER_HOST: &str = "host";
const HEADER_FORWARDED_HOST: &str = "x-forwarded-host";
const HEADER_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Errors that can occur when processing a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// No provider is registered under the path segment.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// Signature missing or wrong; carries the provider's rejection status.
    #[error("invalid signature")]
    InvalidSignature(SignatureRejection),

    /// Verified body could not be decoded.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Ingestion failed.
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            WebhookError::InvalidSignature(SignatureRejection::Unauthorized) => StatusCode::UNAUTHORIZED,
            WebhookError::InvalidSignature(SignatureRejection::Forbidden) => StatusCode::FORBIDDEN,
            WebhookError::Parse(_) => StatusCode::BAD_REQUEST,
            WebhookError::Ingest(IngestError::InvalidId(_)) => StatusCode::BAD_REQUEST,
            WebhookError::Ingest(IngestError::LeadNotFound(_) | IngestError::PaymentNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            WebhookError::Ingest(IngestError::Store(_) | IngestError::Lead(_)) => {
                // Storage details stay in the logs.
                return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
            }
        };

        (status, self.to_string()).into_response()
    }
}

/// Webhook handler.
///
/// # Request
///
/// - Method: POST
/// - Path: `/webhooks/{provider}`, where `provider` is a registered name
/// - Signature header: provider specific (`x-square-hmacsha256-signature`,
///   `stripe-signature`)
/// - Body: JSON provider payload
///
/// # Response
///
/// - 200 OK: processed, duplicate, non-terminal, ignored or unreconciled
/// - 400 Bad Request: malformed JSON, missing event id or malformed ids
/// - 401/403: invalid signature, per provider
/// - 404 Not Found: unknown provider, lead or payment
/// - 500 Internal Server Error: storage failure; the provider should retry
pub async fn webhook_handler(
    State(app_state): State<AppState>,
    Path(provider_name): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let Some(provider) = app_state.registry().get(&provider_name) else {
        debug!(provider = %provider_name, "Webhook for unknown provider");
        return Err(WebhookError::UnknownProvider(provider_name));
    };

    let verifier = provider.verifier();
    let url = signed_url(app_state.public_base_url(), &uri, &headers);
    let request = SignedRequest {
        url: &url,
        signature: get_header(&headers, verifier.header_name()),
        body: &body,
    };

    // Verify before parsing so unauthenticated bodies are never decoded.
    if !verifier.verify(&request) {
        warn!(provider = provider.name(), url = %url, "Invalid webhook signature");
        return Err(WebhookError::InvalidSignature(provider.rejection()));
    }

    let notification = match provider.parse(&body) {
        Ok(ParsedWebhook::Payment(notification)) => notification,
        Ok(ParsedWebhook::Ignored { event_id, event_type }) => {
            debug!(
                provider = provider.name(),
                event_id = %event_id,
                event_type = %event_type,
                "Ignoring webhook event type"
            );
            return Ok((StatusCode::OK, "OK"));
        }
        Err(e) => {
            warn!(provider = provider.name(), error = %e, "Malformed webhook payload");
            return Err(e.into());
        }
    };

    match app_state.ingestor().ingest(&notification).await {
        Ok(IngestOutcome::Processed { outbox_id }) => {
            info!(
                provider = provider.name(),
                event_id = %notification.event_id,
                outbox_id = %outbox_id,
                "Webhook processed"
            );
            Ok((StatusCode::OK, "OK"))
        }
        Ok(IngestOutcome::Duplicate) => Ok((StatusCode::OK, "OK (duplicate)")),
        Ok(IngestOutcome::NotTerminal | IngestOutcome::Unreconciled) => Ok((StatusCode::OK, "OK")),
        Err(e) => {
            match &e {
                IngestError::Store(_) | IngestError::Lead(_) => error!(
                    provider = provider.name(),
                    event_id = %notification.event_id,
                    error = %e,
                    "Webhook ingestion failed"
                ),
                _ => warn!(
                    provider = provider.name(),
                    event_id = %notification.event_id,
                    error = %e,
                    "Webhook rejected"
                ),
            }
            Err(e.into())
        }
    }
}

/// Reads a header value as a string, if present and valid UTF-8.
fn get_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Rebuilds the absolute URL the provider signed.
///
/// A configured public base URL wins. Otherwise the scheme and host come
/// from `X-Forwarded-Proto`/`X-Forwarded-Host`, then `Host`, with `http`
/// as the fallback scheme.
fn signed_url(public_base_url: Option<&str>, uri: &Uri, headers: &HeaderMap) -> String {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    if let Some(base) = public_base_url {
        return format!("{base}{path}");
    }

    let first = |name: &str| {
        get_header(headers, name)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let scheme = first(HEADER_FORWARDED_PROTO)
        .or(uri.scheme_str())
        .unwrap_or("http");
    let host = first(HEADER_FORWARDED_HOST)
        .or_else(|| get_header(headers, HEADER_HOST))
        .or(uri.host())
        .unwrap_or("localhost");
    format!("{scheme}://{host}{path}")
}
