//! Provider webhook signature verification.
//!
//! Two schemes are supported:
//!
//! - **Square**: base64 HMAC-SHA256 over `notification_url || body`, sent in
//!   `x-square-hmacsha256-signature`. The URL must be the exact public URL
//!   the provider posted to.
//! - **Stripe**: `stripe-signature: t=<unix>,v1=<hex>[,v1=<hex>...]`, where
//!   each `v1` is hex HMAC-SHA256 over `"{t}.{body}"`. The timestamp must be
//!   within the tolerance window.
//!
//! Every comparison goes through `Mac::verify_slice`, which is constant time.
//!
//! # Empty secrets
//!
//! A verifier built with an empty secret accepts every request and logs a
//! warning each time. This exists for local development only.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the Square signature.
pub const SQUARE_SIGNATURE_HEADER: &str = "x-square-hmacsha256-signature";

/// Header carrying the Stripe signature.
pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

/// Default allowed clock skew between a Stripe signature timestamp and now.
pub const DEFAULT_STRIPE_TOLERANCE: Duration = Duration::from_secs(300);

/// The parts of an inbound request a verifier looks at.
#[derive(Debug, Clone, Copy)]
pub struct SignedRequest<'a> {
    /// Full public URL the provider posted to.
    pub url: &'a str,
    /// Value of the verifier's signature header, if present.
    pub signature: Option<&'a str>,
    pub body: &'a [u8],
}

/// Verifies a provider's request signature.
pub trait SignatureVerifier: Send + Sync {
    /// Name of the header that carries the signature (lowercase).
    fn header_name(&self) -> &'static str;

    /// Returns true if the request is authentic.
    fn verify(&self, request: &SignedRequest<'_>) -> bool;
}

fn keyed(secret: &[u8]) -> Option<HmacSha256> {
    HmacSha256::new_from_slice(secret).ok()
}

// ---------------------------------------------------------------------------
// Square
// ---------------------------------------------------------------------------

/// Computes the base64 Square signature for a notification.
pub fn compute_square_signature(signature_key: &[u8], url: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(signature_key).expect("HMAC can take key of any size");
    mac.update(url.as_bytes());
    mac.update(body);
    BASE64.encode(mac.finalize().into_bytes())
}

/// Verifies Square notifications.
#[derive(Clone)]
pub struct SquareVerifier {
    signature_key: Vec<u8>,
}

impl SquareVerifier {
    pub fn new(signature_key: impl Into<Vec<u8>>) -> Self {
        SquareVerifier {
            signature_key: signature_key.into(),
        }
    }
}

impl std::fmt::Debug for SquareVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SquareVerifier")
            .field("configured", &!self.signature_key.is_empty())
            .finish()
    }
}

impl SignatureVerifier for SquareVerifier {
    fn header_name(&self) -> &'static str {
        SQUARE_SIGNATURE_HEADER
    }

    fn verify(&self, request: &SignedRequest<'_>) -> bool {
        if self.signature_key.is_empty() {
            warn!("Square signature key is not configured; accepting unverified webhook");
            return true;
        }

        let Some(header) = request.signature else {
            return false;
        };
        let Ok(expected) = BASE64.decode(header.trim()) else {
            return false;
        };
        let Some(mut mac) = keyed(&self.signature_key) else {
            return false;
        };
        mac.update(request.url.as_bytes());
        mac.update(request.body);
        mac.verify_slice(&expected).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Stripe
// ---------------------------------------------------------------------------

/// A parsed `stripe-signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeSignatureHeader {
    pub timestamp: i64,
    /// Decoded `v1` signatures. Any one of them may match.
    pub signatures: Vec<Vec<u8>>,
}

/// Parses a `stripe-signature` header.
///
/// Returns `None` when the timestamp is missing or unparseable, or when no
/// `v1` entry decodes as hex. Unknown schemes (e.g. `v0`) are ignored. Never
/// panics.
pub fn parse_stripe_header(header: &str) -> Option<StripeSignatureHeader> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => {
                if let Ok(sig) = hex::decode(value) {
                    signatures.push(sig);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp?;
    if signatures.is_empty() {
        return None;
    }
    Some(StripeSignatureHeader {
        timestamp,
        signatures,
    })
}

/// Computes the raw Stripe `v1` signature for a timestamped payload.
pub fn compute_stripe_signature(secret: &[u8], timestamp: i64, body: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a `stripe-signature` header with a single `v1` entry.
pub fn format_stripe_header(timestamp: i64, signature: &[u8]) -> String {
    format!("t={},v1={}", timestamp, hex::encode(signature))
}

/// Verifies Stripe webhooks.
#[derive(Clone)]
pub struct StripeVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
}

impl StripeVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        StripeVerifier {
            secret: secret.into(),
            tolerance: DEFAULT_STRIPE_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Verifies against an explicit clock, in unix seconds.
    pub fn verify_at(&self, request: &SignedRequest<'_>, now_unix: i64) -> bool {
        if self.secret.is_empty() {
            warn!("Stripe webhook secret is not configured; accepting unverified webhook");
            return true;
        }

        let Some(header) = request.signature.and_then(parse_stripe_header) else {
            return false;
        };

        let skew = now_unix.abs_diff(header.timestamp);
        if skew > self.tolerance.as_secs() {
            warn!(
                timestamp = header.timestamp,
                skew_secs = skew,
                "Stripe signature timestamp outside tolerance"
            );
            return false;
        }

        let Some(mut mac) = keyed(&self.secret) else {
            return false;
        };
        mac.update(header.timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(request.body);

        header
            .signatures
            .iter()
            .any(|candidate| mac.clone().verify_slice(candidate).is_ok())
    }
}

impl std::fmt::Debug for StripeVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeVerifier")
            .field("configured", &!self.secret.is_empty())
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl SignatureVerifier for StripeVerifier {
    fn header_name(&self) -> &'static str {
        STRIPE_SIGNATURE_HEADER
    }

    fn verify(&self, request: &SignedRequest<'_>) -> bool {
        self.verify_at(request, Utc::now().timestamp())
    }
}
