//! Inbound payment webhooks.
//!
//! This module provides:
//! - Signature verification per provider ([`signature`])
//! - The provider abstraction and registry ([`provider`])
//! - Square and Stripe payload parsing ([`square`], [`stripe`])
//! - Transactional ingestion into payments and the outbox ([`ingest`])
//! - The domain events ingestion emits ([`events`])

pub mod events;
pub mod ingest;
pub mod provider;
pub mod signature;
pub mod square;
pub mod stripe;

pub use events::{PAYMENT_SUCCEEDED_V1, PaymentSucceededV1};
pub use ingest::{IngestError, IngestOutcome, PaymentIngestor};
pub use provider::{
    CorrelationMetadata, ParseError, ParsedWebhook, PaymentNotification, ProviderRegistry,
    SignatureRejection, WebhookProvider,
};
pub use signature::{SignatureVerifier, SignedRequest, SquareVerifier, StripeVerifier};
pub use square::SquareProvider;
pub use stripe::StripeProvider;
