//! Clinic Relay - reliable webhook ingestion and outbox delivery for clinic
//! payment and messaging providers.
//!
//! Provider webhooks are verified, deduplicated and committed together with an
//! outbox entry in one transaction. Background workers deliver outbox entries,
//! retry failed patient texts, and track hosted-number orders.

pub mod cache;
pub mod clients;
pub mod config;
pub mod db;
pub mod delayed;
pub mod idempotency;
pub mod leads;
pub mod messaging;
pub mod notify;
pub mod numbers;
pub mod outbox;
pub mod payments;
pub mod server;
pub mod types;
pub mod velocity;
pub mod webhooks;
pub mod worker;

#[cfg(test)]
pub mod test_utils;
