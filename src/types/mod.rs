//! Core domain types shared across ingestion, storage and delivery.

pub mod ids;

pub use ids::{EventId, InvalidId, LeadId, OrgId, PaymentId};
