//! Rate checks on deposits, refunds and shared cards.
//!
//! - Deposits: at most 3 per phone number per tenant in 24 hours.
//! - Refunds: at most 1 per lead per tenant in 7 days.
//! - Cards: at most 5 distinct phone numbers per card fingerprint in 24
//!   hours. Off unless configured.
//!
//! Counters live in a [`CounterStore`]; the SQLite store is used in
//! production, the in-memory one in tests.

pub mod checker;
pub mod store;

pub use checker::{
    UNAVAILABLE_MESSAGE, VelocityChecker, VelocityConfig, VelocityResult, VelocityRule,
    velocity_key,
};
pub use store::{CounterError, CounterState, CounterStore, MemoryCounterStore, SqliteCounterStore};
