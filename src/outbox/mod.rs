//! Transactional outbox.
//!
//! Domain events are written to the `outbox` table in the same transaction as
//! the state change they describe, then delivered asynchronously by the
//! [`Deliverer`]. An entry is marked delivered only after its handler succeeds,
//! and the delivery timestamp is written at most once.

pub mod deliverer;
pub mod handler;
pub mod store;

pub use deliverer::{
    DEFAULT_BATCH_SIZE, DEFAULT_INTERVAL, Deliverer, DeliveryError, DeliveryHandler, DrainReport,
};
pub use handler::{FanoutHandler, LoggingHandler};
pub use store::{OutboxEntry, OutboxStore};
