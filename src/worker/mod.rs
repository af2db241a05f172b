//! Background workers.
//!
//! Every worker is an independent loop driven by [`run_periodic`] on its own
//! task. Workers share no in-process state; each one owns its store handles
//! and stops when the shared shutdown token is cancelled.
//!
//! # Module Structure
//!
//! - [`periodic`]: the tick loop and the [`PeriodicTask`] trait
//! - [`backoff`]: capped exponential backoff
//! - [`retry`]: resends failed outbound messages
//! - [`hosted`]: refreshes hosted-number orders
//! - [`sweep`]: deletes expired cache entries and velocity windows
//!
//! The outbox deliverer and the delayed task runner live with their stores
//! in [`crate::outbox`] and [`crate::delayed`].

pub mod backoff;
pub mod hosted;
pub mod periodic;
pub mod retry;
pub mod sweep;

pub use backoff::Backoff;
pub use hosted::HostedPoller;
pub use periodic::{PeriodicTask, run_periodic};
pub use retry::{RetryConfig, RetryReport, RetrySender};
pub use sweep::ExpirySweeper;
