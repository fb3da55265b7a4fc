//! Reliability and retry engine.
//!
//! Every exchange the gateway takes part in, pushed or pulled, has a
//! [`DeliveryState`]. The [`DeliveryStateTracker`] applies dispatches and
//! outcomes to it, a [`RetryStrategy`] decides when a failed attempt may be
//! repeated, and the [`RetryScheduler`] hands due retries back to the
//! dispatch boundary.

pub mod error;
pub mod scheduler;
pub mod strategy;
pub mod tracker;
pub mod types;

pub use error::DeliveryError;
pub use scheduler::{RetryScheduler, SchedulerReport};
pub use strategy::{CONSTANT_INTERVAL_GRACE, RetryPolicy, RetryStrategy};
pub use tracker::{DeliveryStateTracker, MAX_UPDATE_ROUNDS, Recorded};
pub use types::{
    DeliveryFilter,
    DeliveryState,
    DeliveryStatus,
    ExchangePattern,
    Outcome,
    OutcomeTransition,
};
