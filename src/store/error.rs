//! Errors reported by persistence backends.

use std::time::Duration;

use thiserror::Error;

/// Failure of a store operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The operation did not finish within the configured bound.
    #[error("store operation `{operation}` timed out after {limit:?}")]
    Timeout {
        /// Name of the operation that timed out.
        operation: &'static str,
        /// Bound that was exceeded.
        limit: Duration,
    },
    /// The backend refused the call, for example because it is offline.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool { matches!(self, Self::Timeout { .. } | Self::Unavailable(_)) }
}
