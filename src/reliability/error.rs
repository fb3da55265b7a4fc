//! Errors raised by the delivery state tracker.

use thiserror::Error;

use super::DeliveryStatus;
use crate::{config::ConfigError, message::MessageId, store::StoreError};

/// Failure of a delivery-state operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeliveryError {
    /// Another dispatch would exceed the attempt budget.
    #[error("message {message_id} already used {attempts} of {max_attempts} attempts")]
    AttemptsExceeded {
        /// Message addressed by the call.
        message_id: MessageId,
        /// Attempts already made.
        attempts: u32,
        /// Attempt budget.
        max_attempts: u32,
    },
    /// The delivery was acknowledged or abandoned.
    #[error("message {message_id} is already {status}")]
    AlreadyTerminal {
        /// Message addressed by the call.
        message_id: MessageId,
        /// Terminal status found.
        status: DeliveryStatus,
    },
    /// An attempt is in flight and has not reported an outcome yet.
    #[error("message {message_id} is already dispatched")]
    AlreadyDispatched {
        /// Message addressed by the call.
        message_id: MessageId,
    },
    /// Only abandoned deliveries can be restored.
    #[error("message {message_id} is {status}, not ABANDONED")]
    NotAbandoned {
        /// Message addressed by the call.
        message_id: MessageId,
        /// Status found.
        status: DeliveryStatus,
    },
    /// No delivery is recorded for the message.
    #[error("no delivery recorded for message {message_id}")]
    NotFound {
        /// Message addressed by the call.
        message_id: MessageId,
    },
    /// Concurrent writers kept changing the row.
    #[error("message {message_id} changed concurrently {rounds} times; giving up")]
    Contention {
        /// Message addressed by the call.
        message_id: MessageId,
        /// Update rounds attempted.
        rounds: u32,
    },
    /// The configuration or retry policy was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The store refused or timed out.
    #[error(transparent)]
    Store(#[from] StoreError),
}
