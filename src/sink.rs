//! Logical message status sink.
//!
//! The core reports terminal outcomes of groups and deliveries here so the
//! surrounding gateway can mark the business message, raise alerts or notify
//! a backend. Every event is emitted at most once: only the caller that wins
//! the terminal conditional update reports it.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{
    group::GroupId,
    message::{MessageId, Role},
    reliability::Outcome,
};

/// Terminal event reported by the core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusEvent {
    /// A split or join transfer exceeded its time budget.
    GroupExpired {
        /// Expired group.
        group_id: GroupId,
        /// Message the group belongs to.
        source_message_id: MessageId,
        /// Local side of the transfer.
        role: Role,
    },
    /// A split or join transfer failed.
    GroupFailed {
        /// Failed group.
        group_id: GroupId,
        /// Message the group belongs to.
        source_message_id: MessageId,
        /// Local side of the transfer.
        role: Role,
        /// Human-readable cause.
        reason: String,
    },
    /// A delivery will not be attempted again.
    DeliveryAbandoned {
        /// Abandoned message.
        message_id: MessageId,
        /// Attempts made before giving up.
        attempts: u32,
        /// Outcome of the final attempt, if one was made.
        last_outcome: Option<Outcome>,
    },
}

impl StatusEvent {
    /// Message the event refers to.
    #[must_use]
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::GroupExpired {
                source_message_id, ..
            }
            | Self::GroupFailed {
                source_message_id, ..
            } => source_message_id,
            Self::DeliveryAbandoned { message_id, .. } => message_id,
        }
    }
}

/// Receiver of terminal status events.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Handle one event. Implementations must not block the caller for long.
    async fn notify(&self, event: StatusEvent);
}

/// Sink that only writes events to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn notify(&self, event: StatusEvent) {
        info!(?event, message_id = %event.message_id(), "status event");
    }
}

/// Sink that forwards events to an unbounded channel.
#[derive(Clone, Debug)]
pub struct ChannelStatusSink {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelStatusSink {
    /// Create a sink and the receiver its events are delivered to.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StatusSink for ChannelStatusSink {
    async fn notify(&self, event: StatusEvent) {
        if let Err(mpsc::error::SendError(event)) = self.tx.send(event) {
            warn!(?event, "status receiver dropped; event discarded");
        }
    }
}
