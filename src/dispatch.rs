//! Outbound dispatch boundary.
//!
//! The core never performs network I/O. Whenever a message or a set of
//! fragments must be (re)sent it builds a [`DispatchRequest`] and hands it to
//! an [`OutboundDispatcher`]. [`QueueDispatcher`] is the stock implementation:
//! a bounded channel drained by the protocol engine.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{group::FragmentRef, message::MessageId};

/// What the protocol engine has to send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchPayload {
    /// Re-read the message from the gateway's own message store.
    Stored,
    /// Send these bytes.
    Inline(Bytes),
    /// Send these stored fragments, in order.
    Fragments(Vec<FragmentRef>),
}

/// One handoff to the protocol engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchRequest {
    /// Message being sent.
    pub message_id: MessageId,
    /// Content to send.
    pub payload: DispatchPayload,
    /// Attempt number this handoff will become once dispatched.
    pub attempt: u32,
}

impl DispatchRequest {
    /// Request that re-sends a stored message.
    #[must_use]
    pub fn retry(message_id: MessageId, attempt: u32) -> Self {
        Self {
            message_id,
            payload: DispatchPayload::Stored,
            attempt,
        }
    }
}

/// Errors returned when a handoff is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The receiving side is gone.
    #[error("dispatch queue closed")]
    Closed,
    /// The queue has no free capacity.
    #[error("dispatch queue full")]
    Full,
    /// The protocol engine refused the request.
    #[error("dispatch rejected: {0}")]
    Rejected(String),
}

/// Hands messages to the protocol engine.
#[async_trait]
pub trait OutboundDispatcher: Send + Sync {
    /// Queue `request` for sending.
    ///
    /// Returning `Ok` means the engine accepted responsibility for the
    /// attempt; it will later report the outcome through the tracker.
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), DispatchError>;
}

/// Dispatcher backed by a bounded channel.
#[derive(Clone, Debug)]
pub struct QueueDispatcher {
    tx: mpsc::Sender<DispatchRequest>,
}

/// Receiving half of a [`QueueDispatcher`].
#[derive(Debug)]
pub struct DispatchQueue {
    rx: mpsc::Receiver<DispatchRequest>,
}

impl QueueDispatcher {
    /// Create a dispatcher holding at most `capacity` queued requests.
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> (Self, DispatchQueue) {
        let (tx, rx) = mpsc::channel(capacity.get());
        (Self { tx }, DispatchQueue { rx })
    }
}

#[async_trait]
impl OutboundDispatcher for QueueDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), DispatchError> {
        let permit = self.tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => DispatchError::Full,
            mpsc::error::TrySendError::Closed(()) => DispatchError::Closed,
        })?;
        debug!(message_id = %request.message_id, attempt = request.attempt, "request queued");
        permit.send(request);
        Ok(())
    }
}

impl DispatchQueue {
    /// Receive the next request, or `None` once every dispatcher is dropped.
    pub async fn recv(&mut self) -> Option<DispatchRequest> { self.rx.recv().await }

    /// Receive a request without waiting.
    pub fn try_recv(&mut self) -> Option<DispatchRequest> { self.rx.try_recv().ok() }

    /// Stop accepting new requests; queued ones can still be received.
    pub fn close(&mut self) { self.rx.close(); }
}
