//! Sinks and dispatchers that remember what they were given.

use std::sync::{
    Arc,
    Mutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use msh_reliability::{
    DispatchError,
    DispatchRequest,
    MessageId,
    OutboundDispatcher,
    StatusEvent,
    StatusSink,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Status sink that stores every event in arrival order.
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<StatusEvent>>>,
}

impl RecordingSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Snapshot of the events received so far.
    #[must_use]
    pub fn events(&self) -> Vec<StatusEvent> { lock(&self.events).clone() }

    /// Events that refer to `message_id`.
    #[must_use]
    pub fn events_for(&self, message_id: &MessageId) -> Vec<StatusEvent> {
        lock(&self.events)
            .iter()
            .filter(|e| e.message_id() == message_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn notify(&self, event: StatusEvent) { lock(&self.events).push(event); }
}

/// Dispatcher that records requests and can be told to refuse them.
#[derive(Clone, Debug, Default)]
pub struct RecordingDispatcher {
    requests: Arc<Mutex<Vec<DispatchRequest>>>,
    refuse: Arc<AtomicBool>,
}

impl RecordingDispatcher {
    /// Create a dispatcher that accepts everything.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Refuse (or accept again) every following request.
    pub fn set_refusing(&self, refuse: bool) { self.refuse.store(refuse, Ordering::SeqCst); }

    /// Requests accepted so far.
    #[must_use]
    pub fn requests(&self) -> Vec<DispatchRequest> { lock(&self.requests).clone() }
}

#[async_trait]
impl OutboundDispatcher for RecordingDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), DispatchError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DispatchError::Rejected("refused by test".into()));
        }
        lock(&self.requests).push(request);
        Ok(())
    }
}
