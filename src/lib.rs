#![doc(html_root_url = "https://docs.rs/msh_reliability/latest")]
//! Reliable message delivery core for an AS4 message service handler.
//!
//! The crate provides the two stateful halves of reliable delivery:
//! splitting oversized payloads into stored fragment groups and joining them
//! again on the receiving side, and tracking every exchange through its
//! retry and acknowledgement lifecycle. Persistence, status reporting and the
//! outbound protocol engine are reached through traits so the core can run
//! against any backing store.

pub mod config;
pub mod dispatch;
pub mod group;
pub mod message;
pub mod metrics;
pub mod panic;
pub mod reliability;
pub mod sink;
pub mod store;
pub mod worker;

pub use config::{ConfigError, ConfigSource, CoreConfig, SharedConfig};
pub use dispatch::{DispatchError, DispatchRequest, OutboundDispatcher, QueueDispatcher};
pub use group::{
    Fragmenter,
    GroupExpirationSweeper,
    GroupId,
    GroupStatus,
    MessageGroup,
    Reassembler,
};
pub use message::{MessageId, Role};
pub use reliability::{
    DeliveryState,
    DeliveryStateTracker,
    DeliveryStatus,
    Outcome,
    RetryPolicy,
    RetryScheduler,
    RetryStrategy,
};
pub use sink::{StatusEvent, StatusSink};
pub use store::{DeliveryStore, MemoryStore, SplitJoinStore, StoreError};
pub use worker::WorkerError;
