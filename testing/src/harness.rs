//! A fully wired core over a [`FlakyStore`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use msh_reliability::{
    ConfigError,
    CoreConfig,
    DeliveryStateTracker,
    Fragmenter,
    GroupExpirationSweeper,
    Reassembler,
    RetryScheduler,
    group::{GroupId, GroupIdGenerator},
};
use rstest::fixture;
use uuid::Uuid;

use crate::{FlakyStore, RecordingDispatcher, RecordingSink};

/// Fixed anchor instant used throughout the integration tests.
#[must_use]
pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Every service of the core sharing one store, sink and dispatcher.
pub struct Gateway {
    /// Backing store with fault injection.
    pub store: FlakyStore,
    /// Configuration every service reads.
    pub config: Arc<CoreConfig>,
    /// Terminal status events.
    pub sink: RecordingSink,
    /// Retry handoffs.
    pub dispatcher: RecordingDispatcher,
    /// Outbound splitter.
    pub fragmenter: Fragmenter,
    /// Inbound joiner.
    pub reassembler: Reassembler,
    /// Group expiry worker.
    pub sweeper: Arc<GroupExpirationSweeper>,
    /// Delivery lifecycle tracker.
    pub tracker: Arc<DeliveryStateTracker>,
    /// Retry handoff worker.
    pub scheduler: Arc<RetryScheduler>,
}

impl Gateway {
    /// Wire a gateway with `config`.
    ///
    /// # Errors
    ///
    /// Returns the validation error for an invalid configuration.
    pub fn new(config: CoreConfig) -> Result<Self, ConfigError> {
        Self::with_store(config, FlakyStore::new())
    }

    /// Wire a gateway over an existing store.
    ///
    /// # Errors
    ///
    /// Returns the validation error for an invalid configuration.
    pub fn with_store(config: CoreConfig, store: FlakyStore) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let sink = RecordingSink::new();
        let dispatcher = RecordingDispatcher::new();
        let shared = Arc::new(store.clone());
        let sink_handle = Arc::new(sink.clone());

        let tracker = Arc::new(DeliveryStateTracker::new(
            shared.clone(),
            config.clone(),
            sink_handle.clone(),
        ));
        let scheduler = Arc::new(RetryScheduler::new(
            tracker.clone(),
            Arc::new(dispatcher.clone()),
            config.clone(),
        ));
        Ok(Self {
            fragmenter: Fragmenter::new(shared.clone(), config.clone(), sink_handle.clone()),
            reassembler: Reassembler::new(shared.clone(), config.clone(), sink_handle.clone()),
            sweeper: Arc::new(GroupExpirationSweeper::new(
                shared,
                config.clone(),
                sink_handle,
            )),
            store,
            config,
            sink,
            dispatcher,
            tracker,
            scheduler,
        })
    }

    /// Replace the group id generator of the fragmenter.
    #[must_use]
    pub fn with_group_ids(mut self, ids: Arc<dyn GroupIdGenerator>) -> Self {
        self.fragmenter = self.fragmenter.with_id_generator(ids);
        self
    }
}

/// Group ids derived from a counter.
#[derive(Debug, Default)]
pub struct SequentialGroupIds {
    next: std::sync::atomic::AtomicU64,
}

impl GroupIdGenerator for SequentialGroupIds {
    fn next_group_id(&self) -> GroupId {
        let n = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        GroupId::new(Uuid::from_u128(u128::from(n)))
    }
}

/// Gateway with the default configuration.
#[fixture]
pub fn gateway() -> Gateway {
    match Gateway::new(CoreConfig::default()) {
        Ok(gateway) => gateway,
        Err(e) => panic!("default configuration is valid: {e}"),
    }
}
