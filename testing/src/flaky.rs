//! A [`MemoryStore`] wrapper that fails or stalls on request.
//!
//! Faults are keyed by operation name, matching the names the core passes to
//! its bounded store calls (`"put_fragment"`, `"claim_due"` and so on).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use msh_reliability::{
    MemoryStore,
    MessageId,
    StoreError,
    group::{Fragment, GroupId, GroupStatus, MessageGroup, SequenceNumber},
    reliability::{DeliveryFilter, DeliveryState},
    store::{DeliveryStore, FragmentStore, GroupStore},
};

/// What to do when an operation is called.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultPlan {
    /// Succeed the first `n` calls, then fail every later one.
    FailAfter(u32),
    /// Fail the next `n` calls, then succeed.
    FailTimes(u32),
    /// Never complete; the caller's timeout decides.
    Stall,
}

#[derive(Debug, Default)]
struct FaultState {
    plan: Option<FaultPlan>,
    calls: u32,
}

/// In-memory store with per-operation fault injection.
#[derive(Clone, Debug, Default)]
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    faults: Arc<Mutex<HashMap<&'static str, FaultState>>>,
}

impl FlakyStore {
    /// Wrap an empty [`MemoryStore`].
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// The wrapped store, for direct inspection.
    #[must_use]
    pub fn inner(&self) -> &MemoryStore { &self.inner }

    /// Install `plan` for `operation`, resetting its call counter.
    pub fn inject(&self, operation: &'static str, plan: FaultPlan) {
        self.lock().insert(
            operation,
            FaultState {
                plan: Some(plan),
                calls: 0,
            },
        );
    }

    /// Remove every installed fault.
    pub fn heal(&self) { self.lock().clear(); }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<&'static str, FaultState>> {
        self.faults
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn gate(&self, operation: &'static str) -> Result<(), StoreError> {
        let plan = {
            let mut faults = self.lock();
            let Some(state) = faults.get_mut(operation) else {
                return Ok(());
            };
            state.calls += 1;
            match state.plan {
                Some(FaultPlan::FailAfter(n)) if state.calls > n => Some(FaultPlan::FailAfter(n)),
                Some(FaultPlan::FailTimes(n)) if state.calls <= n => Some(FaultPlan::FailTimes(n)),
                Some(FaultPlan::Stall) => Some(FaultPlan::Stall),
                _ => None,
            }
        };
        match plan {
            None => Ok(()),
            Some(FaultPlan::Stall) => std::future::pending().await,
            Some(_) => Err(StoreError::Unavailable(format!(
                "injected failure in {operation}"
            ))),
        }
    }
}

#[async_trait]
impl GroupStore for FlakyStore {
    async fn insert_group(&self, group: MessageGroup) -> Result<bool, StoreError> {
        self.gate("insert_group").await?;
        self.inner.insert_group(group).await
    }

    async fn load_group(&self, group_id: GroupId) -> Result<Option<MessageGroup>, StoreError> {
        self.gate("load_group").await?;
        self.inner.load_group(group_id).await
    }

    async fn transition_group(
        &self,
        group_id: GroupId,
        from: GroupStatus,
        to: GroupStatus,
    ) -> Result<bool, StoreError> {
        self.gate("transition_group").await?;
        self.inner.transition_group(group_id, from, to).await
    }

    async fn seal_group(&self, group_id: GroupId, total: u32) -> Result<bool, StoreError> {
        self.gate("seal_group").await?;
        self.inner.seal_group(group_id, total).await
    }

    async fn find_expired_groups(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageGroup>, StoreError> {
        self.gate("find_expired_groups").await?;
        self.inner.find_expired_groups(now).await
    }
}

#[async_trait]
impl FragmentStore for FlakyStore {
    async fn put_fragment(&self, fragment: Fragment) -> Result<bool, StoreError> {
        self.gate("put_fragment").await?;
        self.inner.put_fragment(fragment).await
    }

    async fn load_fragment(
        &self,
        group_id: GroupId,
        sequence: SequenceNumber,
    ) -> Result<Option<Fragment>, StoreError> {
        self.gate("load_fragment").await?;
        self.inner.load_fragment(group_id, sequence).await
    }

    async fn fragment_count(&self, group_id: GroupId) -> Result<u32, StoreError> {
        self.gate("fragment_count").await?;
        self.inner.fragment_count(group_id).await
    }

    async fn load_fragments(&self, group_id: GroupId) -> Result<Vec<Fragment>, StoreError> {
        self.gate("load_fragments").await?;
        self.inner.load_fragments(group_id).await
    }

    async fn delete_fragments(&self, group_id: GroupId) -> Result<u32, StoreError> {
        self.gate("delete_fragments").await?;
        self.inner.delete_fragments(group_id).await
    }
}

#[async_trait]
impl DeliveryStore for FlakyStore {
    async fn load_delivery(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<DeliveryState>, StoreError> {
        self.gate("load_delivery").await?;
        self.inner.load_delivery(message_id).await
    }

    async fn insert_delivery(&self, state: DeliveryState) -> Result<bool, StoreError> {
        self.gate("insert_delivery").await?;
        self.inner.insert_delivery(state).await
    }

    async fn update_delivery(
        &self,
        expected_version: u64,
        state: DeliveryState,
    ) -> Result<bool, StoreError> {
        self.gate("update_delivery").await?;
        self.inner.update_delivery(expected_version, state).await
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryState>, StoreError> {
        self.gate("claim_due").await?;
        self.inner.claim_due(now, limit).await
    }

    async fn release_claim(
        &self,
        message_id: &MessageId,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.gate("release_claim").await?;
        self.inner.release_claim(message_id, claimed_at).await
    }

    async fn release_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, StoreError> {
        self.gate("release_stale_claims").await?;
        self.inner.release_stale_claims(claimed_before).await
    }

    async fn find_expired_waiting(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryState>, StoreError> {
        self.gate("find_expired_waiting").await?;
        self.inner.find_expired_waiting(now, limit).await
    }

    async fn find_deliveries(
        &self,
        filter: &DeliveryFilter,
        limit: usize,
    ) -> Result<Vec<DeliveryState>, StoreError> {
        self.gate("find_deliveries").await?;
        self.inner.find_deliveries(filter, limit).await
    }
}
