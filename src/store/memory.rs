//! In-process store backed by `DashMap`.
//!
//! Conditional updates take the shard write lock for the affected key, so the
//! compare and the write happen as one step.

use std::collections::{BTreeMap, btree_map};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};

use super::{DeliveryStore, FragmentStore, GroupStore, StoreError};
use crate::{
    group::{Fragment, GroupId, GroupStatus, MessageGroup, SequenceNumber},
    message::MessageId,
    reliability::{DeliveryFilter, DeliveryState, DeliveryStatus},
};

/// Store keeping every record in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    groups: DashMap<GroupId, MessageGroup>,
    fragments: DashMap<GroupId, BTreeMap<SequenceNumber, Fragment>>,
    deliveries: DashMap<MessageId, DeliveryState>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Number of groups currently holding fragments.
    #[must_use]
    pub fn groups_with_fragments(&self) -> usize { self.fragments.len() }

    /// Number of stored delivery records.
    #[must_use]
    pub fn delivery_count(&self) -> usize { self.deliveries.len() }
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn insert_group(&self, group: MessageGroup) -> Result<bool, StoreError> {
        match self.groups.entry(group.group_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(group);
                Ok(true)
            }
        }
    }

    async fn load_group(&self, group_id: GroupId) -> Result<Option<MessageGroup>, StoreError> {
        Ok(self.groups.get(&group_id).map(|g| g.clone()))
    }

    async fn transition_group(
        &self,
        group_id: GroupId,
        from: GroupStatus,
        to: GroupStatus,
    ) -> Result<bool, StoreError> {
        let Some(mut group) = self.groups.get_mut(&group_id) else {
            return Ok(false);
        };
        if group.status != from || !from.can_transition_to(to) {
            return Ok(false);
        }
        group.status = to;
        Ok(true)
    }

    async fn seal_group(&self, group_id: GroupId, total: u32) -> Result<bool, StoreError> {
        let Some(mut group) = self.groups.get_mut(&group_id) else {
            return Ok(false);
        };
        if group.status != GroupStatus::Creating {
            return Ok(false);
        }
        group.total_fragment_count = total;
        group.status = GroupStatus::Sending;
        Ok(true)
    }

    async fn find_expired_groups(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageGroup>, StoreError> {
        let mut expired: Vec<_> = self
            .groups
            .iter()
            .filter(|g| g.is_expired_at(now))
            .map(|g| g.clone())
            .collect();
        expired.sort_by_key(|g| g.expires_at);
        Ok(expired)
    }
}

#[async_trait]
impl FragmentStore for MemoryStore {
    async fn put_fragment(&self, fragment: Fragment) -> Result<bool, StoreError> {
        let mut slots = self.fragments.entry(fragment.group_id).or_default();
        match slots.entry(fragment.sequence) {
            btree_map::Entry::Occupied(_) => Ok(false),
            btree_map::Entry::Vacant(slot) => {
                slot.insert(fragment);
                Ok(true)
            }
        }
    }

    async fn load_fragment(
        &self,
        group_id: GroupId,
        sequence: SequenceNumber,
    ) -> Result<Option<Fragment>, StoreError> {
        Ok(self
            .fragments
            .get(&group_id)
            .and_then(|slots| slots.get(&sequence).cloned()))
    }

    async fn fragment_count(&self, group_id: GroupId) -> Result<u32, StoreError> {
        let count = self.fragments.get(&group_id).map_or(0, |slots| slots.len());
        u32::try_from(count).map_err(|e| StoreError::Backend(Box::new(e)))
    }

    async fn load_fragments(&self, group_id: GroupId) -> Result<Vec<Fragment>, StoreError> {
        Ok(self
            .fragments
            .get(&group_id)
            .map(|slots| slots.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_fragments(&self, group_id: GroupId) -> Result<u32, StoreError> {
        let removed = self
            .fragments
            .remove(&group_id)
            .map_or(0, |(_, slots)| slots.len());
        u32::try_from(removed).map_err(|e| StoreError::Backend(Box::new(e)))
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn load_delivery(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<DeliveryState>, StoreError> {
        Ok(self.deliveries.get(message_id).map(|s| s.clone()))
    }

    async fn insert_delivery(&self, state: DeliveryState) -> Result<bool, StoreError> {
        match self.deliveries.entry(state.message_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(state);
                Ok(true)
            }
        }
    }

    async fn update_delivery(
        &self,
        expected_version: u64,
        mut state: DeliveryState,
    ) -> Result<bool, StoreError> {
        let Some(mut stored) = self.deliveries.get_mut(&state.message_id) else {
            return Ok(false);
        };
        if stored.version != expected_version {
            return Ok(false);
        }
        state.version = expected_version + 1;
        *stored = state;
        Ok(true)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryState>, StoreError> {
        let mut candidates: Vec<_> = self
            .deliveries
            .iter()
            .filter(|s| s.is_due(now))
            .map(|s| (s.next_attempt_at, s.message_id.clone()))
            .collect();
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, message_id) in candidates {
            if claimed.len() >= limit {
                break;
            }
            let Some(mut state) = self.deliveries.get_mut(&message_id) else {
                continue;
            };
            // Another claimer may have won between the scan and the lock.
            if !state.is_due(now) {
                continue;
            }
            state.status = DeliveryStatus::RetryScheduled;
            state.scheduled = true;
            state.claimed_at = Some(now);
            state.version += 1;
            claimed.push(state.clone());
        }
        Ok(claimed)
    }

    async fn release_claim(
        &self,
        message_id: &MessageId,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let Some(mut state) = self.deliveries.get_mut(message_id) else {
            return Ok(false);
        };
        Ok(release(&mut state, |at| at == claimed_at))
    }

    async fn release_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, StoreError> {
        let mut released = Vec::new();
        for mut state in self.deliveries.iter_mut() {
            if release(&mut state, |at| at < claimed_before) {
                released.push(state.message_id.clone());
            }
        }
        Ok(released)
    }

    async fn find_expired_waiting(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryState>, StoreError> {
        let mut expired: Vec<_> = self
            .deliveries
            .iter()
            .filter(|s| s.expired_waiting(now).is_some())
            .map(|s| s.clone())
            .collect();
        expired.sort_by_key(|s| (s.policy.deadline(s.received_at), s.message_id.clone()));
        expired.truncate(limit);
        Ok(expired)
    }

    async fn find_deliveries(
        &self,
        filter: &DeliveryFilter,
        limit: usize,
    ) -> Result<Vec<DeliveryState>, StoreError> {
        let mut found: Vec<_> = self
            .deliveries
            .iter()
            .filter(|s| filter.matches(s))
            .map(|s| s.clone())
            .collect();
        found.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        found.truncate(limit);
        Ok(found)
    }
}

fn release(state: &mut DeliveryState, claim_matches: impl Fn(DateTime<Utc>) -> bool) -> bool {
    let held = state.status == DeliveryStatus::RetryScheduled
        && state.scheduled
        && state.claimed_at.is_some_and(claim_matches);
    if held {
        state.status = DeliveryStatus::FailedRetryable;
        state.scheduled = false;
        state.claimed_at = None;
        state.version += 1;
    }
    held
}
