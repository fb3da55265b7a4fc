//! Persistence boundary for groups, fragments and delivery states.
//!
//! The core never caches records between operations: every read goes to the
//! store and every state change is a conditional update that names the value
//! the caller expects to replace. Two concurrent writers therefore observe a
//! single winner, which is the property the sweeper, the reassembler and the
//! retry scheduler rely on.
//!
//! [`MemoryStore`] implements every trait in this module with `DashMap`s and
//! is suitable for tests and single-process deployments.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    group::{Fragment, GroupId, GroupStatus, MessageGroup, SequenceNumber},
    message::MessageId,
    reliability::{DeliveryFilter, DeliveryState},
};

mod error;
mod memory;

pub use error::StoreError;
pub use memory::MemoryStore;

/// Persistence of [`MessageGroup`] descriptors.
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Insert `group` unless a group with the same id exists.
    ///
    /// Returns `false` when the id is already taken; the stored group is left
    /// untouched.
    async fn insert_group(&self, group: MessageGroup) -> Result<bool, StoreError>;

    /// Load a group by id.
    async fn load_group(&self, group_id: GroupId) -> Result<Option<MessageGroup>, StoreError>;

    /// Move a group from `from` to `to` if its status is still `from`.
    ///
    /// Returns `true` only for the caller whose update was applied.
    async fn transition_group(
        &self,
        group_id: GroupId,
        from: GroupStatus,
        to: GroupStatus,
    ) -> Result<bool, StoreError>;

    /// Record the final fragment count and move a group from
    /// [`GroupStatus::Creating`] to [`GroupStatus::Sending`].
    async fn seal_group(&self, group_id: GroupId, total: u32) -> Result<bool, StoreError>;

    /// Groups that are still active and whose deadline is before `now`.
    async fn find_expired_groups(&self, now: DateTime<Utc>)
    -> Result<Vec<MessageGroup>, StoreError>;
}

/// Persistence of [`Fragment`] payloads.
#[async_trait]
pub trait FragmentStore: Send + Sync {
    /// Store a fragment unless the `(group, sequence)` slot is taken.
    ///
    /// Returns `false` for a duplicate; the first stored payload wins.
    async fn put_fragment(&self, fragment: Fragment) -> Result<bool, StoreError>;

    /// Load one fragment.
    async fn load_fragment(
        &self,
        group_id: GroupId,
        sequence: SequenceNumber,
    ) -> Result<Option<Fragment>, StoreError>;

    /// Number of distinct fragments stored for a group.
    async fn fragment_count(&self, group_id: GroupId) -> Result<u32, StoreError>;

    /// Every fragment of a group in ascending sequence order.
    async fn load_fragments(&self, group_id: GroupId) -> Result<Vec<Fragment>, StoreError>;

    /// Delete every fragment of a group and return how many were removed.
    async fn delete_fragments(&self, group_id: GroupId) -> Result<u32, StoreError>;
}

/// Store used by the split-and-join subsystem.
pub trait SplitJoinStore: GroupStore + FragmentStore {}

impl<T> SplitJoinStore for T where T: GroupStore + FragmentStore + ?Sized {}

/// Persistence of [`DeliveryState`] records.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Load a delivery by message id.
    async fn load_delivery(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<DeliveryState>, StoreError>;

    /// Insert `state` unless a delivery for the same message exists.
    async fn insert_delivery(&self, state: DeliveryState) -> Result<bool, StoreError>;

    /// Replace a delivery if its stored version equals `expected_version`.
    ///
    /// The stored copy receives `expected_version + 1` regardless of the
    /// version carried by `state`.
    async fn update_delivery(
        &self,
        expected_version: u64,
        state: DeliveryState,
    ) -> Result<bool, StoreError>;

    /// Atomically claim up to `limit` due retries.
    ///
    /// A delivery is due when it is [`FailedRetryable`], not yet scheduled and
    /// its next attempt time is at or before `now`. Each claimed row is moved
    /// to [`RetryScheduled`] with the claim flag and time set, in the same step
    /// that selects it, so concurrent callers never claim the same row.
    ///
    /// [`FailedRetryable`]: crate::reliability::DeliveryStatus::FailedRetryable
    /// [`RetryScheduled`]: crate::reliability::DeliveryStatus::RetryScheduled
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryState>, StoreError>;

    /// Undo one claim taken at `claimed_at`, making the row due again.
    async fn release_claim(
        &self,
        message_id: &MessageId,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Undo every claim taken before `claimed_before`.
    async fn release_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, StoreError>;

    /// Up to `limit` [`Waiting`] deliveries whose budget deadline lies before
    /// `now`, earliest deadline first.
    ///
    /// [`Waiting`]: crate::reliability::DeliveryStatus::Waiting
    async fn find_expired_waiting(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryState>, StoreError>;

    /// Deliveries matching `filter`, oldest anchor first.
    async fn find_deliveries(
        &self,
        filter: &DeliveryFilter,
        limit: usize,
    ) -> Result<Vec<DeliveryState>, StoreError>;
}

/// Run a store future with an upper bound on its duration.
///
/// # Errors
///
/// Returns [`StoreError::Timeout`] when `fut` does not finish within `limit`,
/// or the error produced by `fut`.
pub async fn bounded<T, F>(limit: Duration, operation: &'static str, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StoreError::Timeout { operation, limit })?
}
