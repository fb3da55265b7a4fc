//! Records persisted for split transfers.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::{GroupId, SequenceNumber};
use crate::message::{MessageId, Role};

/// Lifecycle status of a [`MessageGroup`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum GroupStatus {
    /// The sender is writing fragments.
    #[display("CREATING")]
    Creating,
    /// Every fragment is persisted and may be dispatched.
    #[display("SENDING")]
    Sending,
    /// The receiver is collecting fragments.
    #[display("RECEIVING")]
    Receiving,
    /// Every fragment arrived and the payload is being rebuilt.
    #[display("REASSEMBLING")]
    Reassembling,
    /// The transfer finished successfully.
    #[display("COMPLETED")]
    Completed,
    /// The transfer exceeded its time budget.
    #[display("EXPIRED")]
    Expired,
    /// The transfer failed.
    #[display("FAILED")]
    Failed,
}

impl GroupStatus {
    /// Statuses from which a group may still make progress.
    pub const ACTIVE: [Self; 4] = [
        Self::Creating,
        Self::Sending,
        Self::Receiving,
        Self::Reassembling,
    ];

    /// Whether no transition can leave this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// # Examples
    ///
    /// ```
    /// use msh_reliability::group::GroupStatus;
    /// assert!(GroupStatus::Receiving.can_transition_to(GroupStatus::Reassembling));
    /// assert!(GroupStatus::Sending.can_transition_to(GroupStatus::Expired));
    /// assert!(!GroupStatus::Completed.can_transition_to(GroupStatus::Expired));
    /// ```
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Creating, Self::Sending)
            | (Self::Sending | Self::Reassembling, Self::Completed)
            | (Self::Receiving, Self::Reassembling) => true,
            (from, Self::Failed | Self::Expired) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Descriptor of one split transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageGroup {
    /// Identifier shared by every fragment of the transfer.
    pub group_id: GroupId,
    /// Logical message being split or joined.
    pub source_message_id: MessageId,
    /// Whether the local side splits or joins.
    pub role: Role,
    /// Number of fragments in the group.
    ///
    /// Zero while a sending group is still [`GroupStatus::Creating`]; the
    /// final count is written when the group is sealed.
    pub total_fragment_count: u32,
    /// Whether the fragment stream is deflate-compressed.
    pub compression_enabled: bool,
    /// Current lifecycle status.
    pub status: GroupStatus,
    /// When the group was created.
    pub created_at: DateTime<Utc>,
    /// Deadline after which the sweeper expires the group.
    pub expires_at: DateTime<Utc>,
}

impl MessageGroup {
    /// Whether the deadline passed at `now` while the group is still active.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.expires_at < now
    }
}

/// One persisted slice of a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    /// Owning group.
    pub group_id: GroupId,
    /// Position within the group.
    pub sequence: SequenceNumber,
    /// Fragment bytes.
    pub payload: Bytes,
    /// When the fragment was written.
    pub received_at: DateTime<Utc>,
}

impl Fragment {
    /// Reference to this fragment for the dispatch layer.
    #[must_use]
    pub fn to_ref(&self) -> FragmentRef {
        FragmentRef {
            group_id: self.group_id,
            sequence: self.sequence,
            len: self.payload.len(),
        }
    }
}

/// Lightweight handle on a stored fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentRef {
    /// Owning group.
    pub group_id: GroupId,
    /// Position within the group.
    pub sequence: SequenceNumber,
    /// Payload length in bytes.
    pub len: usize,
}
