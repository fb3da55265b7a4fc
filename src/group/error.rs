//! Error types emitted by the split-and-join layer.

use std::{io, time::Duration};

use thiserror::Error;

use super::{GroupId, GroupStatus, SequenceNumber};
use crate::{config::ConfigError, message::MessageId, store::StoreError};

/// Errors produced while splitting an outbound payload.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FragmentationError {
    /// The configuration snapshot was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The store refused or timed out.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Reading the payload stream failed.
    #[error("failed to read payload: {0}")]
    Read(#[source] io::Error),
    /// The payload stream stalled for longer than the I/O bound.
    #[error("payload read timed out after {limit:?}")]
    ReadTimeout {
        /// Bound that was exceeded.
        limit: Duration,
    },
    /// Deflating the payload failed.
    #[error("failed to compress payload: {0}")]
    Compression(#[source] io::Error),
    /// The payload needs more fragments than a sequence number can address.
    #[error("fragment sequence overflow in group {group_id}")]
    SequenceOverflow {
        /// Group being written.
        group_id: GroupId,
    },
    /// The generated group id was already taken.
    #[error("group {group_id} already exists")]
    DuplicateGroup {
        /// Colliding id.
        group_id: GroupId,
    },
    /// Another actor moved the group out of `CREATING` while it was written.
    #[error("split of group {group_id} cancelled: group is {status}")]
    Cancelled {
        /// Group being written.
        group_id: GroupId,
        /// Status observed when the split noticed the cancellation.
        status: GroupStatus,
    },
    /// The group does not exist.
    #[error("group {group_id} not found")]
    GroupNotFound {
        /// Missing group.
        group_id: GroupId,
    },
    /// The group is not in a status that allows the requested operation.
    #[error("group {group_id} is {status}")]
    GroupClosed {
        /// Group addressed by the call.
        group_id: GroupId,
        /// Status found in the store.
        status: GroupStatus,
    },
}

/// Errors produced while accepting or joining inbound fragments.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReassemblyError {
    /// The configuration snapshot was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The store refused or timed out.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The fragment addresses a slot outside its declared group.
    #[error("fragment {sequence} out of range for group {group_id} of {total} fragments")]
    SequenceOutOfRange {
        /// Group named by the fragment.
        group_id: GroupId,
        /// Offending sequence number.
        sequence: SequenceNumber,
        /// Declared fragment count.
        total: u32,
    },
    /// The declared fragment count disagrees with the stored group.
    #[error("group {group_id} declares {found} fragments but was created with {expected}")]
    TotalMismatch {
        /// Group named by the fragment.
        group_id: GroupId,
        /// Count stored with the group.
        expected: u32,
        /// Count carried by the fragment.
        found: u32,
    },
    /// The fragment names a different source message than the stored group.
    #[error("group {group_id} belongs to {expected}, fragment names {found}")]
    SourceMismatch {
        /// Group named by the fragment.
        group_id: GroupId,
        /// Message stored with the group.
        expected: MessageId,
        /// Message carried by the fragment.
        found: MessageId,
    },
    /// The group was created by the local sender and cannot receive.
    #[error("group {group_id} is a sending group")]
    RoleMismatch {
        /// Group named by the fragment.
        group_id: GroupId,
    },
    /// The collected fragments do not form a valid payload.
    #[error("group {group_id} failed integrity check: {reason}")]
    Integrity {
        /// Failed group.
        group_id: GroupId,
        /// What was wrong.
        reason: String,
    },
}
