//! Inbound helper that stitches stored fragments back into a payload.
//!
//! [`Reassembler`] keeps no state of its own. Each accepted fragment is
//! persisted idempotently and the stored count decides completion. Several
//! workers may accept fragments of the same group concurrently; only the one
//! that wins the `RECEIVING -> REASSEMBLING` conditional update joins the
//! payload, and it does so on the blocking pool.

use std::{io::Read as _, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::DeflateDecoder;
use tracing::{debug, info, warn};

use super::{
    Fragment,
    GroupId,
    GroupStatus,
    MessageGroup,
    ReassemblyError,
    SequenceNumber,
    cleanup::release_fragments,
};
use crate::{
    config::{ConfigError, ConfigSource, CoreConfig},
    message::{MessageId, Role},
    metrics::{self, GroupOutcome},
    sink::{StatusEvent, StatusSink},
    store::{SplitJoinStore, bounded},
};

/// One fragment as received from the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundFragment {
    /// Group the fragment belongs to.
    pub group_id: GroupId,
    /// Message being joined.
    pub source_message_id: MessageId,
    /// Position within the group.
    pub sequence: SequenceNumber,
    /// Fragment count declared by the sender.
    pub total_fragment_count: u32,
    /// Whether the sender deflated the stream.
    pub compressed: bool,
    /// Fragment bytes.
    pub payload: Bytes,
}

/// Payload rebuilt from a complete group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReassembledMessage {
    /// Group the payload was rebuilt from.
    pub group_id: GroupId,
    /// Message the payload belongs to.
    pub source_message_id: MessageId,
    /// Rebuilt bytes.
    pub payload: Bytes,
}

/// Result of accepting one fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Stored; more fragments are expected.
    Buffered {
        /// Distinct fragments stored so far.
        received: u32,
        /// Declared fragment count.
        total: u32,
    },
    /// The slot was already filled or the group already finished; nothing
    /// changed.
    Duplicate,
    /// This fragment completed the group.
    Completed(ReassembledMessage),
    /// The group expired or failed; the fragment was discarded.
    Closed {
        /// Terminal status of the group.
        status: GroupStatus,
    },
}

/// Accepts inbound fragments and rebuilds complete payloads.
pub struct Reassembler {
    store: Arc<dyn SplitJoinStore>,
    config: Arc<dyn ConfigSource>,
    sink: Arc<dyn StatusSink>,
}

impl Reassembler {
    /// Create a reassembler backed by `store`.
    #[must_use]
    pub fn new(
        store: Arc<dyn SplitJoinStore>,
        config: Arc<dyn ConfigSource>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            store,
            config,
            sink,
        }
    }

    /// Accept a fragment using the current time.
    ///
    /// # Errors
    ///
    /// See [`Reassembler::accept_fragment_at`].
    pub async fn accept_fragment(
        &self,
        fragment: InboundFragment,
    ) -> Result<AcceptOutcome, ReassemblyError> {
        self.accept_fragment_at(fragment, Utc::now()).await
    }

    /// Accept a fragment using an explicit clock reading.
    ///
    /// The first fragment of an unseen group creates it in `RECEIVING` with a
    /// deadline of `now + group_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ReassemblyError::SequenceOutOfRange`],
    /// [`ReassemblyError::TotalMismatch`], [`ReassemblyError::SourceMismatch`]
    /// or [`ReassemblyError::RoleMismatch`] for fragments that cannot belong to
    /// the group; nothing is stored in those cases. Returns
    /// [`ReassemblyError::Integrity`] when the complete group cannot be joined,
    /// after moving it to `FAILED`.
    pub async fn accept_fragment_at(
        &self,
        fragment: InboundFragment,
        now: DateTime<Utc>,
    ) -> Result<AcceptOutcome, ReassemblyError> {
        let config = self.config.snapshot();
        config.validate()?;
        let group_id = fragment.group_id;
        let total = fragment.total_fragment_count;
        if !fragment.sequence.is_within(total) {
            return Err(ReassemblyError::SequenceOutOfRange {
                group_id,
                sequence: fragment.sequence,
                total,
            });
        }

        let group = self.open_group(&fragment, &config, now).await?;
        match group.status {
            GroupStatus::Receiving => {}
            GroupStatus::Reassembling | GroupStatus::Completed => {
                debug!(%group_id, sequence = %fragment.sequence, "fragment for finished group");
                return Ok(AcceptOutcome::Duplicate);
            }
            status @ (GroupStatus::Expired | GroupStatus::Failed) => {
                debug!(%group_id, %status, "fragment for closed group discarded");
                return Ok(AcceptOutcome::Closed { status });
            }
            GroupStatus::Creating | GroupStatus::Sending => {
                return Err(ReassemblyError::RoleMismatch { group_id });
            }
        }

        let sequence = fragment.sequence;
        let stored = bounded(
            config.io_timeout,
            "put_fragment",
            self.store.put_fragment(Fragment {
                group_id,
                sequence,
                payload: fragment.payload,
                received_at: now,
            }),
        )
        .await?;
        if !stored {
            debug!(%group_id, %sequence, "duplicate fragment ignored");
            return Ok(AcceptOutcome::Duplicate);
        }
        metrics::add_fragments_written(1);

        // The sweeper may have closed the group while the fragment was written.
        let current = self.load_group(group_id, &config).await?;
        if current.status.is_terminal() {
            self.release(group_id, &config).await;
            return Ok(AcceptOutcome::Closed {
                status: current.status,
            });
        }

        let received = bounded(
            config.io_timeout,
            "fragment_count",
            self.store.fragment_count(group_id),
        )
        .await?;
        if received < total {
            return Ok(AcceptOutcome::Buffered { received, total });
        }

        let won = bounded(
            config.io_timeout,
            "transition_group",
            self.store.transition_group(
                group_id,
                GroupStatus::Receiving,
                GroupStatus::Reassembling,
            ),
        )
        .await?;
        if !won {
            let current = self.load_group(group_id, &config).await?;
            return Ok(match current.status {
                status @ (GroupStatus::Expired | GroupStatus::Failed) => {
                    AcceptOutcome::Closed { status }
                }
                _ => AcceptOutcome::Buffered { received, total },
            });
        }

        match self.join(&group, &config).await {
            Ok(payload) => self.complete(group, payload, &config).await,
            Err(e) => {
                if self.fail(&group, &e, &config).await {
                    return Err(e);
                }
                // Expired while joining; the sweeper owns the report.
                let current = self.load_group(group_id, &config).await?;
                if current.status.is_terminal() {
                    debug!(%group_id, status = %current.status, error = %e, "join abandoned for closed group");
                    return Ok(AcceptOutcome::Closed {
                        status: current.status,
                    });
                }
                Err(e)
            }
        }
    }

    async fn open_group(
        &self,
        fragment: &InboundFragment,
        config: &CoreConfig,
        now: DateTime<Utc>,
    ) -> Result<MessageGroup, ReassemblyError> {
        let group_id = fragment.group_id;
        let expires_at = now
            .checked_add_signed(config.group_timeout_delta()?)
            .ok_or(ConfigError::DurationOutOfRange {
                name: "group_timeout",
            })?;
        let candidate = MessageGroup {
            group_id,
            source_message_id: fragment.source_message_id.clone(),
            role: Role::Receiving,
            total_fragment_count: fragment.total_fragment_count,
            compression_enabled: fragment.compressed,
            status: GroupStatus::Receiving,
            created_at: now,
            expires_at,
        };
        let created = bounded(
            config.io_timeout,
            "insert_group",
            self.store.insert_group(candidate.clone()),
        )
        .await?;
        if created {
            info!(
                %group_id,
                message_id = %candidate.source_message_id,
                total = candidate.total_fragment_count,
                "receiving group created"
            );
            return Ok(candidate);
        }

        let group = self.load_group(group_id, config).await?;
        if group.role != Role::Receiving {
            return Err(ReassemblyError::RoleMismatch { group_id });
        }
        if group.total_fragment_count != fragment.total_fragment_count {
            return Err(ReassemblyError::TotalMismatch {
                group_id,
                expected: group.total_fragment_count,
                found: fragment.total_fragment_count,
            });
        }
        if group.source_message_id != fragment.source_message_id {
            return Err(ReassemblyError::SourceMismatch {
                group_id,
                expected: group.source_message_id,
                found: fragment.source_message_id.clone(),
            });
        }
        Ok(group)
    }

    async fn load_group(
        &self,
        group_id: GroupId,
        config: &CoreConfig,
    ) -> Result<MessageGroup, ReassemblyError> {
        bounded(config.io_timeout, "load_group", self.store.load_group(group_id))
            .await?
            .ok_or_else(|| ReassemblyError::Integrity {
                group_id,
                reason: "group record disappeared".into(),
            })
    }

    async fn join(
        &self,
        group: &MessageGroup,
        config: &CoreConfig,
    ) -> Result<Bytes, ReassemblyError> {
        let fragments = bounded(
            config.io_timeout,
            "load_fragments",
            self.store.load_fragments(group.group_id),
        )
        .await?;
        let group_id = group.group_id;
        let total = group.total_fragment_count;
        let compressed = group.compression_enabled;
        tokio::task::spawn_blocking(move || concatenate(group_id, total, compressed, &fragments))
            .await
            .map_err(|e| ReassemblyError::Integrity {
                group_id,
                reason: format!("join task failed: {e}"),
            })?
    }

    async fn complete(
        &self,
        group: MessageGroup,
        payload: Bytes,
        config: &CoreConfig,
    ) -> Result<AcceptOutcome, ReassemblyError> {
        let group_id = group.group_id;
        let moved = bounded(
            config.io_timeout,
            "transition_group",
            self.store.transition_group(
                group_id,
                GroupStatus::Reassembling,
                GroupStatus::Completed,
            ),
        )
        .await?;
        self.release(group_id, config).await;
        if !moved {
            // Expired while joining; the sweeper reported it.
            let current = self.load_group(group_id, config).await?;
            return Ok(AcceptOutcome::Closed {
                status: current.status,
            });
        }
        metrics::inc_groups_finished(GroupOutcome::Completed);
        info!(%group_id, message_id = %group.source_message_id, bytes = payload.len(), "group reassembled");
        Ok(AcceptOutcome::Completed(ReassembledMessage {
            group_id,
            source_message_id: group.source_message_id,
            payload,
        }))
    }

    /// Move a reassembling group to `FAILED`; returns whether this call won.
    async fn fail(&self, group: &MessageGroup, cause: &ReassemblyError, config: &CoreConfig) -> bool {
        let group_id = group.group_id;
        let moved = match bounded(
            config.io_timeout,
            "transition_group",
            self.store.transition_group(
                group_id,
                GroupStatus::Reassembling,
                GroupStatus::Failed,
            ),
        )
        .await
        {
            Ok(moved) => moved,
            Err(e) => {
                warn!(%group_id, error = %e, "could not mark group failed");
                false
            }
        };
        self.release(group_id, config).await;
        if moved {
            warn!(%group_id, error = %cause, "reassembly failed");
            metrics::inc_groups_finished(GroupOutcome::Failed);
            self.sink
                .notify(StatusEvent::GroupFailed {
                    group_id,
                    source_message_id: group.source_message_id.clone(),
                    role: Role::Receiving,
                    reason: cause.to_string(),
                })
                .await;
        }
        moved
    }

    async fn release(&self, group_id: GroupId, config: &CoreConfig) {
        if let Err(e) = release_fragments(self.store.as_ref(), group_id, config).await {
            warn!(%group_id, error = %e, "fragments not released");
        }
    }
}

impl std::fmt::Debug for Reassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reassembler").finish_non_exhaustive()
    }
}

/// Join fragments in sequence order, inflating when `compressed` is set.
fn concatenate(
    group_id: GroupId,
    total: u32,
    compressed: bool,
    fragments: &[Fragment],
) -> Result<Bytes, ReassemblyError> {
    let integrity = |reason: String| ReassemblyError::Integrity { group_id, reason };
    let count = u32::try_from(fragments.len()).map_err(|_| integrity("too many fragments".into()))?;
    if count != total {
        return Err(integrity(format!("expected {total} fragments, found {count}")));
    }

    let size = fragments.iter().map(|f| f.payload.len()).sum();
    let mut joined = Vec::with_capacity(size);
    for (expected, fragment) in (0..total).map(SequenceNumber::new).zip(fragments) {
        if fragment.sequence != expected {
            return Err(integrity(format!("missing fragment {expected}")));
        }
        joined.extend_from_slice(&fragment.payload);
    }

    if !compressed {
        return Ok(Bytes::from(joined));
    }
    let mut inflated = Vec::new();
    DeflateDecoder::new(joined.as_slice())
        .read_to_end(&mut inflated)
        .map_err(|e| integrity(format!("corrupt compressed stream: {e}")))?;
    Ok(Bytes::from(inflated))
}
