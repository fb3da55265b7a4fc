//! Outbound helper that splits a payload into stored fragments.
//!
//! [`Fragmenter`] consumes an async byte stream, optionally deflates it, and
//! cuts the result into consecutive fragments of at most `max_fragment_bytes`.
//! The group is created in [`GroupStatus::Creating`] before the first
//! fragment is written and sealed into [`GroupStatus::Sending`] once the
//! stream is exhausted. Any failure on the way moves the group to
//! [`GroupStatus::Failed`] and releases what was already written.

use std::{io::Write as _, num::NonZeroUsize, sync::Arc};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use flate2::{Compression, write::DeflateEncoder};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{Instrument, debug, info, info_span, warn};

use super::{
    Fragment,
    FragmentRef,
    FragmentationError,
    GroupId,
    GroupIdGenerator,
    GroupStatus,
    MessageGroup,
    RandomGroupIds,
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

/// Size of each read from the payload stream.
const READ_CHUNK: usize = 64 * 1024;

/// Per-call splitting parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitOptions {
    /// Maximum number of bytes carried by one fragment.
    pub max_fragment_bytes: usize,
    /// Whether to deflate the stream before cutting it.
    pub compress: bool,
}

impl SplitOptions {
    /// Options taken from a configuration snapshot.
    #[must_use]
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            max_fragment_bytes: config.max_fragment_bytes,
            compress: config.compress_fragments,
        }
    }
}

/// Result of a successful split.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitOutcome {
    /// Sealed group descriptor.
    pub group: MessageGroup,
    /// Fragment references in sequence order.
    pub fragments: Vec<FragmentRef>,
}

/// Splits outbound payloads into stored fragment groups.
pub struct Fragmenter {
    store: Arc<dyn SplitJoinStore>,
    config: Arc<dyn ConfigSource>,
    sink: Arc<dyn StatusSink>,
    ids: Arc<dyn GroupIdGenerator>,
}

impl Fragmenter {
    /// Create a fragmenter issuing random group ids.
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
            ids: Arc::new(RandomGroupIds),
        }
    }

    /// Replace the group id generator.
    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn GroupIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Split `payload` using the current time.
    ///
    /// # Errors
    ///
    /// See [`Fragmenter::split_at`].
    pub async fn split<R>(
        &self,
        source_message_id: MessageId,
        payload: R,
        options: SplitOptions,
    ) -> Result<SplitOutcome, FragmentationError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.split_at(source_message_id, payload, options, Utc::now())
            .await
    }

    /// Split `payload` using an explicit clock reading.
    ///
    /// An empty payload produces a single empty fragment.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentationError::Config`] for an invalid snapshot or a zero
    /// fragment size, [`FragmentationError::Cancelled`] when another actor
    /// moved the group out of `CREATING`, and read, compression or store
    /// errors otherwise. On every error after the group was created it is
    /// moved to `FAILED` (unless already terminal) and its fragments are
    /// released.
    pub async fn split_at<R>(
        &self,
        source_message_id: MessageId,
        payload: R,
        options: SplitOptions,
        now: DateTime<Utc>,
    ) -> Result<SplitOutcome, FragmentationError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let config = self.config.snapshot();
        config.validate()?;
        let max = NonZeroUsize::new(options.max_fragment_bytes)
            .ok_or(ConfigError::NonPositiveFragmentSize)?;
        let expires_at = now
            .checked_add_signed(config.group_timeout_delta()?)
            .ok_or(ConfigError::DurationOutOfRange {
                name: "group_timeout",
            })?;

        let group_id = self.ids.next_group_id();
        let mut group = MessageGroup {
            group_id,
            source_message_id,
            role: Role::Sending,
            total_fragment_count: 0,
            compression_enabled: options.compress,
            status: GroupStatus::Creating,
            created_at: now,
            expires_at,
        };
        let inserted = bounded(
            config.io_timeout,
            "insert_group",
            self.store.insert_group(group.clone()),
        )
        .await?;
        if !inserted {
            return Err(FragmentationError::DuplicateGroup { group_id });
        }

        let span = info_span!("split", %group_id, message_id = %group.source_message_id);
        let written = async {
            let fragments = self
                .write_fragments(group_id, payload, max, options.compress, &config, now)
                .await?;
            let total = u32::try_from(fragments.len())
                .map_err(|_| FragmentationError::SequenceOverflow { group_id })?;
            self.seal(group_id, total, &config).await?;
            Ok::<_, FragmentationError>(fragments)
        }
        .instrument(span)
        .await;

        match written {
            Ok(fragments) => {
                group.total_fragment_count = u32::try_from(fragments.len())
                    .map_err(|_| FragmentationError::SequenceOverflow { group_id })?;
                group.status = GroupStatus::Sending;
                info!(
                    %group_id,
                    message_id = %group.source_message_id,
                    fragments = group.total_fragment_count,
                    compressed = group.compression_enabled,
                    "payload split"
                );
                Ok(SplitOutcome { group, fragments })
            }
            Err(e) => {
                self.abort(&group, &e, &config).await;
                Err(e)
            }
        }
    }

    async fn write_fragments<R>(
        &self,
        group_id: GroupId,
        mut payload: R,
        max: NonZeroUsize,
        compress: bool,
        config: &CoreConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<FragmentRef>, FragmentationError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut chunker = Chunker::new(max, compress);
        let mut written = Vec::new();
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            buf.clear();
            buf.reserve(READ_CHUNK);
            let read = tokio::time::timeout(config.io_timeout, payload.read_buf(&mut buf))
                .await
                .map_err(|_| FragmentationError::ReadTimeout {
                    limit: config.io_timeout,
                })?
                .map_err(FragmentationError::Read)?;
            if read == 0 {
                break;
            }
            chunker.push(&buf[..read])?;
            while let Some(chunk) = chunker.next_full() {
                self.persist(group_id, &mut written, chunk, config, now)
                    .await?;
            }
        }

        for chunk in chunker.finish()? {
            self.persist(group_id, &mut written, chunk, config, now)
                .await?;
        }
        if written.is_empty() {
            self.persist(group_id, &mut written, Bytes::new(), config, now)
                .await?;
        }
        Ok(written)
    }

    async fn persist(
        &self,
        group_id: GroupId,
        written: &mut Vec<FragmentRef>,
        payload: Bytes,
        config: &CoreConfig,
        now: DateTime<Utc>,
    ) -> Result<(), FragmentationError> {
        let sequence = SequenceNumber::try_from(written.len())
            .map_err(|_| FragmentationError::SequenceOverflow { group_id })?;
        let fragment = Fragment {
            group_id,
            sequence,
            payload,
            received_at: now,
        };
        let reference = fragment.to_ref();
        let stored = bounded(
            config.io_timeout,
            "put_fragment",
            self.store.put_fragment(fragment),
        )
        .await?;
        if !stored {
            debug!(%group_id, %sequence, "fragment slot already filled");
        }
        written.push(reference);
        metrics::add_fragments_written(1);

        let every = usize::try_from(config.cancellation_check_every).unwrap_or(usize::MAX);
        if written.len().is_multiple_of(every) {
            self.ensure_creating(group_id, config).await?;
        }
        Ok(())
    }

    async fn ensure_creating(
        &self,
        group_id: GroupId,
        config: &CoreConfig,
    ) -> Result<(), FragmentationError> {
        let group = bounded(config.io_timeout, "load_group", self.store.load_group(group_id))
            .await?
            .ok_or(FragmentationError::GroupNotFound { group_id })?;
        if group.status == GroupStatus::Creating {
            Ok(())
        } else {
            Err(FragmentationError::Cancelled {
                group_id,
                status: group.status,
            })
        }
    }

    async fn seal(
        &self,
        group_id: GroupId,
        total: u32,
        config: &CoreConfig,
    ) -> Result<(), FragmentationError> {
        let sealed = bounded(
            config.io_timeout,
            "seal_group",
            self.store.seal_group(group_id, total),
        )
        .await?;
        if sealed {
            return Ok(());
        }
        // Lost the race: report whatever moved the group.
        self.ensure_creating(group_id, config).await?;
        Err(FragmentationError::GroupClosed {
            group_id,
            status: GroupStatus::Creating,
        })
    }

    async fn abort(&self, group: &MessageGroup, cause: &FragmentationError, config: &CoreConfig) {
        let group_id = group.group_id;
        let failed = match bounded(
            config.io_timeout,
            "transition_group",
            self.store
                .transition_group(group_id, GroupStatus::Creating, GroupStatus::Failed),
        )
        .await
        {
            Ok(moved) => moved,
            Err(e) => {
                warn!(%group_id, error = %e, "could not mark group failed");
                false
            }
        };
        if let Err(e) = release_fragments(self.store.as_ref(), group_id, config).await {
            warn!(%group_id, error = %e, "fragments of aborted split not released");
        }
        if failed {
            warn!(%group_id, error = %cause, "split failed");
            metrics::inc_groups_finished(GroupOutcome::Failed);
            self.sink
                .notify(StatusEvent::GroupFailed {
                    group_id,
                    source_message_id: group.source_message_id.clone(),
                    role: Role::Sending,
                    reason: cause.to_string(),
                })
                .await;
        } else {
            info!(%group_id, reason = %cause, "split stopped");
        }
    }

    /// Mark a sealed group as delivered and release its fragments.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentationError::GroupNotFound`] for an unknown group and
    /// [`FragmentationError::GroupClosed`] when the group is not `SENDING`.
    pub async fn complete_sending(&self, group_id: GroupId) -> Result<(), FragmentationError> {
        let config = self.config.snapshot();
        let moved = bounded(
            config.io_timeout,
            "transition_group",
            self.store
                .transition_group(group_id, GroupStatus::Sending, GroupStatus::Completed),
        )
        .await?;
        if !moved {
            return Err(self.closed_error(group_id, &config).await);
        }
        metrics::inc_groups_finished(GroupOutcome::Completed);
        info!(%group_id, "split group delivered");
        if let Err(e) = release_fragments(self.store.as_ref(), group_id, &config).await {
            warn!(%group_id, error = %e, "fragments of delivered group not released");
        }
        Ok(())
    }

    /// Mark a split group as failed, release its fragments and notify the sink.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentationError::GroupNotFound`] for an unknown group and
    /// [`FragmentationError::GroupClosed`] when the group is already terminal
    /// or was moved concurrently.
    pub async fn fail_sending(
        &self,
        group_id: GroupId,
        reason: &str,
    ) -> Result<(), FragmentationError> {
        let config = self.config.snapshot();
        let group = bounded(config.io_timeout, "load_group", self.store.load_group(group_id))
            .await?
            .ok_or(FragmentationError::GroupNotFound { group_id })?;
        if group.role != Role::Sending || group.status.is_terminal() {
            return Err(FragmentationError::GroupClosed {
                group_id,
                status: group.status,
            });
        }
        let moved = bounded(
            config.io_timeout,
            "transition_group",
            self.store
                .transition_group(group_id, group.status, GroupStatus::Failed),
        )
        .await?;
        if !moved {
            return Err(self.closed_error(group_id, &config).await);
        }
        warn!(%group_id, reason, "split group failed");
        metrics::inc_groups_finished(GroupOutcome::Failed);
        if let Err(e) = release_fragments(self.store.as_ref(), group_id, &config).await {
            warn!(%group_id, error = %e, "fragments of failed group not released");
        }
        self.sink
            .notify(StatusEvent::GroupFailed {
                group_id,
                source_message_id: group.source_message_id,
                role: Role::Sending,
                reason: reason.to_owned(),
            })
            .await;
        Ok(())
    }

    /// Read one stored fragment for the dispatch layer.
    ///
    /// Returns `None` once the fragment has been released.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentationError::Store`] when the store refuses.
    pub async fn load_fragment(
        &self,
        reference: FragmentRef,
    ) -> Result<Option<Fragment>, FragmentationError> {
        let config = self.config.snapshot();
        let fragment = bounded(
            config.io_timeout,
            "load_fragment",
            self.store
                .load_fragment(reference.group_id, reference.sequence),
        )
        .await?;
        Ok(fragment)
    }

    async fn closed_error(&self, group_id: GroupId, config: &CoreConfig) -> FragmentationError {
        match bounded(config.io_timeout, "load_group", self.store.load_group(group_id)).await {
            Ok(Some(group)) => FragmentationError::GroupClosed {
                group_id,
                status: group.status,
            },
            Ok(None) => FragmentationError::GroupNotFound { group_id },
            Err(e) => FragmentationError::Store(e),
        }
    }
}

/// Accumulates stream bytes and emits fixed-size chunks.
struct Chunker {
    max: usize,
    pending: BytesMut,
    encoder: Option<DeflateEncoder<Vec<u8>>>,
}

impl Chunker {
    fn new(max: NonZeroUsize, compress: bool) -> Self {
        Self {
            max: max.get(),
            pending: BytesMut::new(),
            encoder: compress.then(|| DeflateEncoder::new(Vec::new(), Compression::default())),
        }
    }

    fn push(&mut self, data: &[u8]) -> Result<(), FragmentationError> {
        match self.encoder.as_mut() {
            Some(encoder) => {
                encoder
                    .write_all(data)
                    .map_err(FragmentationError::Compression)?;
                let produced = encoder.get_mut();
                self.pending.extend_from_slice(produced);
                produced.clear();
            }
            None => self.pending.extend_from_slice(data),
        }
        Ok(())
    }

    fn next_full(&mut self) -> Option<Bytes> {
        (self.pending.len() >= self.max).then(|| self.pending.split_to(self.max).freeze())
    }

    fn finish(mut self) -> Result<Vec<Bytes>, FragmentationError> {
        if let Some(encoder) = self.encoder.take() {
            let tail = encoder.finish().map_err(FragmentationError::Compression)?;
            self.pending.extend_from_slice(&tail);
        }
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_full() {
            chunks.push(chunk);
        }
        if !self.pending.is_empty() {
            chunks.push(self.pending.split().freeze());
        }
        Ok(chunks)
    }
}

impl std::fmt::Debug for Fragmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fragmenter").finish_non_exhaustive()
    }
}
