//! Periodic expiry of split and join transfers that ran out of time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

use super::{GroupId, GroupStatus, cleanup::release_fragments};
use crate::{
    config::ConfigSource,
    metrics::{self, GroupOutcome},
    sink::{StatusEvent, StatusSink},
    store::{SplitJoinStore, bounded},
    worker::{WorkerError, run_periodic},
};

/// Summary of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Groups this sweep moved to `EXPIRED`.
    pub expired: Vec<GroupId>,
    /// Groups that changed status before the sweep could expire them.
    pub skipped: usize,
}

/// Expires overdue groups and releases their fragments.
pub struct GroupExpirationSweeper {
    store: Arc<dyn SplitJoinStore>,
    config: Arc<dyn ConfigSource>,
    sink: Arc<dyn StatusSink>,
    cleanup: TaskTracker,
}

impl GroupExpirationSweeper {
    /// Create a sweeper over `store`.
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
            cleanup: TaskTracker::new(),
        }
    }

    /// Run one sweep at `now`.
    ///
    /// Each overdue group is moved to `EXPIRED` with a conditional update from
    /// the status the scan observed, so a group that completed in the
    /// meantime is left alone. Fragment cleanup is scheduled in the
    /// background.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the snapshot is invalid or the store
    /// refuses the scan. Failures on individual groups are logged and left
    /// for the next sweep.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, WorkerError> {
        let config = self.config.snapshot();
        config.validate()?;
        let overdue = bounded(
            config.io_timeout,
            "find_expired_groups",
            self.store.find_expired_groups(now),
        )
        .await?;

        let mut report = SweepReport::default();
        for group in overdue {
            let group_id = group.group_id;
            let moved = bounded(
                config.io_timeout,
                "transition_group",
                self.store
                    .transition_group(group_id, group.status, GroupStatus::Expired),
            )
            .await;
            match moved {
                Ok(true) => {}
                Ok(false) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(%group_id, error = %e, "could not expire group");
                    continue;
                }
            }

            info!(
                %group_id,
                message_id = %group.source_message_id,
                role = %group.role,
                was = %group.status,
                "group expired"
            );
            metrics::inc_groups_finished(GroupOutcome::Expired);
            self.sink
                .notify(StatusEvent::GroupExpired {
                    group_id,
                    source_message_id: group.source_message_id,
                    role: group.role,
                })
                .await;

            let store = Arc::clone(&self.store);
            let config = config.clone();
            self.cleanup.spawn(async move {
                // Failures are logged inside; the group stays expired either way.
                let _ = release_fragments(store.as_ref(), group_id, &config).await;
            });
            report.expired.push(group_id);
        }
        Ok(report)
    }

    /// Run one sweep using the current time.
    ///
    /// # Errors
    ///
    /// See [`GroupExpirationSweeper::sweep_at`].
    pub async fn sweep(&self) -> Result<SweepReport, WorkerError> { self.sweep_at(Utc::now()).await }

    /// Sweep every `sweep_interval` until `shutdown` is cancelled, then wait
    /// for scheduled cleanups to finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.snapshot().sweep_interval;
        run_periodic("group-sweeper", period, shutdown, || self.sweep()).await;
        self.wait_for_cleanup().await;
    }

    /// Wait until every scheduled fragment cleanup has finished.
    pub async fn wait_for_cleanup(&self) {
        self.cleanup.close();
        self.cleanup.wait().await;
        self.cleanup.reopen();
    }
}

impl std::fmt::Debug for GroupExpirationSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupExpirationSweeper")
            .field("pending_cleanups", &self.cleanup.len())
            .finish_non_exhaustive()
    }
}
