//! Metric helpers for the delivery core.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. With the `metrics` feature
//! disabled the helpers compile to no-ops.

#[cfg(feature = "metrics")]
use metrics::counter;

/// Name of the counter tracking persisted fragments.
pub const FRAGMENTS_WRITTEN: &str = "msh_fragments_written_total";
/// Name of the counter tracking groups that reached a terminal status.
pub const GROUPS_FINISHED: &str = "msh_groups_finished_total";
/// Name of the counter tracking retries handed to the dispatch boundary.
pub const RETRIES_SCHEDULED: &str = "msh_retries_scheduled_total";
/// Name of the counter tracking abandoned deliveries.
pub const DELIVERIES_ABANDONED: &str = "msh_deliveries_abandoned_total";
/// Name of the counter tracking panics inside periodic workers.
pub const WORKER_PANICS: &str = "msh_worker_panics_total";

/// Terminal status of a group, used as a metric label.
#[derive(Clone, Copy, Debug)]
pub enum GroupOutcome {
    /// The transfer completed.
    Completed,
    /// The sweeper expired the transfer.
    Expired,
    /// The transfer failed.
    Failed,
}

impl GroupOutcome {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            GroupOutcome::Completed => "completed",
            GroupOutcome::Expired => "expired",
            GroupOutcome::Failed => "failed",
        }
    }
}

/// Record `count` persisted fragments.
pub fn add_fragments_written(count: u64) {
    #[cfg(feature = "metrics")]
    counter!(FRAGMENTS_WRITTEN).increment(count);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

/// Record a group reaching a terminal status.
pub fn inc_groups_finished(outcome: GroupOutcome) {
    #[cfg(feature = "metrics")]
    counter!(GROUPS_FINISHED, "outcome" => outcome.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}

/// Record a retry handed to the dispatch boundary.
pub fn inc_retries_scheduled() {
    #[cfg(feature = "metrics")]
    counter!(RETRIES_SCHEDULED).increment(1);
}

/// Record an abandoned delivery.
pub fn inc_deliveries_abandoned() {
    #[cfg(feature = "metrics")]
    counter!(DELIVERIES_ABANDONED).increment(1);
}

/// Record a panic caught inside a periodic worker.
pub fn inc_worker_panics(worker: &'static str) {
    #[cfg(feature = "metrics")]
    counter!(WORKER_PANICS, "worker" => worker).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = worker;
}
