//! Periodic handoff of due retries to the dispatch boundary.
//!
//! Each run releases claims whose dispatch never happened, claims the
//! deliveries that are due, hands each one to the [`OutboundDispatcher`] and
//! finally abandons pull messages nobody collected in time. A claim is taken
//! atomically by the store, so concurrent schedulers, in this process or
//! another, never hand off the same delivery twice for one retry window.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use leaky_bucket::RateLimiter;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{DeliveryState, DeliveryStateTracker};
use crate::{
    config::ConfigSource,
    dispatch::{DispatchError, DispatchRequest, OutboundDispatcher},
    message::MessageId,
    metrics,
    worker::{WorkerError, run_periodic},
};

/// Summary of one scheduler run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    /// Claims released because they outlived the grace period.
    pub released_stale: Vec<MessageId>,
    /// Deliveries handed to the dispatch boundary.
    pub dispatched: Vec<MessageId>,
    /// Deliveries whose handoff was refused; their claims were released.
    pub refused: Vec<MessageId>,
    /// Waiting deliveries abandoned because nobody pulled them.
    pub expired_waiting: Vec<MessageId>,
}

/// Hands due retries to the dispatch boundary.
pub struct RetryScheduler {
    tracker: Arc<DeliveryStateTracker>,
    dispatcher: Arc<dyn OutboundDispatcher>,
    config: Arc<dyn ConfigSource>,
    limiter: Option<RateLimiter>,
}

impl RetryScheduler {
    /// Create a scheduler.
    ///
    /// The handoff rate limit is read from the configuration once, here.
    #[must_use]
    pub fn new(
        tracker: Arc<DeliveryStateTracker>,
        dispatcher: Arc<dyn OutboundDispatcher>,
        config: Arc<dyn ConfigSource>,
    ) -> Self {
        let limiter = config
            .snapshot()
            .dispatch_rate_per_second
            .filter(|r| *r > 0)
            .map(|r| {
                RateLimiter::builder()
                    .initial(r)
                    .refill(r)
                    .interval(Duration::from_secs(1))
                    .max(r)
                    .build()
            });
        Self {
            tracker,
            dispatcher,
            config,
            limiter,
        }
    }

    /// Run one scheduling pass at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the snapshot is invalid or a store call
    /// fails. Handoff refusals are not errors; they are listed in the report.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<SchedulerReport, WorkerError> {
        let config = self.config.snapshot();
        config.validate()?;

        let released_stale = self.tracker.release_stale_claims_at(now).await?;
        let claimed = self.tracker.claim_due_at(now).await?;

        let mut report = SchedulerReport {
            released_stale,
            ..SchedulerReport::default()
        };
        for state in claimed {
            if let Some(limiter) = &self.limiter {
                limiter.acquire(1).await;
            }
            match self.hand_off(&state, config.io_timeout).await {
                Ok(()) => {
                    metrics::inc_retries_scheduled();
                    info!(
                        message_id = %state.message_id,
                        attempt = state.attempt_count + 1,
                        "retry handed off"
                    );
                    report.dispatched.push(state.message_id);
                }
                Err(e) => {
                    warn!(message_id = %state.message_id, error = %e, "retry handoff refused; releasing claim");
                    if let Err(release) = self.tracker.release_claim(&state).await {
                        warn!(
                            message_id = %state.message_id,
                            error = %release,
                            "claim release failed; stale-claim sweep will recover it"
                        );
                    }
                    report.refused.push(state.message_id);
                }
            }
        }

        report.expired_waiting = self.tracker.expire_waiting_at(now).await?;
        Ok(report)
    }

    /// Run one scheduling pass using the current time.
    ///
    /// # Errors
    ///
    /// See [`RetryScheduler::run_once_at`].
    pub async fn run_once(&self) -> Result<SchedulerReport, WorkerError> {
        self.run_once_at(Utc::now()).await
    }

    /// Schedule every `retry_interval` until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.snapshot().retry_interval;
        run_periodic("retry-scheduler", period, shutdown, || self.run_once()).await;
    }

    async fn hand_off(&self, state: &DeliveryState, limit: Duration) -> Result<(), DispatchError> {
        let request = DispatchRequest::retry(state.message_id.clone(), state.attempt_count + 1);
        tokio::time::timeout(limit, self.dispatcher.dispatch(request))
            .await
            .map_err(|_| DispatchError::Rejected(format!("handoff timed out after {limit:?}")))?
    }
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("rate_limited", &self.limiter.is_some())
            .finish_non_exhaustive()
    }
}
