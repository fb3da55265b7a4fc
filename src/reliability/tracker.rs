//! Persistence of delivery lifecycles.
//!
//! [`DeliveryStateTracker`] turns dispatches and outcomes into
//! [`DeliveryState`] transitions. Each transition is computed from the row as
//! read and written back only if the row version is unchanged; on a lost race
//! the row is re-read and the transition re-applied, up to
//! [`MAX_UPDATE_ROUNDS`] times.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{
    DeliveryError,
    DeliveryFilter,
    DeliveryState,
    DeliveryStatus,
    ExchangePattern,
    Outcome,
    OutcomeTransition,
    RetryPolicy,
};
use crate::{
    config::{ConfigSource, CoreConfig},
    message::{MessageId, Role},
    metrics,
    sink::{StatusEvent, StatusSink},
    store::{DeliveryStore, bounded},
};

/// Conditional-update rounds attempted before reporting contention.
pub const MAX_UPDATE_ROUNDS: u32 = 8;

/// Result of recording an outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recorded {
    /// The outcome changed the state; the new state is returned.
    Applied(DeliveryState),
    /// The state was not awaiting an outcome and is returned unchanged.
    Ignored(DeliveryState),
}

impl Recorded {
    /// State after the call.
    #[must_use]
    pub fn state(&self) -> &DeliveryState {
        match self {
            Self::Applied(state) | Self::Ignored(state) => state,
        }
    }
}

/// Maintains one [`DeliveryState`] per message exchange.
pub struct DeliveryStateTracker {
    store: Arc<dyn DeliveryStore>,
    config: Arc<dyn ConfigSource>,
    sink: Arc<dyn StatusSink>,
}

impl DeliveryStateTracker {
    /// Create a tracker over `store`.
    #[must_use]
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        config: Arc<dyn ConfigSource>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            store,
            config,
            sink,
        }
    }

    fn snapshot(&self) -> Result<CoreConfig, DeliveryError> {
        let config = self.config.snapshot();
        config.validate()?;
        Ok(config)
    }

    async fn load(
        &self,
        message_id: &MessageId,
        config: &CoreConfig,
    ) -> Result<Option<DeliveryState>, DeliveryError> {
        Ok(bounded(
            config.io_timeout,
            "load_delivery",
            self.store.load_delivery(message_id),
        )
        .await?)
    }

    /// Write `next` over `current` if the row is unchanged.
    ///
    /// Returns the stored value on success.
    async fn replace(
        &self,
        current: &DeliveryState,
        mut next: DeliveryState,
        config: &CoreConfig,
    ) -> Result<Option<DeliveryState>, DeliveryError> {
        let applied = bounded(
            config.io_timeout,
            "update_delivery",
            self.store.update_delivery(current.version, next.clone()),
        )
        .await?;
        if !applied {
            debug!(message_id = %current.message_id, version = current.version, "lost update race");
            return Ok(None);
        }
        next.version = current.version + 1;
        Ok(Some(next))
    }

    /// Record a dispatch attempt using the current time.
    ///
    /// # Errors
    ///
    /// See [`DeliveryStateTracker::record_dispatch_at`].
    pub async fn record_dispatch(
        &self,
        message_id: &MessageId,
        exchange_pattern: ExchangePattern,
        role: Role,
        policy: Option<RetryPolicy>,
    ) -> Result<DeliveryState, DeliveryError> {
        self.record_dispatch_at(message_id, exchange_pattern, role, policy, Utc::now())
            .await
    }

    /// Record a dispatch attempt at `now`.
    ///
    /// The first dispatch creates the state with `policy`, or with the
    /// configured default when `policy` is `None`. Later dispatches keep the
    /// policy the state was created with.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::AttemptsExceeded`] without changing the state
    /// when the attempt budget is spent, [`DeliveryError::AlreadyTerminal`]
    /// for acknowledged or abandoned messages and
    /// [`DeliveryError::AlreadyDispatched`] while an attempt is in flight.
    pub async fn record_dispatch_at(
        &self,
        message_id: &MessageId,
        exchange_pattern: ExchangePattern,
        role: Role,
        policy: Option<RetryPolicy>,
        now: DateTime<Utc>,
    ) -> Result<DeliveryState, DeliveryError> {
        let config = self.snapshot()?;
        for _ in 0..MAX_UPDATE_ROUNDS {
            let Some(current) = self.load(message_id, &config).await? else {
                let policy = policy.unwrap_or(config.retry);
                policy.validate()?;
                let state = DeliveryState::first_dispatch(
                    message_id.clone(),
                    exchange_pattern,
                    role,
                    policy,
                    now,
                );
                let inserted = bounded(
                    config.io_timeout,
                    "insert_delivery",
                    self.store.insert_delivery(state.clone()),
                )
                .await?;
                if inserted {
                    debug!(%message_id, %exchange_pattern, %role, "first dispatch recorded");
                    return Ok(state);
                }
                continue;
            };

            let next = current.begin_attempt()?;
            if let Some(stored) = self.replace(&current, next, &config).await? {
                debug!(%message_id, attempt = stored.attempt_count, "dispatch recorded");
                return Ok(stored);
            }
        }
        Err(DeliveryError::Contention {
            message_id: message_id.clone(),
            rounds: MAX_UPDATE_ROUNDS,
        })
    }

    /// Record the outcome of the in-flight attempt using the current time.
    ///
    /// # Errors
    ///
    /// See [`DeliveryStateTracker::record_outcome_at`].
    pub async fn record_outcome(
        &self,
        message_id: &MessageId,
        outcome: Outcome,
    ) -> Result<Recorded, DeliveryError> {
        self.record_outcome_at(message_id, outcome, Utc::now()).await
    }

    /// Record the outcome of the in-flight attempt at `now`.
    ///
    /// An outcome for a state that is not `DISPATCHED` changes nothing. When
    /// the outcome abandons the delivery the status sink is notified once.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::NotFound`] for unknown messages and
    /// [`DeliveryError::Contention`] when the row kept changing.
    pub async fn record_outcome_at(
        &self,
        message_id: &MessageId,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<Recorded, DeliveryError> {
        let config = self.snapshot()?;
        for _ in 0..MAX_UPDATE_ROUNDS {
            let current = self
                .load(message_id, &config)
                .await?
                .ok_or_else(|| DeliveryError::NotFound {
                    message_id: message_id.clone(),
                })?;
            let next = match current.apply_outcome(outcome, now) {
                OutcomeTransition::Ignored => {
                    debug!(%message_id, %outcome, status = %current.status, "outcome ignored");
                    return Ok(Recorded::Ignored(current));
                }
                OutcomeTransition::Next(next) => next,
            };
            let Some(stored) = self.replace(&current, next, &config).await? else {
                continue;
            };
            match stored.status {
                DeliveryStatus::Abandoned => self.report_abandoned(&stored).await,
                DeliveryStatus::FailedRetryable => info!(
                    %message_id,
                    %outcome,
                    attempts = stored.attempt_count,
                    next_attempt_at = ?stored.next_attempt_at,
                    "retry scheduled"
                ),
                _ => debug!(%message_id, status = %stored.status, "outcome recorded"),
            }
            return Ok(Recorded::Applied(stored));
        }
        Err(DeliveryError::Contention {
            message_id: message_id.clone(),
            rounds: MAX_UPDATE_ROUNDS,
        })
    }

    /// Register a message waiting to be pulled, using the current time.
    ///
    /// # Errors
    ///
    /// See [`DeliveryStateTracker::register_waiting_at`].
    pub async fn register_waiting(
        &self,
        message_id: &MessageId,
        exchange_pattern: ExchangePattern,
        role: Role,
        policy: Option<RetryPolicy>,
    ) -> Result<DeliveryState, DeliveryError> {
        self.register_waiting_at(message_id, exchange_pattern, role, policy, Utc::now())
            .await
    }

    /// Register a message waiting to be pulled at `now`.
    ///
    /// Registering a message that already has a state returns that state
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Config`] for an invalid policy and
    /// [`DeliveryError::Store`] when the store refuses.
    pub async fn register_waiting_at(
        &self,
        message_id: &MessageId,
        exchange_pattern: ExchangePattern,
        role: Role,
        policy: Option<RetryPolicy>,
        now: DateTime<Utc>,
    ) -> Result<DeliveryState, DeliveryError> {
        let config = self.snapshot()?;
        let policy = policy.unwrap_or(config.retry);
        policy.validate()?;
        let state = DeliveryState::waiting(message_id.clone(), exchange_pattern, role, policy, now);
        let inserted = bounded(
            config.io_timeout,
            "insert_delivery",
            self.store.insert_delivery(state.clone()),
        )
        .await?;
        if inserted {
            debug!(%message_id, "waiting delivery registered");
            return Ok(state);
        }
        self.load(message_id, &config)
            .await?
            .ok_or_else(|| DeliveryError::NotFound {
                message_id: message_id.clone(),
            })
    }

    /// Abandon waiting deliveries whose budget elapsed before `now`.
    ///
    /// At most `claim_batch_limit` expired deliveries are handled per call,
    /// earliest deadline first.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Store`] when the scan fails. Rows that change
    /// concurrently are skipped.
    pub async fn expire_waiting_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, DeliveryError> {
        let config = self.snapshot()?;
        let waiting = bounded(
            config.io_timeout,
            "find_expired_waiting",
            self.store.find_expired_waiting(now, config.claim_batch_limit),
        )
        .await?;

        let mut expired = Vec::new();
        for current in waiting {
            let Some(next) = current.expired_waiting(now) else {
                continue;
            };
            match self.replace(&current, next, &config).await {
                Ok(Some(stored)) => {
                    self.report_abandoned(&stored).await;
                    expired.push(stored.message_id);
                }
                Ok(None) => {}
                Err(e) => warn!(message_id = %current.message_id, error = %e, "could not expire waiting delivery"),
            }
        }
        Ok(expired)
    }

    /// Put an abandoned delivery back in the retry queue, using the current
    /// time.
    ///
    /// # Errors
    ///
    /// See [`DeliveryStateTracker::restore_at`].
    pub async fn restore(&self, message_id: &MessageId) -> Result<DeliveryState, DeliveryError> {
        self.restore_at(message_id, Utc::now()).await
    }

    /// Put an abandoned delivery back in the retry queue at `now`.
    ///
    /// The attempt count restarts at zero and the delivery is due at once.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::NotFound`] for unknown messages and
    /// [`DeliveryError::NotAbandoned`] unless the delivery is abandoned.
    pub async fn restore_at(
        &self,
        message_id: &MessageId,
        now: DateTime<Utc>,
    ) -> Result<DeliveryState, DeliveryError> {
        let config = self.snapshot()?;
        for _ in 0..MAX_UPDATE_ROUNDS {
            let current = self
                .load(message_id, &config)
                .await?
                .ok_or_else(|| DeliveryError::NotFound {
                    message_id: message_id.clone(),
                })?;
            let next = current.restored(now)?;
            if let Some(stored) = self.replace(&current, next, &config).await? {
                info!(%message_id, "abandoned delivery restored");
                return Ok(stored);
            }
        }
        Err(DeliveryError::Contention {
            message_id: message_id.clone(),
            rounds: MAX_UPDATE_ROUNDS,
        })
    }

    /// Current state of one delivery.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Store`] when the store refuses.
    pub async fn get(&self, message_id: &MessageId) -> Result<Option<DeliveryState>, DeliveryError> {
        let config = self.snapshot()?;
        self.load(message_id, &config).await
    }

    /// Deliveries matching `filter`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Store`] when the store refuses.
    pub async fn find(
        &self,
        filter: &DeliveryFilter,
        limit: usize,
    ) -> Result<Vec<DeliveryState>, DeliveryError> {
        let config = self.snapshot()?;
        Ok(bounded(
            config.io_timeout,
            "find_deliveries",
            self.store.find_deliveries(filter, limit),
        )
        .await?)
    }

    /// Claim due retries at `now`, at most `claim_batch_limit` of them.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Store`] when the store refuses.
    pub async fn claim_due_at(&self, now: DateTime<Utc>) -> Result<Vec<DeliveryState>, DeliveryError> {
        let config = self.snapshot()?;
        Ok(bounded(
            config.io_timeout,
            "claim_due",
            self.store.claim_due(now, config.claim_batch_limit),
        )
        .await?)
    }

    /// Undo the claim held on `state`.
    ///
    /// Returns `false` when the claim was already released or superseded.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Store`] when the store refuses.
    pub async fn release_claim(&self, state: &DeliveryState) -> Result<bool, DeliveryError> {
        let Some(claimed_at) = state.claimed_at else {
            return Ok(false);
        };
        let config = self.snapshot()?;
        Ok(bounded(
            config.io_timeout,
            "release_claim",
            self.store.release_claim(&state.message_id, claimed_at),
        )
        .await?)
    }

    /// Undo every claim older than `claim_grace_period` at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Store`] when the store refuses.
    pub async fn release_stale_claims_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, DeliveryError> {
        let config = self.snapshot()?;
        let claimed_before = now
            .checked_sub_signed(config.claim_grace_delta()?)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let released = bounded(
            config.io_timeout,
            "release_stale_claims",
            self.store.release_stale_claims(claimed_before),
        )
        .await?;
        for message_id in &released {
            warn!(%message_id, "stale retry claim released");
        }
        Ok(released)
    }

    async fn report_abandoned(&self, state: &DeliveryState) {
        warn!(
            message_id = %state.message_id,
            attempts = state.attempt_count,
            last_outcome = ?state.last_outcome,
            "delivery abandoned"
        );
        metrics::inc_deliveries_abandoned();
        self.sink
            .notify(StatusEvent::DeliveryAbandoned {
                message_id: state.message_id.clone(),
                attempts: state.attempt_count,
                last_outcome: state.last_outcome,
            })
            .await;
    }
}

impl std::fmt::Debug for DeliveryStateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryStateTracker").finish_non_exhaustive()
    }
}
