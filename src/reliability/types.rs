//! Delivery state records and their pure transitions.
//!
//! The transition helpers on [`DeliveryState`] never touch a store. The
//! tracker computes the next row with them and persists it with a conditional
//! update on the row version it started from.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::{DeliveryError, RetryPolicy};
use crate::message::{MessageId, Role};

/// Who initiates the transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum ExchangePattern {
    /// The sender pushes the message.
    #[display("push")]
    Push,
    /// The receiver pulls the message.
    #[display("pull")]
    Pull,
}

/// Lifecycle status of a [`DeliveryState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Registered and waiting to be pulled or dispatched.
    #[display("WAITING")]
    Waiting,
    /// An attempt is in flight; the outcome is not known yet.
    #[display("DISPATCHED")]
    Dispatched,
    /// The peer acknowledged the message.
    #[display("ACKNOWLEDGED")]
    Acknowledged,
    /// The last attempt failed and another one is due at `next_attempt_at`.
    #[display("FAILED_RETRYABLE")]
    FailedRetryable,
    /// A scheduler claimed the retry and handed it to the dispatch boundary.
    #[display("RETRY_SCHEDULED")]
    RetryScheduled,
    /// No further attempt will be made.
    #[display("ABANDONED")]
    Abandoned,
}

impl DeliveryStatus {
    /// Whether no automatic transition can leave this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool { matches!(self, Self::Acknowledged | Self::Abandoned) }
}

/// Result of one exchange attempt reported by the dispatch boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum Outcome {
    /// The peer returned a valid receipt.
    #[display("ACKNOWLEDGED")]
    Acknowledged,
    /// The transport failed before a response arrived.
    #[display("TRANSPORT_ERROR")]
    TransportError,
    /// The peer answered with a protocol-level error.
    #[display("PROTOCOL_ERROR")]
    ProtocolError,
    /// No response arrived in time.
    #[display("TIMEOUT")]
    Timeout,
}

impl Outcome {
    /// Whether the outcome reports a failed attempt.
    #[must_use]
    pub const fn is_failure(self) -> bool { !matches!(self, Self::Acknowledged) }
}

/// Retry and acknowledgement lifecycle of one message exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryState {
    /// Message being delivered.
    pub message_id: MessageId,
    /// Push or pull.
    pub exchange_pattern: ExchangePattern,
    /// Local side of the exchange.
    pub role: Role,
    /// Current lifecycle status.
    pub status: DeliveryStatus,
    /// Dispatches made so far.
    pub attempt_count: u32,
    /// Retry parameters captured when the state was created.
    pub policy: RetryPolicy,
    /// Anchor for retry-time computation.
    pub received_at: DateTime<Utc>,
    /// Next eligible retry, if any.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Claim flag set by the retry scheduler.
    pub scheduled: bool,
    /// When the current claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Outcome of the most recent attempt.
    pub last_outcome: Option<Outcome>,
    /// Row version used for conditional updates.
    pub version: u64,
}

/// Result of applying an outcome to a state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutcomeTransition {
    /// The state was not awaiting an outcome; nothing changes.
    Ignored,
    /// The state moves to the contained value.
    Next(DeliveryState),
}

impl DeliveryState {
    fn fresh(
        message_id: MessageId,
        exchange_pattern: ExchangePattern,
        role: Role,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id,
            exchange_pattern,
            role,
            status: DeliveryStatus::Waiting,
            attempt_count: 0,
            policy,
            received_at: now,
            next_attempt_at: Some(now),
            scheduled: false,
            claimed_at: None,
            last_outcome: None,
            version: 0,
        }
    }

    /// State of a message registered before its first attempt.
    #[must_use]
    pub fn waiting(
        message_id: MessageId,
        exchange_pattern: ExchangePattern,
        role: Role,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self::fresh(message_id, exchange_pattern, role, policy, now)
    }

    /// State of a message whose first attempt is being dispatched.
    #[must_use]
    pub fn first_dispatch(
        message_id: MessageId,
        exchange_pattern: ExchangePattern,
        role: Role,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let mut state = Self::fresh(message_id, exchange_pattern, role, policy, now);
        state.status = DeliveryStatus::Dispatched;
        state.attempt_count = 1;
        state.next_attempt_at = None;
        state
    }

    /// Compute the state after one more dispatch.
    ///
    /// The attempt budget is checked before anything else except
    /// acknowledgement, so a dispatch at `attempt_count == max_attempts`
    /// always reports exhaustion.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::AlreadyTerminal`] for acknowledged deliveries
    /// and for abandoned ones with budget left,
    /// [`DeliveryError::AttemptsExceeded`] when the attempt budget is spent,
    /// and [`DeliveryError::AlreadyDispatched`] while an attempt is in flight.
    pub fn begin_attempt(&self) -> Result<Self, DeliveryError> {
        if self.status == DeliveryStatus::Acknowledged {
            return Err(self.already_terminal());
        }
        if self.attempt_count >= self.policy.max_attempts {
            return Err(DeliveryError::AttemptsExceeded {
                message_id: self.message_id.clone(),
                attempts: self.attempt_count,
                max_attempts: self.policy.max_attempts,
            });
        }
        if self.status == DeliveryStatus::Abandoned {
            return Err(self.already_terminal());
        }
        if self.status == DeliveryStatus::Dispatched {
            return Err(DeliveryError::AlreadyDispatched {
                message_id: self.message_id.clone(),
            });
        }
        let mut next = self.clone();
        next.status = DeliveryStatus::Dispatched;
        next.attempt_count += 1;
        next.next_attempt_at = None;
        next.scheduled = false;
        next.claimed_at = None;
        Ok(next)
    }

    fn already_terminal(&self) -> DeliveryError {
        DeliveryError::AlreadyTerminal {
            message_id: self.message_id.clone(),
            status: self.status,
        }
    }

    /// Compute the state after `outcome` was reported at `now`.
    #[must_use]
    pub fn apply_outcome(&self, outcome: Outcome, now: DateTime<Utc>) -> OutcomeTransition {
        if self.status != DeliveryStatus::Dispatched {
            return OutcomeTransition::Ignored;
        }
        let mut next = self.clone();
        next.last_outcome = Some(outcome);
        next.next_attempt_at = None;
        if !outcome.is_failure() {
            next.status = DeliveryStatus::Acknowledged;
            return OutcomeTransition::Next(next);
        }

        let retry_at = (self.attempt_count < self.policy.max_attempts)
            .then(|| {
                self.policy
                    .next_attempt(self.received_at, self.attempt_count, now)
            })
            .flatten();
        match retry_at {
            Some(at) => {
                next.status = DeliveryStatus::FailedRetryable;
                next.next_attempt_at = Some(at);
            }
            None => next.status = DeliveryStatus::Abandoned,
        }
        OutcomeTransition::Next(next)
    }

    /// Compute the state of an abandoned delivery put back in the retry queue.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::NotAbandoned`] unless the delivery is
    /// [`DeliveryStatus::Abandoned`].
    pub fn restored(&self, now: DateTime<Utc>) -> Result<Self, DeliveryError> {
        if self.status != DeliveryStatus::Abandoned {
            return Err(DeliveryError::NotAbandoned {
                message_id: self.message_id.clone(),
                status: self.status,
            });
        }
        let mut next = self.clone();
        next.status = DeliveryStatus::FailedRetryable;
        next.attempt_count = 0;
        next.received_at = now;
        next.next_attempt_at = Some(now);
        next.scheduled = false;
        next.claimed_at = None;
        Ok(next)
    }

    /// Compute the abandoned state of a waiting delivery nobody collected.
    #[must_use]
    pub fn expired_waiting(&self, now: DateTime<Utc>) -> Option<Self> {
        if self.status != DeliveryStatus::Waiting || self.policy.deadline(self.received_at) >= now {
            return None;
        }
        let mut next = self.clone();
        next.status = DeliveryStatus::Abandoned;
        next.next_attempt_at = None;
        Some(next)
    }

    /// Whether a scheduler may claim this state at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::FailedRetryable
            && !self.scheduled
            && self.next_attempt_at.is_some_and(|at| at <= now)
    }
}

/// Criteria for listing deliveries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryFilter {
    /// Only deliveries in this status.
    pub status: Option<DeliveryStatus>,
    /// Only deliveries with this exchange pattern.
    pub exchange_pattern: Option<ExchangePattern>,
    /// Only deliveries for this local role.
    pub role: Option<Role>,
    /// Only deliveries anchored at or after this instant.
    pub received_from: Option<DateTime<Utc>>,
    /// Only deliveries anchored at or before this instant.
    pub received_to: Option<DateTime<Utc>>,
}

impl DeliveryFilter {
    /// Filter on a single status.
    #[must_use]
    pub fn with_status(status: DeliveryStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Whether `state` satisfies every criterion.
    #[must_use]
    pub fn matches(&self, state: &DeliveryState) -> bool {
        self.status.is_none_or(|s| s == state.status)
            && self.exchange_pattern.is_none_or(|p| p == state.exchange_pattern)
            && self.role.is_none_or(|r| r == state.role)
            && self.received_from.is_none_or(|from| state.received_at >= from)
            && self.received_to.is_none_or(|to| state.received_at <= to)
    }
}
