//! Pure retry-timing strategies.
//!
//! A [`RetryStrategy`] maps the anchor time of a delivery, the attempts made
//! so far and the retry budget onto the next instant at which another attempt
//! may be dispatched. Strategies never consult a clock; callers pass `now`
//! explicitly.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Extra time granted past the budget so the final constant-interval slot is
/// still dispatched.
pub const CONSTANT_INTERVAL_GRACE: Duration = Duration::from_secs(5);

/// Upper bound applied to `max_attempts` by the constant-interval algorithm.
const MAX_CONSTANT_SLOTS: u32 = 60_000;

const MILLIS_PER_MINUTE: i64 = 60_000;

/// Attempt-timing algorithm applied to failed deliveries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Never retry; at-most-once delivery.
    SendOnce,
    /// Split the timeout budget into `max_attempts` equal slots.
    #[default]
    ConstantInterval,
    /// Double the delay between attempts, starting at `initial_delay` and
    /// capping each step at `max_delay`.
    ExponentialBackoff {
        /// Delay between the anchor time and the first retry boundary.
        initial_delay: Duration,
        /// Largest gap allowed between two consecutive boundaries.
        max_delay: Duration,
    },
}

impl RetryStrategy {
    /// Compute the next eligible retry instant.
    ///
    /// Returns `None` when no further retry should happen: the strategy is
    /// [`RetryStrategy::SendOnce`], the budget is exhausted, or the inputs
    /// cannot describe a valid schedule.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::{TimeZone, Utc};
    /// use msh_reliability::reliability::RetryStrategy;
    ///
    /// let received = Utc
    ///     .with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
    ///     .single()
    ///     .expect("valid timestamp");
    /// let next = RetryStrategy::ConstantInterval.next_attempt(received, 1, 3, 30, received);
    /// assert_eq!(next, Some(received + chrono::TimeDelta::minutes(10)));
    /// assert_eq!(RetryStrategy::SendOnce.next_attempt(received, 1, 3, 30, received), None);
    /// ```
    #[must_use]
    pub fn next_attempt(
        &self,
        received_at: DateTime<Utc>,
        attempt_count: u32,
        max_attempts: u32,
        timeout_budget_minutes: u32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match *self {
            Self::SendOnce => None,
            Self::ConstantInterval => {
                constant_interval(received_at, max_attempts, timeout_budget_minutes, now)
            }
            Self::ExponentialBackoff {
                initial_delay,
                max_delay,
            } => exponential_backoff(
                received_at,
                attempt_count,
                timeout_budget_minutes,
                (initial_delay, max_delay),
                now,
            ),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Self::ExponentialBackoff {
            initial_delay,
            max_delay,
        } = *self
        {
            if initial_delay.is_zero() {
                return Err(ConfigError::InvalidRetryPolicy(
                    "exponential back-off initial delay must be positive",
                ));
            }
            if initial_delay > max_delay {
                return Err(ConfigError::InvalidRetryPolicy(
                    "exponential back-off initial delay exceeds max delay",
                ));
            }
            if millis(max_delay).is_none() {
                return Err(ConfigError::DurationOutOfRange { name: "max_delay" });
            }
        }
        Ok(())
    }
}

/// Retry parameters copied into each delivery when it is first recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Timing algorithm.
    pub strategy: RetryStrategy,
    /// Maximum number of dispatches, first attempt included.
    pub max_attempts: u32,
    /// Total time budget for all attempts, in minutes.
    pub timeout_budget_minutes: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::ConstantInterval,
            max_attempts: 3,
            timeout_budget_minutes: 30,
        }
    }
}

impl RetryPolicy {
    /// Policy that dispatches exactly once.
    #[must_use]
    pub const fn send_once() -> Self {
        Self {
            strategy: RetryStrategy::SendOnce,
            max_attempts: 1,
            timeout_budget_minutes: 0,
        }
    }

    /// Check the parameters before they are used.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRetryPolicy`] when `max_attempts` is zero,
    /// when a timed strategy has no budget, or when the back-off delays are
    /// inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidRetryPolicy(
                "max_attempts must be at least 1",
            ));
        }
        if self.strategy != RetryStrategy::SendOnce && self.timeout_budget_minutes == 0 {
            return Err(ConfigError::InvalidRetryPolicy(
                "timeout_budget_minutes must be positive for retrying strategies",
            ));
        }
        self.strategy.validate()
    }

    /// Next eligible retry instant for a delivery anchored at `received_at`.
    #[must_use]
    pub fn next_attempt(
        &self,
        received_at: DateTime<Utc>,
        attempt_count: u32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.strategy.next_attempt(
            received_at,
            attempt_count,
            self.max_attempts,
            self.timeout_budget_minutes,
            now,
        )
    }

    /// Instant after which the budget is spent.
    #[must_use]
    pub fn deadline(&self, received_at: DateTime<Utc>) -> DateTime<Utc> {
        let budget = chrono::TimeDelta::minutes(i64::from(self.timeout_budget_minutes));
        received_at
            .checked_add_signed(budget)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

fn millis(duration: Duration) -> Option<i64> { i64::try_from(duration.as_millis()).ok() }

fn from_millis(value: i64) -> Option<DateTime<Utc>> { DateTime::from_timestamp_millis(value) }

fn constant_interval(
    received_at: DateTime<Utc>,
    max_attempts: u32,
    timeout_budget_minutes: u32,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if max_attempts == 0 || timeout_budget_minutes == 0 {
        return None;
    }
    let slots = i64::from(max_attempts.min(MAX_CONSTANT_SLOTS));
    let budget = i64::from(timeout_budget_minutes) * MILLIS_PER_MINUTE;
    let step = budget / slots;
    if step == 0 {
        return None;
    }

    let start = received_at.timestamp_millis();
    let stop = start
        .checked_add(budget)?
        .checked_add(millis(CONSTANT_INTERVAL_GRACE)?)?;
    let now = now.timestamp_millis();

    // First slot boundary strictly after `now`.
    let slot = if now < start {
        1
    } else {
        (now - start) / step + 1
    };
    let candidate = start.checked_add(slot.checked_mul(step)?)?;
    if candidate < stop {
        from_millis(candidate)
    } else {
        None
    }
}

fn exponential_backoff(
    received_at: DateTime<Utc>,
    attempt_count: u32,
    timeout_budget_minutes: u32,
    (initial_delay, max_delay): (Duration, Duration),
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let initial = millis(initial_delay)?;
    let cap = millis(max_delay)?.max(initial);
    if timeout_budget_minutes == 0 || initial == 0 {
        return None;
    }

    let start = received_at.timestamp_millis();
    let deadline = start.checked_add(i64::from(timeout_budget_minutes) * MILLIS_PER_MINUTE)?;
    let now = now.timestamp_millis();
    let wanted = attempt_count.max(1);

    let mut at = start;
    let mut index = 0_u32;
    let mut delay = initial;
    while delay < cap {
        at = at.checked_add(delay)?;
        index = index.saturating_add(1);
        if at >= deadline {
            return None;
        }
        if at > now && index >= wanted {
            return from_millis(at);
        }
        delay = delay.saturating_mul(2).min(cap);
    }

    // Delays have reached the cap: boundaries are now `at + k * cap`.
    let by_time = if now >= at { (now - at) / cap + 1 } else { 1 };
    let by_index = i64::from(wanted.saturating_sub(index)).max(1);
    let candidate = at.checked_add(by_time.max(by_index).checked_mul(cap)?)?;
    if candidate < deadline {
        from_millis(candidate)
    } else {
        None
    }
}
