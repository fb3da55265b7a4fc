//! Configuration snapshot consumed by the delivery core.
//!
//! [`CoreConfig`] bundles every tunable used by the fragmenter, the
//! reassembler and the periodic workers. Components never cache it: each
//! operation asks its [`ConfigSource`] for a fresh snapshot and validates it
//! before use, so a bad value fails the call that would have used it instead
//! of being coerced to a default.

use std::{num::NonZeroUsize, time::Duration};

use chrono::TimeDelta;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::reliability::RetryPolicy;

/// Errors raised when a configuration value cannot be used.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// `max_fragment_bytes` was zero.
    #[error("max_fragment_bytes must be positive")]
    NonPositiveFragmentSize,
    /// A duration that drives a timer or deadline was zero.
    #[error("{name} must be a positive duration")]
    ZeroDuration {
        /// Name of the offending field.
        name: &'static str,
    },
    /// A duration is too large to be added to a wall-clock timestamp.
    #[error("{name} is out of range")]
    DurationOutOfRange {
        /// Name of the offending field.
        name: &'static str,
    },
    /// A count that must be positive was zero.
    #[error("{name} must be at least 1")]
    ZeroCount {
        /// Name of the offending field.
        name: &'static str,
    },
    /// The rate limit cannot hand off a full claim batch before the claims
    /// go stale.
    #[error("draining a claim batch takes {drain:?}, not within claim_grace_period {grace:?}")]
    BatchOutlastsClaimGrace {
        /// Time the limiter needs for `claim_batch_limit` handoffs.
        drain: Duration,
        /// Configured `claim_grace_period`.
        grace: Duration,
    },
    /// The retry policy cannot produce a schedule.
    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(&'static str),
}

/// Back-off applied when releasing fragment storage fails.
///
/// The delay starts at `initial_delay` and doubles after each failure, capped
/// at `max_delay`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffConfig {
    /// Clamp delays to sane bounds and ensure `initial_delay <= max_delay`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use msh_reliability::config::BackoffConfig;
    ///
    /// let cfg = BackoffConfig {
    ///     initial_delay: Duration::from_millis(5),
    ///     max_delay: Duration::from_millis(1),
    /// };
    ///
    /// let normalized = cfg.normalized();
    /// assert_eq!(normalized.initial_delay, Duration::from_millis(1));
    /// assert_eq!(normalized.max_delay, Duration::from_millis(5));
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        self
    }

    /// Delay to wait after `delay`, doubled and capped.
    #[must_use]
    pub fn next_delay(&self, delay: Duration) -> Duration { (delay * 2).min(self.max_delay) }
}

/// Settings for the split-and-join and reliability subsystems.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Maximum number of payload bytes carried by one fragment.
    pub max_fragment_bytes: usize,
    /// Whether outbound payloads are deflate-compressed before splitting.
    pub compress_fragments: bool,
    /// Time budget of a split or join transfer before it expires.
    pub group_timeout: Duration,
    /// Period of the group expiration sweeper.
    pub sweep_interval: Duration,
    /// Period of the retry scheduler.
    pub retry_interval: Duration,
    /// Age after which an unanswered scheduler claim is released.
    pub claim_grace_period: Duration,
    /// Upper bound for any single store or stream operation.
    pub io_timeout: Duration,
    /// Number of fragments written between two cancellation checks.
    pub cancellation_check_every: u32,
    /// Maximum number of deliveries claimed per scheduler run.
    pub claim_batch_limit: usize,
    /// Optional cap on scheduler handoffs per second.
    pub dispatch_rate_per_second: Option<usize>,
    /// Retry behaviour when fragment cleanup fails.
    pub cleanup_backoff: BackoffConfig,
    /// Number of cleanup attempts before giving up on a group.
    pub cleanup_attempts: u32,
    /// Retry policy copied into deliveries when they are first recorded.
    pub retry: RetryPolicy,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_fragment_bytes: 10 * 1024 * 1024,
            compress_fragments: false,
            group_timeout: Duration::from_secs(2 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            retry_interval: Duration::from_secs(5),
            claim_grace_period: Duration::from_secs(5 * 60),
            io_timeout: Duration::from_secs(30),
            cancellation_check_every: 16,
            claim_batch_limit: 100,
            dispatch_rate_per_second: None,
            cleanup_backoff: BackoffConfig::default(),
            cleanup_attempts: 5,
            retry: RetryPolicy::default(),
        }
    }
}

impl CoreConfig {
    /// Set the fragment size cap.
    #[must_use]
    pub fn with_max_fragment_bytes(mut self, bytes: usize) -> Self {
        self.max_fragment_bytes = bytes;
        self
    }

    /// Enable or disable fragment compression.
    #[must_use]
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress_fragments = enabled;
        self
    }

    /// Set the split/join time budget.
    #[must_use]
    pub fn with_group_timeout(mut self, timeout: Duration) -> Self {
        self.group_timeout = timeout;
        self
    }

    /// Set the bound applied to store and stream operations.
    #[must_use]
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Set the scheduler claim grace period.
    #[must_use]
    pub fn with_claim_grace_period(mut self, grace: Duration) -> Self {
        self.claim_grace_period = grace;
        self
    }

    /// Set how often an in-flight split re-checks its group status.
    #[must_use]
    pub fn with_cancellation_check_every(mut self, fragments: u32) -> Self {
        self.cancellation_check_every = fragments;
        self
    }

    /// Set the retry policy for new deliveries.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Check every field the core depends on.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fragment_size()?;
        to_delta("group_timeout", self.group_timeout)?;
        to_delta("claim_grace_period", self.claim_grace_period)?;
        for (name, value) in [
            ("sweep_interval", self.sweep_interval),
            ("retry_interval", self.retry_interval),
            ("io_timeout", self.io_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { name });
            }
        }
        if self.cancellation_check_every == 0 {
            return Err(ConfigError::ZeroCount {
                name: "cancellation_check_every",
            });
        }
        if self.claim_batch_limit == 0 {
            return Err(ConfigError::ZeroCount {
                name: "claim_batch_limit",
            });
        }
        if self.dispatch_rate_per_second == Some(0) {
            return Err(ConfigError::ZeroCount {
                name: "dispatch_rate_per_second",
            });
        }
        if let Some(drain) = self.batch_drain_time()
            && drain >= self.claim_grace_period
        {
            return Err(ConfigError::BatchOutlastsClaimGrace {
                drain,
                grace: self.claim_grace_period,
            });
        }
        self.retry.validate()
    }

    /// Upper bound on the time the handoff rate limit needs for one full
    /// claim batch, or `None` when handoffs are not rate limited.
    #[must_use]
    pub fn batch_drain_time(&self) -> Option<Duration> {
        let rate = self.dispatch_rate_per_second.filter(|r| *r > 0)?;
        let seconds = u64::try_from(self.claim_batch_limit.div_ceil(rate)).unwrap_or(u64::MAX);
        Some(Duration::from_secs(seconds))
    }

    /// Fragment size cap as a non-zero value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NonPositiveFragmentSize`] when the cap is zero.
    pub fn fragment_size(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.max_fragment_bytes).ok_or(ConfigError::NonPositiveFragmentSize)
    }

    /// Group time budget as a wall-clock delta.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the budget is zero or too large.
    pub fn group_timeout_delta(&self) -> Result<TimeDelta, ConfigError> {
        to_delta("group_timeout", self.group_timeout)
    }

    /// Claim grace period as a wall-clock delta.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the grace period is zero or too large.
    pub fn claim_grace_delta(&self) -> Result<TimeDelta, ConfigError> {
        to_delta("claim_grace_period", self.claim_grace_period)
    }
}

fn to_delta(name: &'static str, value: Duration) -> Result<TimeDelta, ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ZeroDuration { name });
    }
    TimeDelta::from_std(value).map_err(|_| ConfigError::DurationOutOfRange { name })
}

/// Supplier of configuration snapshots.
///
/// Implementations are read once per operation and never mutated by the
/// core.
pub trait ConfigSource: Send + Sync {
    /// Return the configuration in effect right now.
    fn snapshot(&self) -> CoreConfig;
}

impl ConfigSource for CoreConfig {
    fn snapshot(&self) -> CoreConfig { self.clone() }
}

/// Configuration that can be replaced while workers are running.
///
/// Replacing the value only affects operations that start afterwards;
/// deliveries keep the retry policy they were created with.
#[derive(Debug)]
pub struct SharedConfig {
    current: watch::Sender<CoreConfig>,
}

impl SharedConfig {
    /// Wrap an initial configuration.
    #[must_use]
    pub fn new(initial: CoreConfig) -> Self {
        let (current, _) = watch::channel(initial);
        Self { current }
    }

    /// Replace the configuration after validating it.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] and keeps the previous value when `next` is
    /// invalid.
    pub fn replace(&self, next: CoreConfig) -> Result<(), ConfigError> {
        next.validate()?;
        self.current.send_replace(next);
        Ok(())
    }
}

impl ConfigSource for SharedConfig {
    fn snapshot(&self) -> CoreConfig { self.current.borrow().clone() }
}
