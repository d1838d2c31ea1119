//! Deterministic backoff and attempt-limit policy.
//!
//! The delay before a re-queued job becomes claimable again depends only on
//! how many times it has failed. There is no jitter: the same failure count
//! always yields the same delay, which keeps the schedule testable.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Default maximum number of delivery attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Retry policy for failed deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after which a job becomes terminal `error`.
    pub max_attempts: u32,

    /// Unit delay multiplied by the strategy's growth factor.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Growth curve.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(6 * 60 * 60),
            backoff_strategy: BackoffStrategy::Quadratic,
        }
    }
}

/// Growth curve for retry delays, as a function of the failure count `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base`
    Fixed,
    /// `base * n`
    Linear,
    /// `base * ceil(n² / 4)`, i.e. `(n/2)²` units rounded up
    Quadratic,
    /// `base * 2^(n-1)`
    Exponential,
}

impl BackoffStrategy {
    /// Multiplier applied to the base delay after `failures` failures.
    pub fn factor(&self, failures: u32) -> u64 {
        let n = u64::from(failures.max(1));
        match self {
            Self::Fixed => 1,
            Self::Linear => n,
            Self::Quadratic => n.saturating_mul(n).saturating_add(3) / 4,
            Self::Exponential => 1u64 << (n - 1).min(30),
        }
    }
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Linear => write!(f, "linear"),
            Self::Quadratic => write!(f, "quadratic"),
            Self::Exponential => write!(f, "exponential"),
        }
    }
}

impl FromStr for BackoffStrategy {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "quadratic" => Ok(Self::Quadratic),
            "exponential" => Ok(Self::Exponential),
            other => Err(DeliveryError::configuration(format!("unknown backoff strategy: {other}"))),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` failed attempts.
    ///
    /// Non-decreasing in `failures` and never above `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = self.backoff_strategy.factor(failures);

        u32::try_from(factor)
            .ok()
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// When a job that has now failed `failures` times becomes claimable.
    pub fn next_attempt_at(&self, now: DateTime<Utc>, failures: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(failures))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Returns true once `attempt_count` failures exhaust the policy.
    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }

    /// Checks that the policy can make progress.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for a zero attempt limit or
    /// a cap below the base delay.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be at least 1"));
        }
        if self.max_delay < self.base_delay {
            return Err(DeliveryError::configuration(
                "max backoff delay must not be smaller than the base delay",
            ));
        }
        Ok(())
    }
}
