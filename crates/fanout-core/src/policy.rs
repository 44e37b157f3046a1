//! Retry policy applied by the retry/fallback controller.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long to wait before retrying the same candidate after a transient
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed {
        #[serde(rename = "delayMs")]
        delay_ms: u64,
    },
    /// Delay grows by `multiplier` after every attempt, clamped to `max_ms`.
    Exponential {
        #[serde(rename = "initialMs")]
        initial_ms: u64,
        multiplier: f64,
        #[serde(rename = "maxMs")]
        max_ms: u64,
    },
}

impl BackoffStrategy {
    /// Delay before the retry that follows attempt number `attempt`
    /// (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = attempt.saturating_sub(1).min(32) as i32;
                let delay = initial_ms as f64 * multiplier.max(1.0).powi(exponent);
                Duration::from_millis((delay as u64).min(max_ms))
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_ms: 500,
            multiplier: 2.0,
            max_ms: 8_000,
        }
    }
}

/// Retry policy for one task.
///
/// `same_candidate_delay_threshold_ms` is the cutoff between waiting out a
/// rate limit on the current candidate and switching to the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Maximum adapter invocations against a single candidate.
    pub max_attempts_per_candidate: u32,

    /// Rate-limit delays at or below this are waited out on the same
    /// candidate; longer delays switch candidates immediately.
    pub same_candidate_delay_threshold_ms: u64,

    /// Delay assumed when a rate limit carries no retry hint.
    pub default_rate_limit_delay_ms: u64,

    /// Backoff between transient-failure retries.
    pub backoff: BackoffStrategy,

    /// Optional per-attempt timeout.
    pub call_timeout_ms: Option<u64>,
}

impl RetryPolicy {
    pub fn same_candidate_delay_threshold(&self) -> Duration {
        Duration::from_millis(self.same_candidate_delay_threshold_ms)
    }

    pub fn default_rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.default_rate_limit_delay_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Backoff before retrying after transient failure number `attempt`.
    pub fn transient_backoff(&self, attempt: u32) -> Duration {
        self.backoff.delay_for(attempt)
    }

    /// Apply a caller-supplied override on top of this policy.
    pub fn merged(&self, overrides: &RetryPolicyOverride) -> Self {
        Self {
            max_attempts_per_candidate: overrides
                .max_attempts_per_candidate
                .unwrap_or(self.max_attempts_per_candidate),
            same_candidate_delay_threshold_ms: overrides
                .same_candidate_delay_threshold_ms
                .unwrap_or(self.same_candidate_delay_threshold_ms),
            default_rate_limit_delay_ms: overrides
                .default_rate_limit_delay_ms
                .unwrap_or(self.default_rate_limit_delay_ms),
            backoff: overrides.backoff.unwrap_or(self.backoff),
            call_timeout_ms: overrides.call_timeout_ms.or(self.call_timeout_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_candidate: 3,
            same_candidate_delay_threshold_ms: 10_000,
            default_rate_limit_delay_ms: 5_000,
            backoff: BackoffStrategy::default(),
            call_timeout_ms: None,
        }
    }
}

/// Partial retry policy supplied with a run request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicyOverride {
    #[serde(default)]
    pub max_attempts_per_candidate: Option<u32>,
    #[serde(default)]
    pub same_candidate_delay_threshold_ms: Option<u64>,
    #[serde(default)]
    pub default_rate_limit_delay_ms: Option<u64>,
    #[serde(default)]
    pub backoff: Option<BackoffStrategy>,
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}
