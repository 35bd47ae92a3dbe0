//! Retry Policy
//!
//! Bounded retry with exponential backoff for calls to the provider.
//!
//! The policy is a plain value: callers hand it to [`call_with_policy`]
//! together with the operation to run. The operation is invoked at most
//! `max_attempts` times. Failures whose [`FailureKind`] is not in the
//! policy's retryable set end the call on the attempt they happen.
//!
//! Delays grow as `base * multiplier^k` for the k-th retry and are clamped
//! into `[min_delay, max_delay]`. With the defaults (1s base, x2, 2s..10s)
//! the waits are 2s, 4s, 8s, 10s, 10s, ...

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Classify, ConfigError, FailureKind, RetryError};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_MIN_DELAY_MS: u64 = 2_000;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// Retry configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first one)
    pub max_attempts: u32,

    /// Backoff base in milliseconds
    pub base_delay_ms: u64,

    /// Growth factor per retry
    pub multiplier: f64,

    /// Lower bound for any delay, in milliseconds
    pub min_delay_ms: u64,

    /// Upper bound for any delay, in milliseconds
    pub max_delay_ms: u64,

    /// Random extra delay as a fraction of the computed delay (0.0 = none)
    pub jitter_factor: f64,

    /// Failure kinds worth another attempt
    pub retryable: Vec<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            min_delay_ms: DEFAULT_MIN_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: 0.0,
            retryable: FailureKind::TRANSIENT.to_vec(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the attempt cap
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the backoff base
    #[must_use]
    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self
    }

    /// Set the growth factor
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the delay bounds
    #[must_use]
    pub fn with_delay_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay_ms = min.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    /// Set the jitter factor (clamped to 0.0..=1.0)
    #[must_use]
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Replace the retryable kinds
    #[must_use]
    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    /// Whether a failure of this kind may be retried
    #[must_use]
    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Delay before the `retry`-th retry (1-based), without jitter
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let bounded = raw
            .max(self.min_delay_ms as f64)
            .min(self.max_delay_ms as f64);
        Duration::from_millis(bounded as u64)
    }

    /// Delay before the `retry`-th retry with jitter applied
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let spread = delay.as_millis() as f64 * self.jitter_factor;
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        let jittered = (delay.as_millis() as f64 + extra).min(self.max_delay_ms as f64);
        Duration::from_millis(jittered as u64)
    }

    /// Reject policies that cannot work
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "retry.max_attempts",
            });
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.min_delay_ms exceeds retry.max_delay_ms".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Run `operation` under `policy`
///
/// The closure receives the 1-based attempt number. Between attempts the
/// task sleeps on the tokio clock.
pub async fn call_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt = attempt, "Upstream call succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let kind = error.failure_kind();

        if !policy.is_retryable(kind) {
            tracing::warn!(
                attempt = attempt,
                kind = %kind,
                error = %error,
                "Upstream call failed with non-retryable error"
            );
            return Err(RetryError::Fatal { attempt, error });
        }

        if attempt >= max_attempts {
            tracing::error!(
                attempts = attempt,
                kind = %kind,
                error = %error,
                "Upstream call failed, retry budget exhausted"
            );
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = policy.delay_for_retry(attempt);
        tracing::warn!(
            attempt = attempt,
            kind = %kind,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Upstream call failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
