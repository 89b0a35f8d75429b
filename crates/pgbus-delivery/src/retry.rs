//! Exponential backoff with jitter.
//!
//! [`RetryPolicy`] schedules webhook retries. [`StoreRetry`] retries
//! transient store failures inside the pull and notify drivers before an
//! error reaches the caller.

use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use pgbus_core::CoreError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DeliveryError;

/// Retry policy for push delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts (including initial attempt).
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Maximum delay between attempts.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied to every delay.
    pub jitter_factor: f64,

    /// Upper bound on a `Retry-After` delay requested by an endpoint.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.25,
            max_retry_after: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Backoff for the attempt that just failed, before jitter.
    ///
    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        std::cmp::min(self.base_delay.saturating_mul(multiplier), self.max_delay)
    }
}

/// Retry decision context for a failed push attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt that just failed (1-based).
    pub attempt_number: u32,
    /// Error that caused the failure.
    pub error: DeliveryError,
    /// Timestamp of the failed attempt.
    pub failed_at: DateTime<Utc>,
    /// Retry policy to apply.
    pub policy: RetryPolicy,
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the delivery at the specified time.
    Retry {
        /// When the record becomes claimable again
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop retrying; the record fails.
    GiveUp {
        /// Reason recorded on the record
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed delivery.
    pub fn new(
        attempt_number: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempt_number, error, failed_at, policy }
    }

    /// Determines if and when to retry.
    ///
    /// Gives up once `max_attempts` attempts were made or the error is not
    /// retryable. Honors HTTP 429 `Retry-After`, capped at `max_retry_after`.
    pub fn decide_retry(&self) -> RetryDecision {
        if self.attempt_number >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!(
                    "maximum attempts ({}) exceeded: {}",
                    self.policy.max_attempts, self.error
                ),
            };
        }

        if !self.error.is_retryable() {
            return RetryDecision::GiveUp { reason: self.error.to_string() };
        }

        let delay = self.calculate_delay();
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + chrono_delay }
    }

    fn calculate_delay(&self) -> Duration {
        if let Some(retry_after_seconds) = self.error.retry_after_seconds() {
            return std::cmp::min(
                Duration::from_secs(retry_after_seconds),
                self.policy.max_retry_after,
            );
        }

        let capped_delay = self.policy.backoff(self.attempt_number);
        let jittered_delay = apply_jitter(capped_delay, self.policy.jitter_factor);

        std::cmp::min(jittered_delay, self.policy.max_delay)
    }
}

/// Randomizes `duration` by +/- `jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rand::rng().random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

/// Bounded retry of transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreRetry {
    /// Total tries including the first.
    pub attempts: u32,
    /// Delay after the first failure; doubles per retry.
    pub base_delay: Duration,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self { attempts: 3, base_delay: Duration::from_millis(50) }
    }
}

impl StoreRetry {
    /// Runs `operation`, retrying while it fails with a transient error.
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts run out, or the first
    /// non-transient error.
    pub async fn run<T, F, Fut>(&self, name: &'static str, mut operation: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    let delay = self.base_delay.saturating_mul(1_u32 << (attempt - 1).min(10));
                    debug!(
                        operation = name,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "transient store error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                result => return result,
            }
        }
    }
}
