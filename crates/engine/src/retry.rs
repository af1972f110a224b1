//! Reusable retry policy for upstream HTTP calls.
//!
//! One policy drives both the token manager and the page-fetch client:
//! 429 and 5xx responses are retried with capped exponential backoff plus
//! jitter, honoring a `Retry-After` hint when the vendor sends one. Every
//! other failure is final.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;

/// Classification hooks the retry loop needs from an error type.
pub trait Retryable {
    /// Whether another attempt could plausibly succeed.
    fn is_retryable(&self) -> bool;

    /// Server-provided delay hint (`Retry-After`), if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Whether an HTTP status is worth retrying.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Build a policy from configuration.
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }

    /// Total attempt ceiling (first try included).
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the retry following `attempt` (1-based).
    ///
    /// A `Retry-After` hint overrides the exponential schedule but is still
    /// capped; jitter of up to 25% is added either way so synchronized
    /// callers spread out.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let base = retry_after.unwrap_or(exponential).min(self.max_delay);
        let jitter = base.mul_f64(rand::random::<f64>() * 0.25);
        base.saturating_add(jitter)
    }

    /// Run `op` until it succeeds, fails permanently, or exhausts attempts.
    ///
    /// The closure receives the 1-based attempt number and must return a
    /// future owning everything it needs (clone captured state into it).
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted, or the first
    /// non-retryable error immediately.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && err.is_retryable() => {
                    let delay = self.delay_for(attempt, err.retry_after());
                    tracing::debug!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "transient upstream failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
