//! Retry policy for transient task failures
//!
//! Retries are driven by the scheduler re-entering the run loop, never by
//! recursion inside a failure handler. Only transport-class errors are
//! retried; everything else fails the task on the spot.

use crate::error::FetcherError;
use std::time::Duration;

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this error.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Exponential backoff with a cap: `base * 2^retries_used`, clamped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Transient failures allowed per task.
    pub max_retries: u32,
    /// Base delay for backoff.
    pub base_delay: Duration,
    /// Upper bound on backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Decide whether another attempt is allowed after `retries_used`
    /// retries have already been consumed.
    pub fn decide(&self, retries_used: u32, error: &FetcherError) -> RetryDecision {
        if !error.is_retryable() || retries_used >= self.max_retries {
            return RetryDecision::NoRetry;
        }

        let exp = 1u32 << retries_used.min(8);
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        RetryDecision::RetryAfter(delay)
    }
}
