//! Exponential backoff bookkeeping for one logical request

use crate::config::ClientConfig;
use crate::error::RelayError;
use std::time::Duration;

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_time: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.retry_initial_ms),
            max: Duration::from_millis(config.retry_max_ms),
            max_time: Duration::from_millis(config.retry_max_time_ms),
        }
    }

    /// `min(max, initial * 2^(attempt-1))`; attempt numbering starts at 1
    pub fn backoff(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
    }
}

/// Reported to the retry observer before each sleep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEvent {
    pub code: String,
    pub message: String,
    pub attempt: u32,
    pub backoff_ms: u64,
}

impl RetryEvent {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry(RetryEvent),
    GiveUp(RelayError),
}

/// Attempt counter for one logical request
#[derive(Debug, Clone)]
pub struct RetryLoop {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryLoop {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Number of retries scheduled so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Time left for further attempts; `None` once the budget is spent
    pub fn remaining(&self, elapsed: Duration) -> Option<Duration> {
        self.policy
            .max_time
            .checked_sub(elapsed)
            .filter(|left| !left.is_zero())
    }

    /// `RETRY_TIMEOUT` carrying the code and message of the last failure
    pub fn exhausted(&self, last: &RelayError, elapsed: Duration) -> RelayError {
        RelayError::retry_timeout(format!(
            "Gave up after {} attempt(s) in {}ms, last error {}: {}",
            self.attempt + 1,
            elapsed.as_millis(),
            last.code(),
            last.message()
        ))
    }

    /// Decide what to do after a failed attempt
    ///
    /// Non-retryable errors are returned as they are. A retryable error turns
    /// into `RETRY_TIMEOUT` once sleeping the next backoff would take the
    /// total past `max_time`.
    pub fn decide(&mut self, error: RelayError, elapsed: Duration, retryable: bool) -> RetryDecision {
        if !retryable {
            return RetryDecision::GiveUp(error);
        }

        let next_attempt = self.attempt + 1;
        let backoff = self.policy.backoff(next_attempt);
        if elapsed.saturating_add(backoff) > self.policy.max_time {
            return RetryDecision::GiveUp(self.exhausted(&error, elapsed));
        }

        self.attempt = next_attempt;
        RetryDecision::Retry(RetryEvent {
            code: error.code().to_string(),
            message: error.message().to_string(),
            attempt: next_attempt,
            backoff_ms: backoff.as_millis() as u64,
        })
    }
}
