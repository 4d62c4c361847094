//! Retry policy for transient external failures.
//!
//! Timeouts, transport failures, and 5xx responses back off exponentially
//! from `base_delay_ms`. Rate-limit responses back off by
//! `rate_limit_base_ms * 2^attempt`, capped at `rate_limit_cap_seconds`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::errors::FetchError;

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    #[default]
    Equal,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for transient errors in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Maximum delay for transient errors in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Unit of the rate-limit backoff in milliseconds.
    #[serde(default = "default_rate_limit_base")]
    pub rate_limit_base_ms: u64,
    /// Cap on a single rate-limit backoff in seconds.
    #[serde(default = "default_rate_limit_cap")]
    pub rate_limit_cap_seconds: u64,
    /// Jitter applied to transient-error delays.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_rate_limit_base() -> u64 {
    1000
}

fn default_rate_limit_cap() -> u64 {
    30
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            rate_limit_base_ms: default_rate_limit_base(),
            rate_limit_cap_seconds: default_rate_limit_cap(),
            jitter: JitterStrategy::default(),
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the rate-limit backoff unit.
    #[must_use]
    pub fn with_rate_limit_base_ms(mut self, delay: u64) -> Self {
        self.rate_limit_base_ms = delay;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// A policy that never sleeps, for tests and local runs.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            rate_limit_base_ms: 0,
            jitter: JitterStrategy::None,
            ..Self::default()
        }
    }

    /// Delay before retrying after `attempt` (0-based) failed with `error`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, error: &FetchError) -> Duration {
        let factor = 2u64.saturating_pow(attempt);

        if error.is_rate_limited() {
            let cap_ms = self.rate_limit_cap_seconds.saturating_mul(1000);
            return Duration::from_millis(self.rate_limit_base_ms.saturating_mul(factor).min(cap_ms));
        }

        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }

    /// Decides what to do after `attempt` (0-based) failed with `error`.
    #[must_use]
    pub fn decide(&self, attempt: u32, error: &FetchError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::NotRetryable;
        }
        if attempt + 1 >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(attempt, error))
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// Executes an operation with retry logic.
///
/// Returns the last error once attempts are exhausted or the error is not
/// retryable.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut operation: F,
) -> Result<T, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => match config.decide(attempt, &e) {
                RetryDecision::Retry(delay) => {
                    tracing::debug!(
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp | RetryDecision::NotRetryable => return Err(e),
            },
        }
    }
}
