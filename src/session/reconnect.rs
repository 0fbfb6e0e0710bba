//! Connection Retry Module
//!
//! Exponential backoff around a connect attempt. The delay doubles after
//! each failure and never exceeds [`MAX_RETRY_BACKOFF`].

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::ssh::{ConnectionPolicy, SshError, MAX_RETRY_BACKOFF};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: MAX_RETRY_BACKOFF,
        }
    }
}

impl From<&ConnectionPolicy> for RetryPolicy {
    fn from(policy: &ConnectionPolicy) -> Self {
        Self {
            max_retries: policy.max_retries,
            initial_delay: policy.retry_backoff(),
            max_delay: MAX_RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay slept after failed attempt `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Every delay the policy can sleep, in order
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_retries).map(|a| self.delay_after(a)).collect()
    }

    /// Run `connect_fn` until it succeeds or the attempts are exhausted
    ///
    /// Each failure is logged; only the last error is returned.
    pub async fn run<T, F, Fut>(&self, session_id: &str, mut connect_fn: F) -> Result<T, SshError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SshError>>,
    {
        let max_attempts = self.max_attempts();
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.delay_after(attempt - 1);
                info!(
                    "Session {}: waiting {}ms before connect attempt {}/{}",
                    session_id,
                    delay.as_millis(),
                    attempt,
                    max_attempts
                );
                sleep(delay).await;
            }

            match connect_fn(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            "Session {}: connected on attempt {}/{}",
                            session_id, attempt, max_attempts
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!(
                        "Session {}: connect attempt {}/{} failed: {}",
                        session_id, attempt, max_attempts, e
                    );
                    last_error = Some(e);
                }
            }
        }

        error!(
            "Session {}: giving up after {} attempts",
            session_id, max_attempts
        );
        Err(last_error.unwrap_or(SshError::NotConnected))
    }
}
