use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::TransferError;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp,
}

/// Final result of a retried operation and how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, TransferError>,
    pub attempts: u32,
}

impl RetryPolicy {
    /// No backoff between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// What to do after `attempts` attempts, the last of which failed with `err`.
    pub fn decide(&self, attempts: u32, err: &TransferError) -> RetryDecision {
        if !err.is_retryable() || attempts > self.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                after: self.delay_for_retry(attempts),
            }
        }
    }

    /// Runs `op` until it succeeds or [`RetryPolicy::decide`] gives up.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match op(attempts).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) => e,
            };
            match self.decide(attempts, &err) {
                RetryDecision::GiveUp => {
                    return RetryOutcome {
                        result: Err(err),
                        attempts,
                    };
                }
                RetryDecision::Retry { after } => {
                    warn!("Attempt {} failed, retrying in {:?}: {}", attempts, after, err);
                    if !after.is_zero() {
                        tokio::time::sleep(after).await;
                    }
                }
            }
        }
    }
}
