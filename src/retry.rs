use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::TaskError;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MULTIPLIER: f64 = 2.0;
const MAX_BACKOFF_INTERVAL: Duration = Duration::from_secs(150);

/// Spacing between two attempts.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    /// `interval * multiplier^(attempt - 1)`, capped at `max_interval`.
    Exponential { multiplier: f64, max_interval: Duration },
}

/// Retry transient errors every `interval` until `timeout` has elapsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn until_timeout(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            backoff: Backoff::Fixed,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Wait after the given (1-based) failed attempt.
    pub fn wait_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential {
                multiplier,
                max_interval,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let backoff = self.interval.as_secs_f64() * multiplier.powi(exponent);
                if !backoff.is_finite() || backoff >= max_interval.as_secs_f64() {
                    max_interval
                } else {
                    Duration::from_secs_f64(backoff)
                }
            }
        }
    }
}

pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        let mut policy = policy;

        if policy.interval.is_zero() {
            policy.interval = DEFAULT_INTERVAL;
        }
        if policy.timeout.is_zero() {
            policy.timeout = DEFAULT_TIMEOUT;
        }
        if let Backoff::Exponential {
            multiplier,
            max_interval,
        } = &mut policy.backoff
        {
            if *multiplier <= 1.0 {
                *multiplier = DEFAULT_MULTIPLIER;
            }
            if max_interval.is_zero() || *max_interval > MAX_BACKOFF_INTERVAL {
                *max_interval = MAX_BACKOFF_INTERVAL;
            }
        }

        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Calls `operation` until it succeeds, returns a non-retryable error, the
    /// policy's timeout elapses or `ctx` is cancelled.
    ///
    /// Each attempt gets a child token of `ctx` that is cancelled once the
    /// deadline passes, and an in-flight attempt is abandoned at that point.
    pub async fn execute_with_retry<F, Fut>(
        &self,
        ctx: &CancellationToken,
        task_name: &str,
        mut operation: F,
    ) -> Result<(), TaskError>
    where
        F: FnMut(CancellationToken, u32) -> Fut,
        Fut: Future<Output = Result<(), TaskError>>,
    {
        let deadline = Instant::now() + self.policy.timeout;
        let mut last_error: Option<TaskError> = None;
        let mut attempt: u32 = 0;

        loop {
            if Instant::now() >= deadline {
                return Err(self.timeout_error(task_name, attempt, last_error));
            }
            attempt += 1;

            let attempt_ctx = ctx.child_token();
            let result = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    attempt_ctx.cancel();
                    return Err(TaskError::Cancelled);
                }
                _ = sleep_until(deadline) => {
                    attempt_ctx.cancel();
                    return Err(self.timeout_error(task_name, attempt, last_error));
                }
                result = operation(attempt_ctx.clone(), attempt) => result,
            };

            match result {
                Ok(()) => {
                    debug!(task = %task_name, attempt, "Attempt succeeded");
                    return Ok(());
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    debug!(task = %task_name, attempt, error = %err, "Attempt failed, retrying");
                    last_error = Some(err);
                }
            }

            let wait_time = self.policy.wait_after(attempt);
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(TaskError::Cancelled),
                _ = sleep_until(deadline) => {
                    return Err(self.timeout_error(task_name, attempt, last_error));
                }
                _ = sleep(wait_time) => {}
            }
        }
    }

    fn timeout_error(
        &self,
        task_name: &str,
        attempts: u32,
        last_error: Option<TaskError>,
    ) -> TaskError {
        debug!(task = %task_name, attempts, timeout = ?self.policy.timeout, "Retry timed out");
        TaskError::Timeout {
            timeout: self.policy.timeout,
            last_error: last_error.map(Box::new),
        }
    }
}
