//! # Retry
//!
//! Module providing a `RetryPolicy` struct to bound and space out attempts against
//! the dedup store and object storage.
use std::future::Future;
use std::time;

use tracing::warn;

use crate::error::RetryableError;

// Upper bound on the random jitter added to every backoff interval
const MAX_JITTER_MS: u64 = 25;

#[derive(Clone, Debug)]
/// A retry policy to determine retry parameters for a backend call.
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    /// Deadline for a single attempt. An attempt that exceeds it counts as a transient failure.
    pub attempt_timeout: time::Duration,
    /// Whether to add random jitter to each interval.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine the interval to wait before retry number `attempt` (1-based).
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(attempt.saturating_sub(1)));

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Run `operation` until it succeeds, returns a permanent error, or runs out of attempts.
    ///
    /// Every attempt is bounded by `attempt_timeout`. The last error is returned once
    /// attempts are exhausted.
    pub async fn retry<T, E, F, Fut>(&self, operation: &'static str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
    {
        let mut attempt: u32 = 1;

        loop {
            let result = match tokio::time::timeout(self.attempt_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(self.attempt_timeout)),
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !error.is_transient() || attempt >= self.max_attempts {
                return Err(error);
            }

            let mut interval = self.retry_interval(attempt);
            if self.jitter {
                interval += time::Duration::from_millis(rand::random::<u64>() % MAX_JITTER_MS);
            }

            warn!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                backoff_ms = interval.as_millis() as u64,
                "{error}, retrying"
            );
            metrics::counter!(crate::metrics_consts::BACKEND_RETRIES, "operation" => operation)
                .increment(1);

            tokio::time::sleep(interval).await;
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub max_attempts: u32,
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
    pub attempt_timeout: time::Duration,
    pub jitter: bool,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: None,
            attempt_timeout: time::Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    /// Number of retries after the first attempt.
    pub fn max_retries(mut self, retries: u32) -> RetryPolicyBuilder {
        self.max_attempts = retries.saturating_add(1);
        self
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn attempt_timeout(mut self, timeout: time::Duration) -> RetryPolicyBuilder {
        self.attempt_timeout = timeout;
        self
    }

    pub fn without_jitter(mut self) -> RetryPolicyBuilder {
        self.jitter = false;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            attempt_timeout: self.attempt_timeout,
            jitter: self.jitter,
        }
    }
}
