// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Retry logic with exponential backoff for directory-service calls.
//!
//! Retryable failures (timeouts, connection errors, rate limiting, server errors) are
//! retried with exponential backoff and jitter up to a fixed number of attempts.
//! Permanent failures (authentication, invalid hostname, rejection) fail immediately.
//! Every attempt runs under a timeout so a hung call degrades to a retryable failure.

use crate::config::Config;
use crate::constants::OPERATION_TIMEOUT_FACTOR;
use crate::directory_errors::DirectoryError;
use crate::metrics;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Simple exponential backoff implementation.
///
/// Provides exponential backoff with randomization (jitter) to prevent thundering herd,
/// bounded by a maximum number of attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Current interval duration
    pub current_interval: Duration,
    /// Maximum interval duration
    pub max_interval: Duration,
    /// Total attempts allowed, the first one included
    pub max_attempts: u32,
    /// Backoff multiplier (typically 2.0 for doubling)
    pub multiplier: f64,
    /// Randomization factor (e.g., 0.1 for ±10%)
    pub randomization_factor: f64,
    failed_attempts: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with specified parameters.
    #[must_use]
    pub fn new(
        initial_interval: Duration,
        max_interval: Duration,
        max_attempts: u32,
        multiplier: f64,
        randomization_factor: f64,
    ) -> Self {
        Self {
            current_interval: initial_interval,
            max_interval,
            max_attempts,
            multiplier,
            randomization_factor,
            failed_attempts: 0,
        }
    }

    /// Record a failed attempt and get the wait before the next one.
    ///
    /// Returns `None` once `max_attempts` attempts have failed.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        self.failed_attempts += 1;
        if self.failed_attempts >= self.max_attempts {
            return None;
        }

        let interval = self.current_interval;
        let jittered = self.apply_jitter(interval);

        let next = interval.as_secs_f64() * self.multiplier;
        self.current_interval = Duration::from_secs_f64(next).min(self.max_interval);

        Some(jittered)
    }

    /// Apply randomization (jitter) to an interval.
    fn apply_jitter(&self, interval: Duration) -> Duration {
        if self.randomization_factor <= 0.0 {
            return interval;
        }

        let secs = interval.as_secs_f64();
        let delta = secs * self.randomization_factor;
        let jittered = secs - delta + 2.0 * delta * rand::random::<f64>();

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// How directory calls are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per call
    pub max_attempts: u32,
    /// First backoff interval
    pub initial_interval: Duration,
    /// Backoff ceiling
    pub max_interval: Duration,
    /// Exponential growth factor
    pub multiplier: f64,
    /// Jitter factor
    pub randomization_factor: f64,
    /// Hard limit on a single attempt
    pub operation_timeout: Duration,
}

impl RetryPolicy {
    /// Build the policy from configuration.
    ///
    /// The per-attempt limit is the directory request timeout times
    /// [`OPERATION_TIMEOUT_FACTOR`].
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let retry = &config.retry;
        Self {
            max_attempts: retry.max_attempts,
            initial_interval: Duration::from_millis(retry.initial_interval_millis),
            max_interval: Duration::from_secs(retry.max_interval_secs),
            multiplier: retry.multiplier,
            randomization_factor: retry.randomization_factor,
            operation_timeout: Duration::from_secs(config.directory.request_timeout_secs)
                * OPERATION_TIMEOUT_FACTOR,
        }
    }

    /// A fresh backoff for one call.
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            self.initial_interval,
            self.max_interval,
            self.max_attempts,
            self.multiplier,
            self.randomization_factor,
        )
    }
}

/// Result of a retried call and how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final outcome
    pub result: Result<T, DirectoryError>,
    /// Attempts made, at least 1
    pub attempts: u32,
}

/// Retry a directory call with exponential backoff.
///
/// `operation` and `hostname` are used for logs and the `directory_calls_total` metric.
///
/// # Example
///
/// ```no_run
/// use dnsync::directory::{DirectoryClient, MemoryDirectory};
/// use dnsync::reconcilers::retry::{retry_directory_call, RetryPolicy};
/// # async fn example(policy: RetryPolicy) {
/// let directory = MemoryDirectory::new();
/// let outcome = retry_directory_call(&policy, "delete_record", "web.example.com", || {
///     directory.delete_record("web.example.com")
/// })
/// .await;
/// println!("{} attempt(s): {:?}", outcome.attempts, outcome.result);
/// # }
/// ```
pub async fn retry_directory_call<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    hostname: &str,
    mut call: F,
) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DirectoryError>>,
{
    let mut backoff = policy.backoff();
    let start_time = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(policy.operation_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(DirectoryError::Timeout {
                operation: operation.to_string(),
                timeout_ms: u64::try_from(policy.operation_timeout.as_millis())
                    .unwrap_or(u64::MAX),
            }),
        };

        match result {
            Ok(value) => {
                metrics::record_directory_call(operation, "success");
                if attempt > 1 {
                    debug!(
                        operation = operation,
                        hostname = %hostname,
                        attempt = attempt,
                        elapsed = ?start_time.elapsed(),
                        "Directory call succeeded after retries"
                    );
                }
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(e) if !e.is_retryable() => {
                metrics::record_directory_call(operation, "permanent");
                error!(
                    operation = operation,
                    hostname = %hostname,
                    error = %e,
                    "Permanent directory error, not retrying"
                );
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                };
            }
            Err(e) => {
                metrics::record_directory_call(operation, "retryable");
                if let Some(duration) = backoff.next_backoff() {
                    warn!(
                        operation = operation,
                        hostname = %hostname,
                        attempt = attempt,
                        retry_after = ?duration,
                        error = %e,
                        "Retryable directory error, will retry"
                    );
                    tokio::time::sleep(duration).await;
                } else {
                    error!(
                        operation = operation,
                        hostname = %hostname,
                        attempt = attempt,
                        elapsed = ?start_time.elapsed(),
                        error = %e,
                        "Retries exhausted, giving up"
                    );
                    return Attempted {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod retry_tests;
