// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `retry.rs`

#[cfg(test)]
mod tests {
    use super::super::{retry_directory_call, ExponentialBackoff, RetryPolicy};
    use crate::config::Config;
    use crate::directory_errors::DirectoryError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(4),
            multiplier: 2.0,
            randomization_factor: 0.0,
            operation_timeout: Duration::from_secs(5),
        }
    }

    fn retryable() -> DirectoryError {
        DirectoryError::Connection {
            reason: "connection reset".to_string(),
        }
    }

    /// Test that the policy follows the configuration
    #[test]
    fn test_policy_from_config() {
        let config = Config::from_yaml(
            r"
directory:
  server: ipa.example.com
  zone: example.com
  username: admin
  request_timeout_secs: 10
load_balancer_addresses: [10.0.0.1]
retry:
  max_attempts: 7
  initial_interval_millis: 250
",
        )
        .unwrap();

        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.initial_interval, Duration::from_millis(250));
        assert_eq!(
            policy.operation_timeout,
            Duration::from_secs(80),
            "Operation timeout should be 8x the request timeout"
        );
    }

    /// Test backoff growth and capping at the max interval
    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(350),
            10,
            2.0,
            0.0,
        );

        let waits: Vec<Duration> = std::iter::from_fn(|| backoff.next_backoff())
            .take(5)
            .collect();
        assert_eq!(
            waits,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350),
                Duration::from_millis(350),
                Duration::from_millis(350),
            ]
        );
    }

    /// Test that the backoff allows exactly `max_attempts` attempts
    #[test]
    fn test_backoff_stops_after_max_attempts() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(1), Duration::from_secs(1), 3, 2.0, 0.0);
        assert!(backoff.next_backoff().is_some(), "Wait after attempt 1");
        assert!(backoff.next_backoff().is_some(), "Wait after attempt 2");
        assert!(backoff.next_backoff().is_none(), "No attempt 4");

        assert!(backoff.next_backoff().is_none(), "Exhaustion is final");
    }

    /// Test that jitter stays within the randomization factor
    #[test]
    fn test_jitter_bounds() {
        for _ in 0..200 {
            let mut backoff = ExponentialBackoff::new(
                Duration::from_millis(1000),
                Duration::from_secs(60),
                5,
                2.0,
                0.1,
            );
            let wait = backoff.next_backoff().unwrap();
            assert!(
                wait >= Duration::from_millis(900) && wait <= Duration::from_millis(1100),
                "Jittered wait {wait:?} outside ±10%"
            );
        }
    }

    /// Test two retryable failures followed by success take exactly three attempts
    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let outcome = retry_directory_call(&quick_policy(5), "upsert_record", "api.x", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(retryable())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), 3);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    /// Test that permanent failures are not retried
    #[tokio::test]
    async fn test_permanent_failure_fails_fast() {
        let calls = AtomicU32::new(0);
        let outcome: super::super::Attempted<()> =
            retry_directory_call(&quick_policy(5), "upsert_record", "bad.x", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(DirectoryError::Authentication {
                        reason: "bad password".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(
            outcome.result,
            Err(DirectoryError::Authentication { .. })
        ));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Test that retries stop at the attempt cap
    #[tokio::test]
    async fn test_retries_exhausted() {
        let calls = AtomicU32::new(0);
        let outcome: super::super::Attempted<()> =
            retry_directory_call(&quick_policy(4), "delete_record", "web.x", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(retryable()) }
            })
            .await;

        assert!(outcome.result.unwrap_err().is_retryable());
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    /// Test that a hung call is cut off and reported as a timeout
    #[tokio::test]
    async fn test_hung_call_times_out() {
        let mut policy = quick_policy(2);
        policy.operation_timeout = Duration::from_millis(20);

        let outcome: super::super::Attempted<()> =
            retry_directory_call(&policy, "upsert_record", "slow.x", || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        assert!(matches!(outcome.result, Err(DirectoryError::Timeout { .. })));
        assert_eq!(outcome.attempts, 2, "Timeouts are retryable");
    }
}
