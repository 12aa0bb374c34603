//! Bounded retry helpers
//!
//! Every wait in the recorder that depends on something outside our control
//! (a file handle being released, a process exiting, a database answering)
//! goes through these helpers so the bound lives in configuration.

use serde::{Deserialize, Serialize};
use std::cmp;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff policy: `delay = min(base * 2^attempt, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound for a single delay, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// Delay to sleep after the failed attempt number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential_delay(
            Duration::from_millis(self.base_delay_ms),
            attempt,
            Duration::from_millis(self.max_delay_ms),
        )
    }

    /// Longest time a caller can spend sleeping under this policy
    pub fn worst_case(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.delay_for(attempt))
            .sum()
    }
}

/// `min(base * 2^exponent, cap)`, saturating instead of overflowing
pub fn exponential_delay(base: Duration, exponent: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    let delay = base.checked_mul(factor).unwrap_or(cap);
    cmp::min(delay, cap)
}

/// Run `operation` until it succeeds, the error is not retryable, or the
/// policy runs out of attempts. The last error is returned as-is.
///
/// The closure receives the 0-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < attempts && should_retry(&err) => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    "Attempt {}/{} failed: {}; retrying in {:?}",
                    attempt + 1,
                    attempts,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Check `condition` every `interval` until it holds or `timeout` elapses.
/// Returns whether the condition was observed.
pub async fn poll_until<F>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;

    loop {
        if condition() {
            return true;
        }

        let now = Instant::now();
        if now >= deadline {
            return false;
        }

        tokio::time::sleep(cmp::min(interval, deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(63), Duration::from_secs(30));
    }

    #[test]
    fn test_error_backoff_matches_station_policy() {
        let interval = Duration::from_secs(5);
        let cap = Duration::from_secs(300);

        assert_eq!(exponential_delay(interval, 1, cap), Duration::from_secs(10));
        assert_eq!(exponential_delay(interval, 4, cap), Duration::from_secs(80));
        assert_eq!(exponential_delay(interval, 7, cap), cap);
    }

    #[test]
    fn test_worst_case_sums_delays() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100), Duration::from_millis(250));
        // 100 + 200 + 250
        assert_eq!(policy.worst_case(), Duration::from_millis(550));
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);

        let result: Result<&str, String> = retry_with_backoff(&fast_policy(5), |_| true, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(format!("busy {}", n))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = retry_with_backoff(&fast_policy(3), |_| true, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("attempt {}", attempt)) }
        })
        .await;

        assert_eq!(result.unwrap_err(), "attempt 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);

        let result: Result<(), String> =
            retry_with_backoff(&fast_policy(5), |e: &String| e != "fatal", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_until() {
        let mut remaining = 3;
        let seen = poll_until(Duration::from_secs(1), Duration::from_millis(1), || {
            remaining -= 1;
            remaining == 0
        })
        .await;
        assert!(seen);

        let never = poll_until(Duration::from_millis(20), Duration::from_millis(5), || false).await;
        assert!(!never);
    }
}
