//! Timeout-and-retry wrapper for outbound calls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// How an outbound call is bounded and retried.
///
/// After the n-th failed attempt the wrapper sleeps `backoff_step * n`
/// before trying again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Upper bound for a single attempt, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Linear backoff step, in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    1_000
}

impl RetryPolicy {
    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before retrying after `attempt` failed attempts.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Final failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The last attempt did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The last attempt failed.
    #[error("{0}")]
    Inner(E),
}

/// Run `operation` under `policy`, returning the first success or the error
/// of the last attempt.
pub async fn with_timeout_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let timeout = policy.timeout();
    let mut retries: u32 = 0;

    loop {
        let error = match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => RetryError::Inner(e),
            Err(_) => RetryError::Timeout(timeout),
        };

        if retries >= policy.max_retries {
            return Err(error);
        }
        retries += 1;

        let delay = policy.backoff(retries);
        warn!(
            attempt = retries,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Outbound call failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout_ms: 100,
            max_retries,
            backoff_ms: 10,
        }
    }

    #[test]
    fn test_linear_backoff() {
        let policy = policy(3);
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result = with_timeout_retry(&policy(3), || {
            let attempts = Arc::clone(&attempts);
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = with_timeout_retry(&policy(2), || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("provider unavailable")
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Inner("provider unavailable"))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maximum_retry_budget() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result = with_timeout_retry(&policy(u32::MAX), || {
            let attempts = Arc::clone(&attempts);
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 4 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 4);
        let longest = policy(u32::MAX).backoff(u32::MAX);
        assert_eq!(longest, Duration::from_millis(10 * u64::from(u32::MAX)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out() {
        let result: Result<(), RetryError<String>> = with_timeout_retry(&policy(0), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(RetryError::Timeout(d)) if d == Duration::from_millis(100)));
    }
}
