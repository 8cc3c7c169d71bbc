//! Bounded single-retry combinator with a per-attempt timeout.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RuntimeError;

/// Timing controls for one retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum wall-clock time for a single attempt (milliseconds).
    pub attempt_timeout_ms: u64,
    /// Fixed delay before the second attempt (milliseconds).
    pub retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 30_000,
            retry_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

async fn attempt<T, Fut>(policy: &RetryPolicy, fut: Fut) -> Result<T, RuntimeError>
where
    Fut: Future<Output = Result<T, RuntimeError>>,
{
    match tokio::time::timeout(policy.attempt_timeout(), fut).await {
        Ok(result) => result,
        Err(_elapsed) => Err(RuntimeError::Timeout(policy.attempt_timeout_ms)),
    }
}

/// Run `op`; on failure wait `retry_delay` and run it exactly once more.
///
/// Each attempt is bounded by `attempt_timeout`. The second attempt's error
/// is the one returned.
pub async fn retry_once<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    op: F,
) -> Result<T, RuntimeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
{
    match attempt(policy, op()).await {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!(operation = what, error = %first, "attempt failed, retrying once");
            tokio::time::sleep(policy.retry_delay()).await;
            attempt(policy, op()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            attempt_timeout_ms: 1000,
            retry_delay_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry_once(&fast(), "op", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok::<_, RuntimeError>(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_retries_exactly_once_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry_once(&fast(), "op", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::Relaxed) == 0 {
                    Err(RuntimeError::Backend("transient".into()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, "ok");
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_second_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = retry_once(&fast(), "op", || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::Relaxed);
                Err::<(), _>(RuntimeError::Backend(format!("failure {n}")))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert!(err.to_string().contains("failure 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failure() {
        let policy = RetryPolicy {
            attempt_timeout_ms: 50,
            retry_delay_ms: 10,
        };
        let err = retry_once(&policy, "slow", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, RuntimeError>(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RuntimeError::Timeout(50)));
    }
}
