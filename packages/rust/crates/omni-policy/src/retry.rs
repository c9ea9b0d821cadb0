//! Bounded retries with per-attempt timeout for persistence calls.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{PolicyError, PolicyResult};
use crate::observability::PolicyEvent;

const MAX_BACKOFF_SHIFT: u32 = 8;

/// Backoff before attempt `attempt + 1`, doubling from `initial` and capped.
pub(crate) fn compute_retry_backoff(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
    initial.saturating_mul(1_u32 << shift).min(max)
}

/// Run `call` until it succeeds or the retry budget is spent.
///
/// Each attempt is cut off at `config.attempt_timeout`. Exhaustion maps to
/// [`PolicyError::PersistenceUnavailable`] carrying the last failure.
pub(crate) async fn with_retry<T, F, Fut>(
    operation: &'static str,
    config: &RetryConfig,
    mut call: F,
) -> PolicyResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = config.attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match tokio::time::timeout(config.attempt_timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) => last_error = format!("{error:#}"),
            Err(_) => {
                last_error = format!(
                    "timed out after {} ms",
                    config.attempt_timeout.as_millis()
                );
            }
        }

        if attempt < attempts {
            let backoff =
                compute_retry_backoff(config.initial_backoff, config.max_backoff, attempt);
            tracing::warn!(
                event = PolicyEvent::PersistenceAttemptFailed.as_str(),
                operation,
                attempt,
                max_attempts = attempts,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                error = %last_error,
                "persistence attempt failed; retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    tracing::error!(
        event = PolicyEvent::PersistenceGaveUp.as_str(),
        operation,
        attempts,
        error = %last_error,
        "persistence unavailable after bounded retries"
    );
    Err(PolicyError::PersistenceUnavailable {
        operation,
        attempts,
        message: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let initial = Duration::from_millis(50);
        let max = Duration::from_millis(300);
        assert_eq!(compute_retry_backoff(initial, max, 1), Duration::from_millis(50));
        assert_eq!(compute_retry_backoff(initial, max, 2), Duration::from_millis(100));
        assert_eq!(compute_retry_backoff(initial, max, 3), Duration::from_millis(200));
        assert_eq!(compute_retry_backoff(initial, max, 4), max);
        assert_eq!(compute_retry_backoff(initial, max, 40), max);
    }

    fn fast_config(attempts: u32) -> RetryConfig {
        RetryConfig {
            attempts,
            attempt_timeout: Duration::from_millis(200),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let value = with_retry("test.op", &fast_config(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    anyhow::bail!("transient {n}");
                }
                Ok(7_u32)
            }
        })
        .await
        .expect("third attempt succeeds");
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_with_attempt_count() {
        let calls = AtomicU32::new(0);
        let error = with_retry("test.op", &fast_config(2), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("down")) }
        })
        .await
        .expect_err("all attempts fail");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match error {
            PolicyError::PersistenceUnavailable {
                operation,
                attempts,
                message,
            } => {
                assert_eq!(operation, "test.op");
                assert_eq!(attempts, 2);
                assert!(message.contains("down"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn slow_attempt_times_out() {
        let error = with_retry("test.slow", &fast_config(1), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .expect_err("times out");
        assert!(error.to_string().contains("timed out"));
    }
}
