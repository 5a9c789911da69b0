//! Retry with exponential backoff and jitter.
//!
//! The transient/permanent decision is a caller-supplied predicate on the
//! error value, not string sniffing: callers tag their error types and pass
//! `is_retryable`. Exhaustion surfaces the original error unmodified, and a
//! shutdown signal cancels cooperatively mid-backoff.

use std::time::Duration;

use rand::RngExt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Backoff policy: `initial_delay * multiplier^(attempt-1)`, capped at
/// `max_delay`, with `±jitter` fractional noise.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fractional jitter, e.g. `0.25` for ±25 %.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry number `attempt` (1-based), jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64()
            * self.multiplier.powi(attempt.saturating_sub(1).try_into().unwrap_or(i32::MAX));
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let noise = rand::rng().random_range(-self.jitter..=self.jitter);
            capped * (1.0 + noise)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Failure modes of [`retry_with_backoff`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The operation failed and no retry remained (or the error was
    /// classified permanent). Carries the original error unmodified.
    #[error("{0}")]
    Operation(E),

    /// Cancelled cooperatively while backing off.
    #[error("retry cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// Unwrap the original operation error, if any.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            Self::Cancelled => None,
        }
    }
}

/// Run `op` with retries per `policy`.
///
/// `op` receives the 1-based attempt number. `is_retryable` classifies
/// errors; a permanent error is returned immediately. `cancel` is an
/// optional shutdown watch: when it flips to `true` during a backoff wait,
/// the retry loop returns [`RetryError::Cancelled`] without running `op`
/// again.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    cancel: Option<watch::Receiver<bool>>,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt <= policy.max_retries && is_retryable(&e) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Transient failure, backing off"
                );
                if wait_or_cancel(delay, cancel.clone()).await {
                    return Err(RetryError::Cancelled);
                }
                attempt += 1;
            }
            Err(e) => {
                debug!(attempt, error = %e, "Giving up");
                return Err(RetryError::Operation(e));
            }
        }
    }
}

/// Sleep for `delay`, returning `true` if the cancel watch fired first.
async fn wait_or_cancel(delay: Duration, cancel: Option<watch::Receiver<bool>>) -> bool {
    let Some(mut cancel) = cancel else {
        tokio::time::sleep(delay).await;
        return false;
    };

    if *cancel.borrow() {
        return true;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => return false,
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_millis(50),
            jitter: 0.0,
        }
    }

    #[derive(Debug, thiserror::Error, PartialEq, Eq)]
    enum TestError {
        #[error("transient glitch")]
        Transient,
        #[error("bad payload")]
        Permanent,
    }

    const fn classify(e: &TestError) -> bool {
        matches!(e, TestError::Transient)
    }

    #[test]
    fn delays_follow_exponential_schedule() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        };

        for (attempt, base_ms) in [(1u32, 1000.0f64), (2, 2000.0), (3, 4000.0)] {
            let delay = policy.delay_for_attempt(attempt).as_secs_f64() * 1000.0;
            assert!(
                delay >= base_ms * 0.75 && delay <= base_ms * 1.25,
                "attempt {attempt}: {delay} ms outside ±25 % of {base_ms} ms"
            );
        }
    }

    #[test]
    fn delay_caps_at_max() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(4),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result: Result<u32, RetryError<TestError>> =
            retry_with_backoff(&fast_policy(), classify, None, move |_| {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result: Result<&str, RetryError<TestError>> =
            retry_with_backoff(&fast_policy(), classify, None, move |attempt| {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(TestError::Transient)
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
    async fn exhaustion_surfaces_original_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result: Result<(), RetryError<TestError>> =
            retry_with_backoff(&fast_policy(), classify, None, move |_| {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Transient)
                }
            })
            .await;

        // 1 initial + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result.unwrap_err() {
            RetryError::Operation(e) => assert_eq!(e, TestError::Transient),
            RetryError::Cancelled => panic!("should not be cancelled"),
        }
    }

    #[tokio::test]
    async fn permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);

        let result: Result<(), RetryError<TestError>> =
            retry_with_backoff(&fast_policy(), classify, None, move |_| {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Permanent)
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match result.unwrap_err() {
            RetryError::Operation(e) => assert_eq!(e, TestError::Permanent),
            RetryError::Cancelled => panic!("should not be cancelled"),
        }
    }

    #[tokio::test]
    async fn cancel_aborts_backoff() {
        let (tx, rx) = watch::channel(false);
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        };

        let handle = tokio::spawn(async move {
            retry_with_backoff::<(), TestError, _, _>(&policy, classify, Some(rx), |_| async {
                Err(TestError::Transient)
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancel should interrupt the 30s backoff")
            .unwrap();
        assert!(matches!(result.unwrap_err(), RetryError::Cancelled));
    }

    #[tokio::test]
    async fn already_cancelled_returns_immediately() {
        let (tx, rx) = watch::channel(true);
        drop(tx);

        let result: Result<(), RetryError<TestError>> =
            retry_with_backoff(&fast_policy(), classify, Some(rx), |_| async {
                Err(TestError::Transient)
            })
            .await;
        assert!(matches!(result.unwrap_err(), RetryError::Cancelled));
    }
}
