//! Circuit breaker for calls to flaky external dependencies.
//!
//! Closed → open after `failure_threshold` consecutive failures; open →
//! half-open once the cooldown elapses; half-open → closed after
//! `success_threshold` consecutive successes, or straight back to open on
//! any failure.

use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker thresholds and cooldown.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Typed denial returned while the circuit is open.
#[derive(Debug, Error)]
#[error("circuit open, retry in {retry_after:?}")]
pub struct CircuitOpen {
    /// Remaining cooldown before the breaker half-opens.
    pub retry_after: Duration,
}

enum Inner {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    /// Check whether a call may proceed.
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open and
    /// admits the call as a probe.
    pub fn check(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.lock();
        match &*inner {
            Inner::Closed { .. } | Inner::HalfOpen { .. } => Ok(()),
            Inner::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.config.cooldown {
                    info!("Circuit breaker half-open, admitting probe");
                    *inner = Inner::HalfOpen { successes: 0 };
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        retry_after: self.config.cooldown - elapsed,
                    })
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match &mut *inner {
            Inner::Closed { failures } => *failures = 0,
            Inner::HalfOpen { successes } => {
                *successes += 1;
                if *successes >= self.config.success_threshold {
                    info!("Circuit breaker closed");
                    *inner = Inner::Closed { failures: 0 };
                }
            }
            Inner::Open { .. } => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match &mut *inner {
            Inner::Closed { failures } => {
                *failures += 1;
                if *failures >= self.config.failure_threshold {
                    warn!(
                        failures = *failures,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "Circuit breaker opened"
                    );
                    *inner = Inner::Open {
                        since: Instant::now(),
                    };
                }
            }
            Inner::HalfOpen { .. } => {
                warn!("Half-open probe failed, circuit breaker re-opened");
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        match &*self.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn breaker(failures: u32, successes: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_consecutive_failures() {
        let cb = breaker(3, 1, 100);
        assert_eq!(cb.state(), BreakerState::Closed);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.check().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let cb = breaker(3, 1, 100);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_opens_after_cooldown() {
        let cb = breaker(1, 1, 100);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_successes() {
        let cb = breaker(1, 2, 50);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(cb.check().is_ok());

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let cb = breaker(1, 2, 50);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(cb.check().is_ok());

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.check().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn denial_reports_remaining_cooldown() {
        let cb = breaker(1, 1, 100);
        cb.record_failure();

        tokio::time::advance(Duration::from_millis(40)).await;
        let err = cb.check().unwrap_err();
        assert_eq!(err.retry_after, Duration::from_millis(60));
    }
}
