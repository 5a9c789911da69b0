//! Token-bucket and sliding-window rate limiters.
//!
//! Limiters return a typed [`RateDecision`] instead of erroring: a denial is
//! an expected condition and carries a computed `retry_after` so callers can
//! requeue instead of spinning. The [`KeyedLimiter`] wrapper maintains one
//! limiter per key (e.g. per remote host) so one overloaded dependency
//! cannot starve the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// When denied, how long until the request would be allowed.
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    const fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    const fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: `capacity` tokens, refilled at `refill_per_sec`.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket that starts full.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to consume `n` tokens.
    pub fn try_consume(&self, n: u32) -> RateDecision {
        let needed = f64::from(n);
        if needed > self.capacity {
            // Can never be satisfied; report the refill time for the full
            // deficit anyway so callers see a finite delay.
            return RateDecision::deny(self.refill_time(needed));
        }

        let mut state = self.lock();
        self.refill(&mut state);

        if state.tokens >= needed {
            state.tokens -= needed;
            return RateDecision::allow();
        }

        RateDecision::deny(self.refill_time(needed - state.tokens))
    }

    /// Tokens currently available (after refill), rounded down.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn available(&self) -> u32 {
        let mut state = self.lock();
        self.refill(&mut state);
        state.tokens.floor() as u32
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            state.last_refill = now;
        }
    }

    fn refill_time(&self, deficit: f64) -> Duration {
        if self.refill_per_sec <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64(deficit / self.refill_per_sec)
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Sliding-window limiter: at most `max_events` within the trailing window.
pub struct SlidingWindow {
    max_events: usize,
    window: Duration,
    events: Mutex<std::collections::VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            max_events,
            window,
            events: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Record one event if the window has room.
    pub fn try_record(&self) -> RateDecision {
        let now = Instant::now();
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        while let Some(front) = events.front() {
            if now.duration_since(*front) >= self.window {
                events.pop_front();
            } else {
                break;
            }
        }

        if events.len() < self.max_events {
            events.push_back(now);
            return RateDecision::allow();
        }

        // The oldest event ages out first; that is when room opens up.
        let retry_after = events
            .front()
            .map_or(self.window, |oldest| {
                self.window.saturating_sub(now.duration_since(*oldest))
            });
        RateDecision::deny(retry_after)
    }

    /// Events currently inside the window.
    pub fn current_count(&self) -> usize {
        let now = Instant::now();
        let events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        events
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }
}

/// Per-key limiter wrapper: lazily creates one limiter per key.
pub struct KeyedLimiter<L> {
    factory: Box<dyn Fn() -> L + Send + Sync>,
    limiters: Mutex<HashMap<String, Arc<L>>>,
}

impl<L> KeyedLimiter<L> {
    pub fn new(factory: impl Fn() -> L + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Get (or create) the limiter for `key`.
    pub fn limiter(&self, key: &str) -> Arc<L> {
        let mut limiters = match self.limiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            limiters
                .entry(key.to_string())
                .or_insert_with(|| Arc::new((self.factory)())),
        )
    }

    /// Number of distinct keys seen so far.
    pub fn key_count(&self) -> usize {
        match self.limiters.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
