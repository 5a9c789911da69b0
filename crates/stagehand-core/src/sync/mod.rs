//! Concurrency and resilience primitives.
//!
//! These are the leaf building blocks of the orchestrator: none of them
//! depend on storage or on each other. All shared counters are mutated only
//! through their own methods; callers never read-then-write primitive state.

pub mod breaker;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod semaphore;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, CircuitOpen};
pub use rate_limit::{KeyedLimiter, RateDecision, SlidingWindow, TokenBucket};
pub use registry::{ResourceId, ResourceRegistry};
pub use retry::{RetryError, RetryPolicy, retry_with_backoff};
pub use semaphore::{Permit, PriorityMutex, PrioritySemaphore, ReadPermit, RwGate, WritePermit};
