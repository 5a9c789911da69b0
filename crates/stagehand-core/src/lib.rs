//! Stagehand Core Library
//!
//! Shared functionality for Stagehand components:
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Tracing initialization
//! - Concurrency and resilience primitives (semaphore, rate limiters,
//!   retry-with-backoff, circuit breaker, resource registry)
//! - Common error types

pub mod db;
pub mod error;
pub mod sync;
pub mod tracing_init;

pub use error::{Error, Result};
