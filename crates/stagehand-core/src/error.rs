//! Error types for the Stagehand core library.

use thiserror::Error;

/// Result type alias using the Stagehand core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Stagehand operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A concurrency primitive was shut down while callers were waiting
    #[error("Primitive closed: {0}")]
    Closed(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
