//! Error types for daybatch-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Unknown status code: {0}")]
    UnknownStatusCode(String),

    #[error("Invalid wall-clock time: {0}")]
    InvalidTime(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
