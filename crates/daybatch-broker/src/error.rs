//! Error types for the broker adapter.

use thiserror::Error;

/// Broker adapter errors, classified for the engine's propagation policy.
#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    /// The broker understood and refused the request (4xx with a body).
    #[error("Broker rejected: code={code:?} {message}")]
    Rejected { code: Option<String>, message: String },

    /// Transport failure, 5xx, or retry budget exhausted.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// 401 that survived the single silent re-authentication.
    #[error("Authentication expired")]
    AuthExpired,

    /// 429 from the broker.
    #[error("Rate limited by broker (retry-after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Cancel target unknown to the broker.
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Response body did not match the expected shape.
    #[error("Invalid broker response: {0}")]
    InvalidResponse(String),

    /// Request could not be composed (caught before any submit).
    #[error("Invalid broker request: {0}")]
    InvalidRequest(String),
}

impl BrokerError {
    /// Worth retrying inside the adapter's backoff budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::RateLimited { .. })
    }
}

/// Result type alias for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
