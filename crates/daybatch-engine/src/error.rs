//! Error types for the execution control plane.

use thiserror::Error;

/// Engine error types, matching the propagation policy: validation fails
/// the command, broker rejections park the item, invariant breaches stop
/// the component.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Broker(#[from] daybatch_broker::BrokerError),

    #[error(transparent)]
    Store(#[from] daybatch_store::StoreError),

    #[error(transparent)]
    Core(#[from] daybatch_core::CoreError),

    #[error("Position handle unavailable for item {item}")]
    PositionNotAvailable { item: i64 },

    #[error("Bracket rollback failed for item {item}: surviving order {order}")]
    BracketRollbackFailed { item: i64, order: String },

    #[error("Both legs of OCO group {group} reported fills")]
    OverfillDetected { group: i64 },

    #[error("EOD close failed for item {item}: {reason}")]
    EodFailed { item: i64, reason: String },

    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),
}

/// Result type alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
