//! Error types for daybatch-store.

use thiserror::Error;

/// Store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    #[error("Corrupt persisted value: {0}")]
    Core(#[from] daybatch_core::CoreError),

    #[error("Illegal item transition on item {item}: {from} -> {to}")]
    IllegalTransition { item: i64, from: String, to: String },

    #[error("Plan fields are locked while the parent batch is active (item {0})")]
    PlanLocked(i64),

    #[error("Broker order id already recorded: {0}")]
    DuplicateBrokerOrderId(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
