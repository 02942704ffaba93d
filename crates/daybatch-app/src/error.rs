//! Error types for the daybatch binary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] daybatch_store::StoreError),

    #[error(transparent)]
    Broker(#[from] daybatch_broker::BrokerError),

    #[error(transparent)]
    Engine(#[from] daybatch_engine::EngineError),
}

pub type AppResult<T> = std::result::Result<T, AppError>;
