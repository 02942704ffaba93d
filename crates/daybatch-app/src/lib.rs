//! Binary wiring: configuration, logging and startup.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{AppConfig, Secret};
pub use error::{AppError, AppResult};
pub use logging::init_logging;
