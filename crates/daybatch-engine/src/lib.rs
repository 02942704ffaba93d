//! Execution control plane: scheduler, execution engine, watcher, OCO
//! manager, EOD closer and the supervisor that wires them together.
//!
//! All components coordinate through the store; each long-running
//! component is a loop with its own period, the execution engine and OCO
//! manager are additionally fed by in-process queues. The durable view is
//! canonical: every queue message is a hint that can be reconstructed by
//! the periodic scans.

pub mod eod;
pub mod error;
pub mod executor;
pub mod oco;
pub mod scheduler;
pub mod supervisor;
pub mod watcher;

pub use error::{EngineError, EngineResult};
pub use supervisor::{Supervisor, SupervisorConfig};

use daybatch_broker::{DynBroker, RateLimiter};
use daybatch_core::DynClock;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// Shared handles every actor needs.
#[derive(Clone)]
pub struct EngineCtx {
    pub db: DatabaseConnection,
    pub broker: DynBroker,
    pub rate: Arc<RateLimiter>,
    pub clock: DynClock,
}

impl EngineCtx {
    pub fn new(
        db: DatabaseConnection,
        broker: DynBroker,
        rate: Arc<RateLimiter>,
        clock: DynClock,
    ) -> Self {
        Self {
            db,
            broker,
            rate,
            clock,
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}
