//! Durable state for the daybatch controller.
//!
//! The store is the single writer to persistent state; every component
//! mutates batches, items, orders and OCO groups through the repositories
//! here. State transitions are conditional updates (status + optimistic
//! version column), so concurrent actors converge instead of clobbering
//! each other.

pub mod connection;
pub mod entity;
pub mod error;
pub mod repo;

pub use connection::establish_connection;
pub use error::{StoreError, StoreResult};
pub use repo::batch::{BatchRepo, NewBatch, NewItem};
pub use repo::item::{ItemChanges, ItemRepo};
pub use repo::log::{AuditRepo, EventRepo, SchedulerRunRepo, SnapshotRepo};
pub use repo::oco::OcoRepo;
pub use repo::order::{NewOrder, OrderRepo, PollOutcome, PollUpdate};
