//! Core domain types for the daybatch trading controller.
//!
//! This crate provides the types shared by every component:
//! - `Price`: precision-safe price newtype
//! - `OrderSide`, `Product`, `EntryType`, `OrderRole`, `OrderKind`: trading enums
//! - Batch / item / order / OCO state machines as closed sum types
//! - `Clock`: injectable time source with business-day awareness

pub mod clock;
pub mod decimal;
pub mod error;
pub mod order;
pub mod state;

pub use clock::{Clock, DynClock, ManualClock, SystemClock};
pub use decimal::Price;
pub use error::{CoreError, Result};
pub use order::{ClientOrderRef, EntryType, OrderKind, OrderRole, OrderSide, Product};
pub use state::{
    BatchStatus, CloseOutcome, EventLevel, ItemState, OcoMode, OcoStatus, OrderStatus, RunMode,
};
