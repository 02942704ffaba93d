//! Broker adapter for the local brokerage REST endpoint.
//!
//! This crate owns the entire wire mapping: payload composition, status
//! code translation, authentication and retry policy. The engine only
//! sees typed requests and responses through the [`Broker`] trait.

pub mod broker;
pub mod client;
pub mod error;
pub mod rate;
pub mod wire;

pub use broker::{Broker, BoxFuture, DynBroker, MockBroker};
pub use client::{RestBroker, RestBrokerConfig, RetryPolicy};
pub use error::{BrokerError, BrokerResult};
pub use rate::RateLimiter;
pub use wire::{
    entry_payload, exit_payload, ClosePosition, EntrySpec, ExitKind, ExitSpec, OrderAck,
    OrderDetail, OrderPayload, OrderSnapshot, PositionWire, ReverseLimit, SymbolInfo,
};
