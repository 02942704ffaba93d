//! Broker trait for order execution and polling.
//!
//! Provides a trait-based abstraction over the brokerage endpoint so the
//! engine can be driven against a mock in tests and the REST client in
//! production.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{BrokerError, BrokerResult};
use crate::wire::{OrderAck, OrderPayload, OrderSnapshot, PositionWire};

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Typed request/response surface over the brokerage endpoint.
///
/// Implementations own authentication, retries and wire mapping; callers
/// are expected to hold the appropriate rate-limiter token before calling.
pub trait Broker: Send + Sync {
    /// Submit an order. The ack carries the broker order id and the
    /// market code that finally took the order.
    fn send_order(&self, payload: OrderPayload) -> BoxFuture<'_, BrokerResult<OrderAck>>;

    /// Cancel by broker order id.
    fn cancel_order<'a>(&'a self, broker_order_id: &'a str) -> BoxFuture<'a, BrokerResult<()>>;

    /// All orders visible in the current session scope.
    fn list_orders(&self) -> BoxFuture<'_, BrokerResult<Vec<OrderSnapshot>>>;

    /// Open positions (margin positions carry handles).
    fn list_positions(&self) -> BoxFuture<'_, BrokerResult<Vec<PositionWire>>>;

    /// Display name for a symbol, for pre-trade validation.
    fn symbol_name<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, BrokerResult<Option<String>>>;
}

/// Arc wrapper for broker trait objects.
pub type DynBroker = Arc<dyn Broker>;

/// Scriptable in-memory broker for tests.
///
/// Accepted orders are registered as working snapshots so a poll loop
/// sees them immediately; tests then drive fills and cancels through the
/// `set_order_*` helpers. Cancels against already-done orders come back
/// as `OrderNotFound`, mirroring the real endpoint.
#[derive(Default)]
pub struct MockBroker {
    sends: Mutex<Vec<OrderPayload>>,
    cancels: Mutex<Vec<String>>,
    acked_ids: Mutex<Vec<String>>,
    /// Scripted outcomes for upcoming sends: `None` accepts, `Some(err)`
    /// fails. An empty queue accepts everything.
    send_script: Mutex<Vec<Option<BrokerError>>>,
    cancel_errors: Mutex<Vec<BrokerError>>,
    orders: Mutex<HashMap<String, OrderSnapshot>>,
    positions: Mutex<Vec<PositionWire>>,
    symbol_names: Mutex<HashMap<String, String>>,
    next_id: AtomicU64,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1000),
            ..Default::default()
        }
    }

    /// Fail an upcoming `send_order` call with `err` (FIFO with
    /// `queue_send_ok`).
    pub fn queue_send_error(&self, err: BrokerError) {
        self.send_script.lock().push(Some(err));
    }

    /// Let an upcoming `send_order` call through; used to script "first
    /// leg accepted, second leg refused".
    pub fn queue_send_ok(&self) {
        self.send_script.lock().push(None);
    }

    /// Fail the next `cancel_order` call with `err`.
    pub fn queue_cancel_error(&self, err: BrokerError) {
        self.cancel_errors.lock().push(err);
    }

    /// Payloads received by `send_order`, in order.
    pub fn sent_payloads(&self) -> Vec<OrderPayload> {
        self.sends.lock().clone()
    }

    /// Broker order ids issued so far, in order.
    pub fn acked_ids(&self) -> Vec<String> {
        self.acked_ids.lock().clone()
    }

    /// Order ids passed to `cancel_order`, in order.
    pub fn cancelled_ids(&self) -> Vec<String> {
        self.cancels.lock().clone()
    }

    /// Overwrite raw snapshot fields for an order.
    pub fn set_order_state(&self, id: &str, state: i32, cum_qty: i64, avg_price: f64) {
        let mut orders = self.orders.lock();
        if let Some(snap) = orders.get_mut(id) {
            snap.state = state;
            snap.cum_qty = cum_qty;
            snap.price = rust_decimal::Decimal::try_from(avg_price).unwrap_or_default();
        }
    }

    /// Report an order fully processed with the given fill aggregate.
    pub fn fill_order(&self, id: &str, cum_qty: i64, avg_price: f64) {
        self.set_order_state(id, 5, cum_qty, avg_price);
    }

    /// Report a partial fill (order still live).
    pub fn partial_fill_order(&self, id: &str, cum_qty: i64, avg_price: f64) {
        self.set_order_state(id, 3, cum_qty, avg_price);
    }

    /// Report an order cancelled, keeping its current fill aggregate.
    pub fn cancel_order_now(&self, id: &str) {
        let mut orders = self.orders.lock();
        if let Some(snap) = orders.get_mut(id) {
            snap.state = 6;
        }
    }

    /// Register a snapshot that did not come from `send_order` (orphan).
    pub fn inject_order(&self, snapshot: OrderSnapshot) {
        self.orders.lock().insert(snapshot.id.clone(), snapshot);
    }

    pub fn set_positions(&self, positions: Vec<PositionWire>) {
        *self.positions.lock() = positions;
    }

    pub fn set_symbol_name(&self, symbol: &str, name: &str) {
        self.symbol_names
            .lock()
            .insert(symbol.to_string(), name.to_string());
    }

    fn register_accepted(&self, payload: &OrderPayload, id: &str) {
        let snapshot = OrderSnapshot {
            id: id.to_string(),
            state: 1,
            symbol: payload.symbol.clone(),
            side: payload.side.clone(),
            qty: payload.qty,
            cum_qty: 0,
            price: rust_decimal::Decimal::ZERO,
            recv_time: None,
            details: Vec::new(),
        };
        self.orders.lock().insert(id.to_string(), snapshot);
    }
}

impl Broker for MockBroker {
    fn send_order(&self, payload: OrderPayload) -> BoxFuture<'_, BrokerResult<OrderAck>> {
        Box::pin(async move {
            self.sends.lock().push(payload.clone());
            let scripted = {
                let mut script = self.send_script.lock();
                if script.is_empty() {
                    None
                } else {
                    script.remove(0)
                }
            };
            if let Some(err) = scripted {
                return Err(err);
            }
            let id = format!("M{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            self.acked_ids.lock().push(id.clone());
            self.register_accepted(&payload, &id);
            Ok(OrderAck {
                order_id: id,
                exchange: payload.exchange,
            })
        })
    }

    fn cancel_order<'a>(&'a self, broker_order_id: &'a str) -> BoxFuture<'a, BrokerResult<()>> {
        Box::pin(async move {
            self.cancels.lock().push(broker_order_id.to_string());
            if !self.cancel_errors.lock().is_empty() {
                return Err(self.cancel_errors.lock().remove(0));
            }
            let mut orders = self.orders.lock();
            match orders.get_mut(broker_order_id) {
                Some(snap) if snap.state >= 5 => {
                    Err(BrokerError::OrderNotFound(broker_order_id.to_string()))
                }
                Some(snap) => {
                    snap.state = 6;
                    Ok(())
                }
                None => Err(BrokerError::OrderNotFound(broker_order_id.to_string())),
            }
        })
    }

    fn list_orders(&self) -> BoxFuture<'_, BrokerResult<Vec<OrderSnapshot>>> {
        Box::pin(async move {
            let mut snapshots: Vec<OrderSnapshot> = self.orders.lock().values().cloned().collect();
            snapshots.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(snapshots)
        })
    }

    fn list_positions(&self) -> BoxFuture<'_, BrokerResult<Vec<PositionWire>>> {
        Box::pin(async move { Ok(self.positions.lock().clone()) })
    }

    fn symbol_name<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, BrokerResult<Option<String>>> {
        Box::pin(async move { Ok(self.symbol_names.lock().get(symbol).cloned()) })
    }
}
