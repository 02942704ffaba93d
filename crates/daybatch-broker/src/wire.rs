//! Wire payloads and responses for the brokerage REST endpoint.
//!
//! Field names and magic numbers follow the endpoint's JSON schema:
//! sides are "2" (buy) / "1" (sell), `FrontOrderType` is 10 (market),
//! 20 (limit) or 30 (stop), and margin closes cite position handles via
//! `ClosePositions`. Everything above this module works in domain types.

use daybatch_core::{EntryType, OrderSide, OrderStatus, Price, Product};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

const FRONT_ORDER_MARKET: i32 = 10;
const FRONT_ORDER_LIMIT: i32 = 20;
const FRONT_ORDER_STOP: i32 = 30;

/// `UnderOver` for the stop trigger: fire when price goes under.
const TRIGGER_UNDER: i32 = 1;
/// `UnderOver` for the stop trigger: fire when price goes over.
const TRIGGER_OVER: i32 = 2;

/// Position handle slice cited by a margin close order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosePosition {
    #[serde(rename = "HoldID")]
    pub hold_id: String,
    #[serde(rename = "Qty")]
    pub qty: i64,
}

/// Stop leg of a `FrontOrderType=30` order: market execution on trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseLimit {
    #[serde(rename = "TriggerSec")]
    pub trigger_sec: i32,
    #[serde(rename = "TriggerPrice")]
    pub trigger_price: Decimal,
    #[serde(rename = "UnderOver")]
    pub under_over: i32,
    #[serde(rename = "AfterHitOrderType")]
    pub after_hit_order_type: i32,
    #[serde(rename = "AfterHitPrice")]
    pub after_hit_price: Decimal,
}

/// `/sendorder` request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderPayload {
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "Exchange")]
    pub exchange: i32,
    #[serde(rename = "SecurityType")]
    pub security_type: i32,
    #[serde(rename = "Side")]
    pub side: String,
    #[serde(rename = "Qty")]
    pub qty: i64,
    #[serde(rename = "FrontOrderType")]
    pub front_order_type: i32,
    #[serde(rename = "Price")]
    pub price: Decimal,
    #[serde(rename = "ExpireDay")]
    pub expire_day: i32,
    #[serde(rename = "AccountType")]
    pub account_type: i32,
    #[serde(rename = "CashMargin")]
    pub cash_margin: i32,
    #[serde(rename = "DelivType", skip_serializing_if = "Option::is_none")]
    pub deliv_type: Option<i32>,
    #[serde(rename = "FundType", skip_serializing_if = "Option::is_none")]
    pub fund_type: Option<String>,
    #[serde(rename = "MarginTradeType", skip_serializing_if = "Option::is_none")]
    pub margin_trade_type: Option<i32>,
    #[serde(rename = "ClosePositions", skip_serializing_if = "Option::is_none")]
    pub close_positions: Option<Vec<ClosePosition>>,
    #[serde(rename = "ReverseLimitOrder", skip_serializing_if = "Option::is_none")]
    pub reverse_limit_order: Option<ReverseLimit>,
}

impl OrderPayload {
    fn base(symbol: &str, exchange: i32, side: OrderSide, qty: i64) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange,
            security_type: 1,
            side: side.wire_code().to_string(),
            qty,
            front_order_type: FRONT_ORDER_MARKET,
            price: Decimal::ZERO,
            expire_day: 0,
            account_type: 4,
            cash_margin: 0,
            deliv_type: None,
            fund_type: None,
            margin_trade_type: None,
            close_positions: None,
            reverse_limit_order: None,
        }
    }

    /// Loggable field subset: prices, quantities and routing flags, never
    /// credentials. Matches what goes into DEBUG payload events.
    pub fn masked_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "Symbol": self.symbol,
            "Exchange": self.exchange,
            "Side": self.side,
            "Qty": self.qty,
            "FrontOrderType": self.front_order_type,
            "Price": self.price,
            "CashMargin": self.cash_margin,
            "DelivType": self.deliv_type,
            "FundType": self.fund_type,
            "MarginTradeType": self.margin_trade_type,
            "TriggerPrice": self.reverse_limit_order.as_ref().map(|r| r.trigger_price),
            "ClosePositions": self.close_positions,
        })
    }
}

/// Inputs for composing an entry order.
#[derive(Debug, Clone)]
pub struct EntrySpec<'a> {
    pub symbol: &'a str,
    pub exchange: i32,
    pub product: Product,
    pub side: OrderSide,
    pub qty: i64,
    pub entry_type: EntryType,
    pub limit_price: Option<Price>,
}

/// Compose the `/sendorder` body for an entry.
pub fn entry_payload(spec: &EntrySpec<'_>) -> OrderPayload {
    let mut payload = OrderPayload::base(spec.symbol, spec.exchange, spec.side, spec.qty);
    match spec.entry_type {
        EntryType::Market => {
            payload.front_order_type = FRONT_ORDER_MARKET;
            payload.price = Decimal::ZERO;
        }
        EntryType::Limit => {
            payload.front_order_type = FRONT_ORDER_LIMIT;
            payload.price = spec.limit_price.unwrap_or(Price::ZERO).inner();
        }
    }
    match spec.product {
        Product::Cash => {
            payload.cash_margin = 1;
            payload.deliv_type = Some(2);
            payload.fund_type = Some("AA".to_string());
        }
        Product::Margin => {
            payload.cash_margin = 2;
            payload.margin_trade_type = Some(3);
            payload.deliv_type = Some(0);
        }
    }
    payload
}

/// Execution shape of a closing order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitKind {
    /// Take-profit: limit at the given price.
    TpLimit(Price),
    /// Stop-loss: stop with the given trigger, market on hit.
    SlStop(Price),
    /// Flatten at market (EOD / panic stop).
    Market,
}

/// Inputs for composing a closing order (TP, SL or EOD flatten).
#[derive(Debug, Clone)]
pub struct ExitSpec<'a> {
    pub symbol: &'a str,
    pub exchange: i32,
    pub product: Product,
    /// Side the position was opened on; the close order inverts it.
    pub entry_side: OrderSide,
    pub qty: i64,
    pub kind: ExitKind,
    /// Position handle slices for margin closes; empty for cash.
    pub holds: Vec<ClosePosition>,
}

/// Compose the `/sendorder` body for a closing order.
///
/// The close side is the inversion of the entry side regardless of TP vs
/// SL; the stop trigger direction follows the entry side (under for buy
/// entries, over for sell entries).
pub fn exit_payload(spec: &ExitSpec<'_>) -> crate::error::BrokerResult<OrderPayload> {
    let close_side = spec.entry_side.opposite();
    let mut payload = OrderPayload::base(spec.symbol, spec.exchange, close_side, spec.qty);

    match spec.product {
        Product::Cash => {
            payload.cash_margin = 1;
            payload.deliv_type = Some(2);
            if close_side == OrderSide::Buy {
                payload.fund_type = Some("AA".to_string());
            }
        }
        Product::Margin => {
            if spec.holds.is_empty() {
                return Err(crate::error::BrokerError::InvalidRequest(format!(
                    "margin close for {} without position handles",
                    spec.symbol
                )));
            }
            for hold in &spec.holds {
                if !is_valid_handle(&hold.hold_id) {
                    return Err(crate::error::BrokerError::InvalidRequest(format!(
                        "margin close for {} cites invalid handle {:?}",
                        spec.symbol, hold.hold_id
                    )));
                }
            }
            payload.cash_margin = 3;
            payload.margin_trade_type = Some(3);
            payload.deliv_type = Some(0);
            payload.close_positions = Some(spec.holds.clone());
        }
    }

    match spec.kind {
        ExitKind::Market => {
            payload.front_order_type = FRONT_ORDER_MARKET;
            payload.price = Decimal::ZERO;
        }
        ExitKind::TpLimit(price) => {
            payload.front_order_type = FRONT_ORDER_LIMIT;
            payload.price = price.inner();
        }
        ExitKind::SlStop(trigger) => {
            payload.front_order_type = FRONT_ORDER_STOP;
            payload.price = Decimal::ZERO;
            payload.reverse_limit_order = Some(ReverseLimit {
                trigger_sec: 1,
                trigger_price: trigger.inner(),
                under_over: match spec.entry_side {
                    OrderSide::Buy => TRIGGER_UNDER,
                    OrderSide::Sell => TRIGGER_OVER,
                },
                after_hit_order_type: 1,
                after_hit_price: Decimal::ZERO,
            });
        }
    }

    Ok(payload)
}

/// Broker-assigned position handles start with `E`.
pub fn is_valid_handle(handle: &str) -> bool {
    let trimmed = handle.trim();
    !trimmed.is_empty() && trimmed.starts_with('E')
}

/// `/sendorder` acknowledgement, with the market code that finally took
/// the order (the client may have fallen back to an alternate code).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: String,
    pub exchange: i32,
}

/// Raw `/sendorder` response body.
#[derive(Debug, Deserialize)]
pub(crate) struct SendOrderResponse {
    #[serde(rename = "OrderId", alias = "OrderID")]
    pub order_id: Option<String>,
}

/// One execution detail row inside an order snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderDetail {
    #[serde(rename = "RecPrice", default)]
    pub rec_price: Option<Decimal>,
    #[serde(rename = "ExecutionPrice", default)]
    pub execution_price: Option<Decimal>,
    #[serde(rename = "Price", default)]
    pub price: Option<Decimal>,
    #[serde(rename = "RecQty", default)]
    pub rec_qty: Option<i64>,
    #[serde(rename = "ExecutionQty", default)]
    pub execution_qty: Option<i64>,
    #[serde(rename = "Qty", default)]
    pub qty: Option<i64>,
}

impl OrderDetail {
    fn fill_price(&self) -> Option<Decimal> {
        [self.rec_price, self.execution_price, self.price]
            .into_iter()
            .flatten()
            .find(|p| p.is_sign_positive() && !p.is_zero())
    }

    fn fill_qty(&self) -> i64 {
        [self.rec_qty, self.execution_qty, self.qty]
            .into_iter()
            .flatten()
            .next()
            .unwrap_or(0)
    }
}

/// One order from `GET /orders`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderSnapshot {
    #[serde(rename = "ID", alias = "OrderId", default)]
    pub id: String,
    /// Raw state code: 1-2 working, 3-4 partially processed, 5 done,
    /// 6-7 cancelled.
    #[serde(rename = "State", default)]
    pub state: i32,
    #[serde(rename = "Symbol", default)]
    pub symbol: String,
    #[serde(rename = "Side", default)]
    pub side: String,
    #[serde(rename = "OrderQty", default)]
    pub qty: i64,
    #[serde(rename = "CumQty", default)]
    pub cum_qty: i64,
    #[serde(rename = "Price", default)]
    pub price: Decimal,
    #[serde(rename = "RecvTime", default)]
    pub recv_time: Option<String>,
    #[serde(rename = "Details", default)]
    pub details: Vec<OrderDetail>,
}

impl OrderSnapshot {
    /// Translate the raw state code.
    ///
    /// State 5 is "done" without distinguishing why; the fill counters
    /// decide: full cum is a fill, partial cum means the remainder was
    /// cancelled and the filled portion stands, zero cum means the order
    /// died unfilled.
    pub fn status(&self) -> OrderStatus {
        match self.state {
            1 | 2 => OrderStatus::Working,
            3 | 4 => {
                if self.cum_qty > 0 {
                    OrderStatus::Partial
                } else {
                    OrderStatus::Working
                }
            }
            5 => {
                if self.qty > 0 && self.cum_qty >= self.qty {
                    OrderStatus::Filled
                } else if self.cum_qty > 0 {
                    OrderStatus::Cancelled
                } else {
                    OrderStatus::Expired
                }
            }
            6 | 7 => OrderStatus::Cancelled,
            _ => OrderStatus::Working,
        }
    }

    /// Average fill price: the top-level `Price` when positive, otherwise
    /// the qty-weighted average over detail rows.
    pub fn avg_price(&self) -> Option<Price> {
        if self.price.is_sign_positive() && !self.price.is_zero() {
            return Some(Price::new(self.price));
        }

        let mut weighted: Vec<(i64, Price)> = Vec::new();
        let mut fallback = None;
        for detail in &self.details {
            let Some(price) = detail.fill_price() else {
                continue;
            };
            fallback = Some(price);
            let qty = detail.fill_qty();
            if qty > 0 {
                weighted.push((qty, Price::new(price)));
            }
        }

        Price::weighted_average(&weighted).or(fallback.map(Price::new))
    }
}

/// One position from `GET /positions`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PositionWire {
    #[serde(rename = "Symbol", default)]
    pub symbol: String,
    #[serde(rename = "Side", default)]
    pub side: String,
    #[serde(rename = "HoldID", alias = "HoldId", default)]
    pub hold_id: Option<String>,
    #[serde(rename = "ExecutionID", alias = "ExecutionId", default)]
    pub execution_id: Option<String>,
    #[serde(rename = "LeavesQty", default)]
    pub leaves_qty: i64,
    #[serde(rename = "Qty", default)]
    pub qty: i64,
    #[serde(rename = "Price", default)]
    pub price: Decimal,
}

impl PositionWire {
    /// The handle to cite when closing: `HoldID` first, `ExecutionID` as
    /// fallback when the broker omits it.
    pub fn handle(&self) -> Option<&str> {
        [self.hold_id.as_deref(), self.execution_id.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|h| !h.is_empty())
    }

    pub fn position_side(&self) -> Option<OrderSide> {
        OrderSide::from_wire_code(&self.side)
    }

    /// Open qty; some responses only carry `Qty`.
    pub fn remaining_qty(&self) -> i64 {
        if self.leaves_qty > 0 {
            self.leaves_qty
        } else {
            self.qty
        }
    }
}

/// `GET /symbol/{symbol}` response subset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SymbolInfo {
    #[serde(rename = "SymbolName", default)]
    pub symbol_name: Option<String>,
    #[serde(rename = "DisplayName", default)]
    pub display_name: Option<String>,
}

impl SymbolInfo {
    pub fn name(&self) -> Option<&str> {
        [self.symbol_name.as_deref(), self.display_name.as_deref()]
            .into_iter()
            .flatten()
            .find(|n| !n.is_empty())
    }
}

/// `/token` request body.
#[derive(Debug, Serialize)]
pub(crate) struct TokenRequest<'a> {
    #[serde(rename = "APIPassword")]
    pub api_password: &'a str,
}

/// `/token` response body.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(rename = "Token")]
    pub token: Option<String>,
}

/// Error body the endpoint returns on 4xx.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "Code", alias = "code", default)]
    pub code: Option<serde_json::Value>,
    #[serde(rename = "Message", alias = "message", default)]
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }

    pub fn code_string(&self) -> Option<String> {
        self.code.as_ref().map(|c| match c {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}
