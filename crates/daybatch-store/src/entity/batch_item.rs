use daybatch_core::{CoreError, EntryType, ItemState, OrderSide, Price, Product};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "batch_items")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub batch_job_id: i64,
    pub symbol: String,
    /// Market code as resolved at submit time.
    pub exchange: i32,
    /// `cash` or `margin`.
    pub product: String,
    /// `buy` or `sell`.
    pub side: String,
    /// Planned entry quantity.
    pub qty: i64,
    /// `market` or `limit`.
    pub entry_type: String,
    /// Set iff `entry_type = limit`.
    pub entry_price: Option<f64>,
    /// Absolute take-profit limit price.
    pub tp_price: f64,
    /// Absolute stop-loss trigger price.
    pub sl_trigger_price: f64,
    /// Short code, see `ItemState`.
    pub status: String,
    pub filled_qty: i64,
    /// Weighted average over the entry's fills.
    pub avg_fill_price: Option<f64>,
    /// Qty confirmed closed by OCO groups or the EOD order.
    pub closed_qty: i64,
    pub entry_order_id: Option<String>,
    /// Broker position handle for margin closes.
    pub hold_id: Option<String>,
    /// How the item ended, once `CLOSED`.
    pub close_outcome: Option<String>,
    pub last_error: Option<String>,
    /// Optimistic concurrency counter; bumped by every transition.
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Model {
    pub fn state(&self) -> Result<ItemState, CoreError> {
        self.status.parse()
    }

    pub fn order_side(&self) -> Result<OrderSide, CoreError> {
        self.side.parse()
    }

    pub fn item_product(&self) -> Result<Product, CoreError> {
        self.product.parse()
    }

    pub fn item_entry_type(&self) -> Result<EntryType, CoreError> {
        self.entry_type.parse()
    }

    pub fn tp(&self) -> Option<Price> {
        Price::from_f64(self.tp_price)
    }

    pub fn sl_trigger(&self) -> Option<Price> {
        Price::from_f64(self.sl_trigger_price)
    }

    pub fn avg_fill(&self) -> Option<Price> {
        self.avg_fill_price.and_then(Price::from_f64)
    }

    /// Filled qty not yet closed by a bracket or the EOD order.
    pub fn open_qty(&self) -> i64 {
        (self.filled_qty - self.closed_qty).max(0)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
