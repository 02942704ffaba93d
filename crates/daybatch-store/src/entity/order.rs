use daybatch_core::{CoreError, OrderRole, OrderStatus, Price};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub batch_item_id: i64,
    /// `entry`, `tp`, `sl` or `eod`.
    pub role: String,
    /// Broker-assigned id; globally unique.
    pub broker_order_id: String,
    /// Intent reference written before the submit.
    pub client_ref: Option<String>,
    pub side: String,
    pub qty: i64,
    /// `market`, `limit` or `stop`.
    pub order_type: String,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    /// Short code, see `OrderStatus`.
    pub status: String,
    pub cum_qty: i64,
    pub avg_price: Option<f64>,
    /// Optimistic concurrency counter for poll updates.
    pub version: i64,
    pub submitted_at: i64,
    pub last_poll_at: Option<i64>,
    /// Last raw broker snapshot, for diagnosis.
    pub raw_json: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Model {
    pub fn order_status(&self) -> Result<OrderStatus, CoreError> {
        self.status.parse()
    }

    pub fn order_role(&self) -> Result<OrderRole, CoreError> {
        self.role.parse()
    }

    pub fn avg(&self) -> Option<Price> {
        self.avg_price.and_then(Price::from_f64)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
