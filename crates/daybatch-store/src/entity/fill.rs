use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Immutable fill observation; one row per observed `cum_qty` delta.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "fills")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// References `orders.id`.
    pub order_id: i64,
    pub qty: i64,
    pub price: f64,
    /// Broker fill time when surfaced, otherwise the poll time.
    pub filled_at: i64,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
