use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Point-in-time view of one broker position, kept for audit.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "position_snapshots")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub symbol: String,
    pub side: String,
    pub hold_id: String,
    pub leaves_qty: i64,
    pub taken_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
