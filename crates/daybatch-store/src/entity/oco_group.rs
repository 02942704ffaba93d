use daybatch_core::{CoreError, OcoStatus};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Bracket pair covering one filled slice of an item.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "oco_groups")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub batch_item_id: i64,
    /// Slice quantity this pair protects.
    pub qty: i64,
    /// Broker id of the take-profit leg; set when the group activates.
    pub tp_order_id: Option<String>,
    /// Broker id of the stop-loss leg; set when the group activates.
    pub sl_order_id: Option<String>,
    /// Position handle slices cited by margin closes, as JSON.
    pub hold_json: Option<String>,
    /// Short code, see `OcoStatus`.
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub closed_at: Option<i64>,
}

impl Model {
    pub fn group_status(&self) -> Result<OcoStatus, CoreError> {
        self.status.parse()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
