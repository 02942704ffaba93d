use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Append-only structured event stream.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "event_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub batch_job_id: Option<i64>,
    pub batch_item_id: Option<i64>,
    /// DEBUG / INFO / WARN / ERROR.
    pub level: String,
    pub event_type: String,
    pub message: String,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
