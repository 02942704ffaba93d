use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One scheduler tick: how many batches fired, how many were missed.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "scheduler_runs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub run_at: i64,
    pub triggered: i32,
    pub missed: i32,
    pub outcome: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
