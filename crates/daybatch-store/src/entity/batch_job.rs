use daybatch_core::{BatchStatus, CoreError, RunMode};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "batch_jobs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Operator-facing identifier, unique per batch.
    pub batch_code: String,
    pub name: String,
    /// Short code, see `BatchStatus`.
    pub status: String,
    /// `immediate` or `scheduled`.
    pub run_mode: String,
    /// Epoch ms; set iff `run_mode = scheduled`.
    pub scheduled_at: Option<i64>,
    /// Exchange-local "HH:MM" wall clock for the forced close.
    pub eod_close_time: String,
    pub eod_force_close: bool,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Model {
    pub fn batch_status(&self) -> Result<BatchStatus, CoreError> {
        self.status.parse()
    }

    pub fn batch_run_mode(&self) -> Result<RunMode, CoreError> {
        self.run_mode.parse()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
