//! Append-only rows: events, audit trail, scheduler runs and position
//! snapshots.

use daybatch_core::EventLevel;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};

use crate::entity::{audit_log, event_log, position_snapshot, scheduler_run};
use crate::error::StoreResult;

pub struct EventRepo;

impl EventRepo {
    pub async fn append(
        db: &DatabaseConnection,
        batch_job_id: Option<i64>,
        batch_item_id: Option<i64>,
        level: EventLevel,
        event_type: &str,
        message: &str,
        now_ms: i64,
    ) -> StoreResult<()> {
        event_log::ActiveModel {
            batch_job_id: Set(batch_job_id),
            batch_item_id: Set(batch_item_id),
            level: Set(level.as_str().to_string()),
            event_type: Set(event_type.to_string()),
            message: Set(message.to_string()),
            created_at: Set(now_ms),
            ..Default::default()
        }
        .insert(db)
        .await?;
        Ok(())
    }

    pub async fn for_job(
        db: &DatabaseConnection,
        batch_job_id: i64,
    ) -> StoreResult<Vec<event_log::Model>> {
        Ok(event_log::Entity::find()
            .filter(event_log::Column::BatchJobId.eq(batch_job_id))
            .order_by_asc(event_log::Column::Id)
            .all(db)
            .await?)
    }

    pub async fn by_type(
        db: &DatabaseConnection,
        event_type: &str,
    ) -> StoreResult<Vec<event_log::Model>> {
        Ok(event_log::Entity::find()
            .filter(event_log::Column::EventType.eq(event_type))
            .order_by_asc(event_log::Column::Id)
            .all(db)
            .await?)
    }
}

pub struct AuditRepo;

impl AuditRepo {
    pub async fn append(
        db: &DatabaseConnection,
        actor: &str,
        action: &str,
        batch_job_id: Option<i64>,
        batch_item_id: Option<i64>,
        reason: &str,
        now_ms: i64,
    ) -> StoreResult<()> {
        audit_log::ActiveModel {
            actor: Set(actor.to_string()),
            action: Set(action.to_string()),
            batch_job_id: Set(batch_job_id),
            batch_item_id: Set(batch_item_id),
            reason: Set(reason.to_string()),
            created_at: Set(now_ms),
            ..Default::default()
        }
        .insert(db)
        .await?;
        Ok(())
    }

    pub async fn recent(
        db: &DatabaseConnection,
        limit: u64,
    ) -> StoreResult<Vec<audit_log::Model>> {
        Ok(audit_log::Entity::find()
            .order_by_desc(audit_log::Column::Id)
            .limit(limit)
            .all(db)
            .await?)
    }
}

pub struct SchedulerRunRepo;

impl SchedulerRunRepo {
    pub async fn record(
        db: &DatabaseConnection,
        run_at: i64,
        triggered: i32,
        missed: i32,
        outcome: &str,
    ) -> StoreResult<()> {
        scheduler_run::ActiveModel {
            run_at: Set(run_at),
            triggered: Set(triggered),
            missed: Set(missed),
            outcome: Set(outcome.to_string()),
            ..Default::default()
        }
        .insert(db)
        .await?;
        Ok(())
    }

    pub async fn recent(
        db: &DatabaseConnection,
        limit: u64,
    ) -> StoreResult<Vec<scheduler_run::Model>> {
        Ok(scheduler_run::Entity::find()
            .order_by_desc(scheduler_run::Column::Id)
            .limit(limit)
            .all(db)
            .await?)
    }
}

pub struct SnapshotRepo;

impl SnapshotRepo {
    /// Persist one position observation per row, for audit.
    pub async fn record(
        db: &DatabaseConnection,
        positions: &[(String, String, String, i64)],
        taken_at: i64,
    ) -> StoreResult<()> {
        for (symbol, side, hold_id, leaves_qty) in positions {
            position_snapshot::ActiveModel {
                symbol: Set(symbol.clone()),
                side: Set(side.clone()),
                hold_id: Set(hold_id.clone()),
                leaves_qty: Set(*leaves_qty),
                taken_at: Set(taken_at),
                ..Default::default()
            }
            .insert(db)
            .await?;
        }
        Ok(())
    }

    pub async fn recent(
        db: &DatabaseConnection,
        limit: u64,
    ) -> StoreResult<Vec<position_snapshot::Model>> {
        Ok(position_snapshot::Entity::find()
            .order_by_desc(position_snapshot::Column::Id)
            .limit(limit)
            .all(db)
            .await?)
    }
}
