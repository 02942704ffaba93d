//! Batch job lifecycle: creation, scheduler claims, pause/resume and
//! finalization.

use daybatch_core::{BatchStatus, EntryType, ItemState, OrderSide, Price, Product, RunMode};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    Set, TransactionTrait,
};

use crate::entity::{batch_item, batch_job};
use crate::error::{StoreError, StoreResult};

/// Operator input for a new batch.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub batch_code: String,
    pub name: String,
    pub run_mode: RunMode,
    /// Epoch ms; required iff `run_mode` is `Scheduled`.
    pub scheduled_at: Option<i64>,
    pub eod_close_time: String,
    pub eod_force_close: bool,
}

/// Operator input for one per-symbol plan.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub symbol: String,
    pub exchange: i32,
    pub product: Product,
    pub side: OrderSide,
    pub qty: i64,
    pub entry_type: EntryType,
    pub entry_price: Option<Price>,
    pub tp_price: Price,
    pub sl_trigger_price: Price,
}

pub struct BatchRepo;

impl BatchRepo {
    /// Insert the batch and its items in one transaction. Items start
    /// `READY`, the batch starts `SCHEDULED` regardless of run mode (the
    /// scheduler picks immediate batches up on its next tick).
    pub async fn create(
        db: &DatabaseConnection,
        batch: NewBatch,
        items: Vec<NewItem>,
        now_ms: i64,
    ) -> StoreResult<batch_job::Model> {
        let txn = db.begin().await?;

        let job = batch_job::ActiveModel {
            batch_code: Set(batch.batch_code),
            name: Set(batch.name),
            status: Set(BatchStatus::Scheduled.as_str().to_string()),
            run_mode: Set(batch.run_mode.as_str().to_string()),
            scheduled_at: Set(batch.scheduled_at),
            eod_close_time: Set(batch.eod_close_time),
            eod_force_close: Set(batch.eod_force_close),
            started_at: Set(None),
            finished_at: Set(None),
            last_error: Set(None),
            created_at: Set(now_ms),
            updated_at: Set(now_ms),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        for item in items {
            batch_item::ActiveModel {
                batch_job_id: Set(job.id),
                symbol: Set(item.symbol),
                exchange: Set(item.exchange),
                product: Set(item.product.as_str().to_string()),
                side: Set(item.side.as_str().to_string()),
                qty: Set(item.qty),
                entry_type: Set(item.entry_type.as_str().to_string()),
                entry_price: Set(item.entry_price.map(|p| p.to_f64())),
                tp_price: Set(item.tp_price.to_f64()),
                sl_trigger_price: Set(item.sl_trigger_price.to_f64()),
                status: Set(ItemState::Ready.as_str().to_string()),
                filled_qty: Set(0),
                avg_fill_price: Set(None),
                closed_qty: Set(0),
                entry_order_id: Set(None),
                hold_id: Set(None),
                close_outcome: Set(None),
                last_error: Set(None),
                version: Set(0),
                created_at: Set(now_ms),
                updated_at: Set(now_ms),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;
        Ok(job)
    }

    pub async fn find(
        db: &DatabaseConnection,
        id: i64,
    ) -> StoreResult<Option<batch_job::Model>> {
        Ok(batch_job::Entity::find_by_id(id).one(db).await?)
    }

    pub async fn find_by_code(
        db: &DatabaseConnection,
        code: &str,
    ) -> StoreResult<Option<batch_job::Model>> {
        Ok(batch_job::Entity::find()
            .filter(batch_job::Column::BatchCode.eq(code))
            .one(db)
            .await?)
    }

    /// Scheduler scan: `SCHEDULED` batches that are immediate or whose
    /// `scheduled_at` has passed.
    pub async fn due(db: &DatabaseConnection, now_ms: i64) -> StoreResult<Vec<batch_job::Model>> {
        Ok(batch_job::Entity::find()
            .filter(batch_job::Column::Status.eq(BatchStatus::Scheduled.as_str()))
            .filter(
                batch_job::Column::RunMode
                    .eq(RunMode::Immediate.as_str())
                    .or(batch_job::Column::ScheduledAt.lte(now_ms)),
            )
            .order_by_asc(batch_job::Column::Id)
            .all(db)
            .await?)
    }

    /// Conditional claim keyed on `(id, status = SCHEDULED)`. Losing
    /// claimers observe `false` and skip.
    pub async fn claim_running(
        db: &DatabaseConnection,
        id: i64,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let res = batch_job::Entity::update_many()
            .col_expr(
                batch_job::Column::Status,
                Expr::value(BatchStatus::Running.as_str()),
            )
            .col_expr(batch_job::Column::StartedAt, Expr::value(now_ms))
            .col_expr(batch_job::Column::UpdatedAt, Expr::value(now_ms))
            .filter(batch_job::Column::Id.eq(id))
            .filter(batch_job::Column::Status.eq(BatchStatus::Scheduled.as_str()))
            .exec(db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    /// A scheduled batch whose fire time fell outside the grace window
    /// goes to `ERROR` instead of firing late.
    pub async fn mark_missed(
        db: &DatabaseConnection,
        id: i64,
        reason: &str,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let res = batch_job::Entity::update_many()
            .col_expr(
                batch_job::Column::Status,
                Expr::value(BatchStatus::Error.as_str()),
            )
            .col_expr(batch_job::Column::LastError, Expr::value(reason))
            .col_expr(batch_job::Column::FinishedAt, Expr::value(now_ms))
            .col_expr(batch_job::Column::UpdatedAt, Expr::value(now_ms))
            .filter(batch_job::Column::Id.eq(id))
            .filter(batch_job::Column::Status.eq(BatchStatus::Scheduled.as_str()))
            .exec(db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    async fn conditional_status(
        db: &DatabaseConnection,
        id: i64,
        from: BatchStatus,
        to: BatchStatus,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let res = batch_job::Entity::update_many()
            .col_expr(batch_job::Column::Status, Expr::value(to.as_str()))
            .col_expr(batch_job::Column::UpdatedAt, Expr::value(now_ms))
            .filter(batch_job::Column::Id.eq(id))
            .filter(batch_job::Column::Status.eq(from.as_str()))
            .exec(db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    /// Move a not-yet-started batch's fire time.
    pub async fn reschedule(
        db: &DatabaseConnection,
        id: i64,
        scheduled_at: i64,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let res = batch_job::Entity::update_many()
            .col_expr(batch_job::Column::ScheduledAt, Expr::value(scheduled_at))
            .col_expr(
                batch_job::Column::RunMode,
                Expr::value(RunMode::Scheduled.as_str()),
            )
            .col_expr(batch_job::Column::UpdatedAt, Expr::value(now_ms))
            .filter(batch_job::Column::Id.eq(id))
            .filter(batch_job::Column::Status.eq(BatchStatus::Scheduled.as_str()))
            .exec(db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    pub async fn pause(db: &DatabaseConnection, id: i64, now_ms: i64) -> StoreResult<bool> {
        Self::conditional_status(db, id, BatchStatus::Running, BatchStatus::Paused, now_ms).await
    }

    pub async fn resume(db: &DatabaseConnection, id: i64, now_ms: i64) -> StoreResult<bool> {
        Self::conditional_status(db, id, BatchStatus::Paused, BatchStatus::Running, now_ms).await
    }

    /// Cancel a batch that has not started. Started batches are stopped
    /// through the panic-stop path, which flattens first.
    pub async fn cancel_scheduled(
        db: &DatabaseConnection,
        id: i64,
        now_ms: i64,
    ) -> StoreResult<bool> {
        Self::conditional_status(db, id, BatchStatus::Scheduled, BatchStatus::Cancelled, now_ms)
            .await
    }

    pub async fn running_or_paused(
        db: &DatabaseConnection,
    ) -> StoreResult<Vec<batch_job::Model>> {
        Ok(batch_job::Entity::find()
            .filter(
                batch_job::Column::Status
                    .eq(BatchStatus::Running.as_str())
                    .or(batch_job::Column::Status.eq(BatchStatus::Paused.as_str())),
            )
            .order_by_asc(batch_job::Column::Id)
            .all(db)
            .await?)
    }

    pub async fn running_ids(db: &DatabaseConnection) -> StoreResult<Vec<i64>> {
        Ok(batch_job::Entity::find()
            .filter(batch_job::Column::Status.eq(BatchStatus::Running.as_str()))
            .order_by_asc(batch_job::Column::Id)
            .all(db)
            .await?
            .into_iter()
            .map(|j| j.id)
            .collect())
    }

    /// Once every item is terminal, the batch becomes `DONE` (all closed)
    /// or `ERROR` (any item errored). Returns the new status when the
    /// sweep changed anything.
    pub async fn finalize_if_done(
        db: &DatabaseConnection,
        id: i64,
        now_ms: i64,
    ) -> StoreResult<Option<BatchStatus>> {
        let items = batch_item::Entity::find()
            .filter(batch_item::Column::BatchJobId.eq(id))
            .all(db)
            .await?;
        if items.is_empty() {
            return Ok(None);
        }

        let mut errors = 0usize;
        for item in &items {
            match item.state()? {
                ItemState::Error => errors += 1,
                ItemState::Closed => {}
                _ => return Ok(None),
            }
        }
        let target = if errors > 0 {
            BatchStatus::Error
        } else {
            BatchStatus::Done
        };

        let res = batch_job::Entity::update_many()
            .col_expr(batch_job::Column::Status, Expr::value(target.as_str()))
            .col_expr(batch_job::Column::FinishedAt, Expr::value(now_ms))
            .col_expr(batch_job::Column::UpdatedAt, Expr::value(now_ms))
            .filter(batch_job::Column::Id.eq(id))
            .filter(batch_job::Column::Status.eq(BatchStatus::Running.as_str()))
            .exec(db)
            .await?;
        Ok((res.rows_affected > 0).then_some(target))
    }

    /// Plan-field mutation guard: while the parent batch is `RUNNING` or
    /// `PAUSED`, qty/price/entry-type updates are refused.
    pub async fn update_item_plan(
        db: &DatabaseConnection,
        item_id: i64,
        qty: Option<i64>,
        entry_price: Option<Price>,
        tp_price: Option<Price>,
        sl_trigger_price: Option<Price>,
        now_ms: i64,
    ) -> StoreResult<()> {
        let item = batch_item::Entity::find_by_id(item_id)
            .one(db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("batch_item {item_id}")))?;
        let job = batch_job::Entity::find_by_id(item.batch_job_id)
            .one(db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("batch_job {}", item.batch_job_id)))?;

        if matches!(job.batch_status()?, BatchStatus::Running | BatchStatus::Paused) {
            return Err(StoreError::PlanLocked(item_id));
        }

        let mut update = batch_item::ActiveModel {
            id: Set(item_id),
            updated_at: Set(now_ms),
            ..Default::default()
        };
        if let Some(qty) = qty {
            update.qty = Set(qty);
        }
        if let Some(price) = entry_price {
            update.entry_price = Set(Some(price.to_f64()));
        }
        if let Some(price) = tp_price {
            update.tp_price = Set(price.to_f64());
        }
        if let Some(price) = sl_trigger_price {
            update.sl_trigger_price = Set(price.to_f64());
        }
        update.update(db).await?;
        Ok(())
    }
}
