//! Item state transitions under optimistic concurrency.
//!
//! Every transition is `UPDATE ... WHERE id=? AND status=? AND version=?`;
//! zero rows affected means the caller lost the race and must re-read.
//! Illegal transitions are refused before touching the database.

use daybatch_core::{CloseOutcome, ItemState};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};

use crate::entity::batch_item;
use crate::error::{StoreError, StoreResult};

/// Optional column writes that ride along with a transition.
#[derive(Debug, Default, Clone)]
pub struct ItemChanges {
    pub entry_order_id: Option<String>,
    pub exchange: Option<i32>,
    pub filled_qty: Option<i64>,
    pub avg_fill_price: Option<f64>,
    pub closed_qty: Option<i64>,
    pub hold_id: Option<String>,
    pub close_outcome: Option<CloseOutcome>,
    pub last_error: Option<String>,
    pub clear_error: bool,
}

impl ItemChanges {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            last_error: Some(message.into()),
            ..Default::default()
        }
    }
}

pub struct ItemRepo;

impl ItemRepo {
    pub async fn get(db: &DatabaseConnection, id: i64) -> StoreResult<batch_item::Model> {
        batch_item::Entity::find_by_id(id)
            .one(db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("batch_item {id}")))
    }

    pub async fn items_of(
        db: &DatabaseConnection,
        batch_job_id: i64,
    ) -> StoreResult<Vec<batch_item::Model>> {
        Ok(batch_item::Entity::find()
            .filter(batch_item::Column::BatchJobId.eq(batch_job_id))
            .order_by_asc(batch_item::Column::Id)
            .all(db)
            .await?)
    }

    /// Items awaiting entry submission, in stable submission order.
    pub async fn ready_items(
        db: &DatabaseConnection,
        batch_job_id: i64,
    ) -> StoreResult<Vec<batch_item::Model>> {
        Ok(batch_item::Entity::find()
            .filter(batch_item::Column::BatchJobId.eq(batch_job_id))
            .filter(batch_item::Column::Status.eq(ItemState::Ready.as_str()))
            .order_by_asc(batch_item::Column::Id)
            .all(db)
            .await?)
    }

    /// Items in the given states across the given batches (OCO and EOD
    /// scans).
    pub async fn in_states(
        db: &DatabaseConnection,
        batch_job_ids: &[i64],
        states: &[ItemState],
    ) -> StoreResult<Vec<batch_item::Model>> {
        if batch_job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let codes: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
        Ok(batch_item::Entity::find()
            .filter(batch_item::Column::BatchJobId.is_in(batch_job_ids.iter().copied()))
            .filter(batch_item::Column::Status.is_in(codes))
            .order_by_asc(batch_item::Column::Id)
            .all(db)
            .await?)
    }

    /// Guarded transition from the observed `item` snapshot to `to`.
    ///
    /// Returns `false` when another actor advanced the row first (the
    /// caller re-reads); errors when the transition itself is illegal.
    pub async fn transition(
        db: &DatabaseConnection,
        item: &batch_item::Model,
        to: ItemState,
        changes: ItemChanges,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let from = item.state()?;
        if !from.can_transition(to) {
            return Err(StoreError::IllegalTransition {
                item: item.id,
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        let mut update = batch_item::Entity::update_many()
            .col_expr(batch_item::Column::Status, Expr::value(to.as_str()))
            .col_expr(batch_item::Column::Version, Expr::value(item.version + 1))
            .col_expr(batch_item::Column::UpdatedAt, Expr::value(now_ms));

        if let Some(order_id) = changes.entry_order_id {
            update = update.col_expr(batch_item::Column::EntryOrderId, Expr::value(order_id));
        }
        if let Some(exchange) = changes.exchange {
            update = update.col_expr(batch_item::Column::Exchange, Expr::value(exchange));
        }
        if let Some(filled_qty) = changes.filled_qty {
            update = update.col_expr(batch_item::Column::FilledQty, Expr::value(filled_qty));
        }
        if let Some(avg) = changes.avg_fill_price {
            update = update.col_expr(batch_item::Column::AvgFillPrice, Expr::value(avg));
        }
        if let Some(closed_qty) = changes.closed_qty {
            update = update.col_expr(batch_item::Column::ClosedQty, Expr::value(closed_qty));
        }
        if let Some(hold_id) = changes.hold_id {
            update = update.col_expr(batch_item::Column::HoldId, Expr::value(hold_id));
        }
        if let Some(outcome) = changes.close_outcome {
            update = update.col_expr(
                batch_item::Column::CloseOutcome,
                Expr::value(outcome.as_str()),
            );
        }
        if let Some(message) = changes.last_error {
            update = update.col_expr(batch_item::Column::LastError, Expr::value(message));
        } else if changes.clear_error {
            update = update.col_expr(
                batch_item::Column::LastError,
                Expr::value(Option::<String>::None),
            );
        }

        let res = update
            .filter(batch_item::Column::Id.eq(item.id))
            .filter(batch_item::Column::Status.eq(from.as_str()))
            .filter(batch_item::Column::Version.eq(item.version))
            .exec(db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    /// `any non-terminal -> ERROR` with the reason recorded. Re-reads and
    /// retries on version races; a no-op when the item is already terminal.
    pub async fn mark_error(
        db: &DatabaseConnection,
        item_id: i64,
        reason: &str,
        now_ms: i64,
    ) -> StoreResult<bool> {
        loop {
            let item = Self::get(db, item_id).await?;
            if item.state()?.is_terminal() {
                return Ok(false);
            }
            if Self::transition(db, &item, ItemState::Error, ItemChanges::error(reason), now_ms)
                .await?
            {
                return Ok(true);
            }
        }
    }

    /// Attach a discovered position handle; only fills an empty slot so a
    /// later snapshot cannot clobber the handle the brackets cite.
    pub async fn set_hold_id(
        db: &DatabaseConnection,
        item_id: i64,
        hold_id: &str,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let res = batch_item::Entity::update_many()
            .col_expr(batch_item::Column::HoldId, Expr::value(hold_id))
            .col_expr(batch_item::Column::UpdatedAt, Expr::value(now_ms))
            .filter(batch_item::Column::Id.eq(item_id))
            .filter(batch_item::Column::HoldId.is_null())
            .exec(db)
            .await?;
        Ok(res.rows_affected > 0)
    }
}
