//! OCO group lifecycle.
//!
//! Groups are inserted `PREPARING` as the pre-submit intent row, become
//! `ACTIVE` once both broker ids are recorded, move to `TP_FILLED` /
//! `SL_FILLED` when a leg completes, and end `CLOSED`. Rows are never
//! deleted; an abandoned intent is closed in place.

use daybatch_core::OcoStatus;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};

use crate::entity::oco_group;
use crate::error::StoreResult;

pub struct OcoRepo;

impl OcoRepo {
    /// Intent row written before the first bracket submit.
    pub async fn create_preparing(
        db: &DatabaseConnection,
        batch_item_id: i64,
        qty: i64,
        hold_json: Option<String>,
        now_ms: i64,
    ) -> StoreResult<oco_group::Model> {
        Ok(oco_group::ActiveModel {
            batch_item_id: Set(batch_item_id),
            qty: Set(qty),
            tp_order_id: Set(None),
            sl_order_id: Set(None),
            hold_json: Set(hold_json),
            status: Set(OcoStatus::Preparing.as_str().to_string()),
            created_at: Set(now_ms),
            updated_at: Set(now_ms),
            closed_at: Set(None),
            ..Default::default()
        }
        .insert(db)
        .await?)
    }

    /// Both legs accepted: record their broker ids and activate.
    pub async fn activate(
        db: &DatabaseConnection,
        group_id: i64,
        tp_order_id: &str,
        sl_order_id: &str,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let res = oco_group::Entity::update_many()
            .col_expr(
                oco_group::Column::Status,
                Expr::value(OcoStatus::Active.as_str()),
            )
            .col_expr(oco_group::Column::TpOrderId, Expr::value(tp_order_id))
            .col_expr(oco_group::Column::SlOrderId, Expr::value(sl_order_id))
            .col_expr(oco_group::Column::UpdatedAt, Expr::value(now_ms))
            .filter(oco_group::Column::Id.eq(group_id))
            .filter(oco_group::Column::Status.eq(OcoStatus::Preparing.as_str()))
            .exec(db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    /// Bracket submission failed and was rolled back; the intent row is
    /// closed without ever activating.
    pub async fn abandon(
        db: &DatabaseConnection,
        group_id: i64,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let res = oco_group::Entity::update_many()
            .col_expr(
                oco_group::Column::Status,
                Expr::value(OcoStatus::Closed.as_str()),
            )
            .col_expr(oco_group::Column::ClosedAt, Expr::value(now_ms))
            .col_expr(oco_group::Column::UpdatedAt, Expr::value(now_ms))
            .filter(oco_group::Column::Id.eq(group_id))
            .filter(oco_group::Column::Status.eq(OcoStatus::Preparing.as_str()))
            .exec(db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    /// First completed leg wins: `ACTIVE -> TP_FILLED | SL_FILLED`.
    /// The conditional update makes the race detectable; a `false` return
    /// with a filled sibling is the overfill signal.
    pub async fn mark_leg_filled(
        db: &DatabaseConnection,
        group_id: i64,
        leg: OcoStatus,
        now_ms: i64,
    ) -> StoreResult<bool> {
        debug_assert!(matches!(leg, OcoStatus::TpFilled | OcoStatus::SlFilled));
        let res = oco_group::Entity::update_many()
            .col_expr(oco_group::Column::Status, Expr::value(leg.as_str()))
            .col_expr(oco_group::Column::UpdatedAt, Expr::value(now_ms))
            .filter(oco_group::Column::Id.eq(group_id))
            .filter(oco_group::Column::Status.eq(OcoStatus::Active.as_str()))
            .exec(db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    /// Sibling is terminal: the group is done.
    pub async fn close(db: &DatabaseConnection, group_id: i64, now_ms: i64) -> StoreResult<bool> {
        let half_done: Vec<&str> = [OcoStatus::TpFilled, OcoStatus::SlFilled, OcoStatus::Active]
            .iter()
            .map(|s| s.as_str())
            .collect();
        let res = oco_group::Entity::update_many()
            .col_expr(
                oco_group::Column::Status,
                Expr::value(OcoStatus::Closed.as_str()),
            )
            .col_expr(oco_group::Column::ClosedAt, Expr::value(now_ms))
            .col_expr(oco_group::Column::UpdatedAt, Expr::value(now_ms))
            .filter(oco_group::Column::Id.eq(group_id))
            .filter(oco_group::Column::Status.is_in(half_done))
            .exec(db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    pub async fn find(
        db: &DatabaseConnection,
        group_id: i64,
    ) -> StoreResult<Option<oco_group::Model>> {
        Ok(oco_group::Entity::find_by_id(group_id).one(db).await?)
    }

    pub async fn groups_for_item(
        db: &DatabaseConnection,
        batch_item_id: i64,
    ) -> StoreResult<Vec<oco_group::Model>> {
        Ok(oco_group::Entity::find()
            .filter(oco_group::Column::BatchItemId.eq(batch_item_id))
            .order_by_asc(oco_group::Column::Id)
            .all(db)
            .await?)
    }

    /// Intent rows from an interrupted run that must be reconciled
    /// against the broker before any new submit for the item.
    pub async fn preparing_groups(
        db: &DatabaseConnection,
    ) -> StoreResult<Vec<oco_group::Model>> {
        Ok(oco_group::Entity::find()
            .filter(oco_group::Column::Status.eq(OcoStatus::Preparing.as_str()))
            .order_by_asc(oco_group::Column::Id)
            .all(db)
            .await?)
    }

    /// Fill qty already covered by a group. Abandoned intents (closed
    /// without ever receiving broker ids) free their slice for the next
    /// attempt; every other group counts.
    pub async fn covered_qty(db: &DatabaseConnection, batch_item_id: i64) -> StoreResult<i64> {
        Ok(Self::groups_for_item(db, batch_item_id)
            .await?
            .iter()
            .filter(|g| !(g.status == OcoStatus::Closed.as_str() && g.tp_order_id.is_none()))
            .map(|g| g.qty)
            .sum())
    }
}
