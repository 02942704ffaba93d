//! Order rows and fill observations.
//!
//! `apply_poll` is the single write path for broker-reported progress:
//! one transaction per order covering the fill row and the guarded
//! read-modify-write on the order itself.

use daybatch_core::{ClientOrderRef, OrderKind, OrderRole, OrderSide, OrderStatus, Price};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use tracing::warn;

use crate::entity::{fill, order};
use crate::error::{StoreError, StoreResult};

/// Inputs for recording an accepted submit.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub batch_item_id: i64,
    pub role: OrderRole,
    pub broker_order_id: String,
    pub client_ref: Option<ClientOrderRef>,
    pub side: OrderSide,
    pub qty: i64,
    pub kind: OrderKind,
    pub price: Option<Price>,
    pub trigger_price: Option<Price>,
}

/// Broker-reported aggregate for one order at poll time.
#[derive(Debug, Clone)]
pub struct PollUpdate {
    pub status: OrderStatus,
    pub cum_qty: i64,
    pub avg_price: Option<Price>,
    pub raw_json: Option<String>,
}

/// What a poll application did.
#[derive(Debug)]
pub enum PollOutcome {
    /// Broker id not in the store (orphan candidate).
    Unknown,
    /// Nothing new, or the row is already terminal.
    Unchanged,
    /// Lost the optimistic-version race; re-read and retry.
    Stale,
    /// Progress recorded.
    Applied {
        order: order::Model,
        prev_status: OrderStatus,
        new_status: OrderStatus,
        fill_delta: i64,
        fill_price: Option<Price>,
    },
}

pub struct OrderRepo;

impl OrderRepo {
    /// Record an accepted submit. A duplicate broker id fails on the
    /// unique index and is surfaced as its own error.
    pub async fn insert(
        db: &DatabaseConnection,
        new: NewOrder,
        now_ms: i64,
    ) -> StoreResult<order::Model> {
        let result = order::ActiveModel {
            batch_item_id: Set(new.batch_item_id),
            role: Set(new.role.as_str().to_string()),
            broker_order_id: Set(new.broker_order_id.clone()),
            client_ref: Set(new.client_ref.map(|r| r.as_str().to_string())),
            side: Set(new.side.as_str().to_string()),
            qty: Set(new.qty),
            order_type: Set(new.kind.as_str().to_string()),
            price: Set(new.price.map(|p| p.to_f64())),
            trigger_price: Set(new.trigger_price.map(|p| p.to_f64())),
            status: Set(OrderStatus::New.as_str().to_string()),
            cum_qty: Set(0),
            avg_price: Set(None),
            version: Set(0),
            submitted_at: Set(now_ms),
            last_poll_at: Set(None),
            raw_json: Set(None),
            created_at: Set(now_ms),
            updated_at: Set(now_ms),
            ..Default::default()
        }
        .insert(db)
        .await;

        match result {
            Ok(model) => Ok(model),
            Err(e) if e.to_string().contains("UNIQUE") => {
                Err(StoreError::DuplicateBrokerOrderId(new.broker_order_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_by_broker_id(
        db: &DatabaseConnection,
        broker_order_id: &str,
    ) -> StoreResult<Option<order::Model>> {
        Ok(order::Entity::find()
            .filter(order::Column::BrokerOrderId.eq(broker_order_id))
            .one(db)
            .await?)
    }

    pub async fn orders_for_item(
        db: &DatabaseConnection,
        batch_item_id: i64,
    ) -> StoreResult<Vec<order::Model>> {
        Ok(order::Entity::find()
            .filter(order::Column::BatchItemId.eq(batch_item_id))
            .order_by_asc(order::Column::Id)
            .all(db)
            .await?)
    }

    /// Orders the watcher still needs progress on.
    pub async fn open_orders(db: &DatabaseConnection) -> StoreResult<Vec<order::Model>> {
        let active: Vec<&str> = [OrderStatus::New, OrderStatus::Working, OrderStatus::Partial]
            .iter()
            .map(|s| s.as_str())
            .collect();
        Ok(order::Entity::find()
            .filter(order::Column::Status.is_in(active))
            .order_by_asc(order::Column::Id)
            .all(db)
            .await?)
    }

    /// All broker ids the store knows, for orphan detection.
    pub async fn known_broker_ids(db: &DatabaseConnection) -> StoreResult<Vec<String>> {
        Ok(order::Entity::find()
            .all(db)
            .await?
            .into_iter()
            .map(|o| o.broker_order_id)
            .collect())
    }

    /// Apply one broker snapshot to one order in a single transaction:
    /// fill-delta row plus the guarded status/aggregate update. Replaying
    /// the same snapshot is a no-op.
    pub async fn apply_poll(
        db: &DatabaseConnection,
        broker_order_id: &str,
        update: PollUpdate,
        now_ms: i64,
    ) -> StoreResult<PollOutcome> {
        let txn = db.begin().await?;

        let Some(current) = order::Entity::find()
            .filter(order::Column::BrokerOrderId.eq(broker_order_id))
            .one(&txn)
            .await?
        else {
            txn.rollback().await?;
            return Ok(PollOutcome::Unknown);
        };

        let prev_status = current.order_status()?;
        if prev_status.is_terminal() {
            txn.rollback().await?;
            return Ok(PollOutcome::Unchanged);
        }

        let fill_delta = update.cum_qty - current.cum_qty;
        if fill_delta < 0 {
            warn!(
                broker_order_id,
                prior = current.cum_qty,
                reported = update.cum_qty,
                "Broker cum_qty went backwards; ignoring snapshot"
            );
            txn.rollback().await?;
            return Ok(PollOutcome::Unchanged);
        }

        if fill_delta == 0 && update.status == prev_status {
            txn.rollback().await?;
            // Not a state change; just remember the poll time.
            order::Entity::update_many()
                .col_expr(order::Column::LastPollAt, Expr::value(now_ms))
                .filter(order::Column::Id.eq(current.id))
                .exec(db)
                .await?;
            return Ok(PollOutcome::Unchanged);
        }

        // Fills for an order are applied in broker-reported order; when
        // the broker only surfaces aggregates, the synthetic fill price is
        // the one that satisfies the running weighted average.
        let mut fill_price = None;
        if fill_delta > 0 {
            let price = match update.avg_price {
                Some(new_avg) => Price::solve_fill_price(
                    current.cum_qty,
                    current.avg().unwrap_or(Price::ZERO),
                    update.cum_qty,
                    new_avg,
                )
                .unwrap_or(new_avg),
                None => current.avg().unwrap_or(Price::ZERO),
            };
            fill::ActiveModel {
                order_id: Set(current.id),
                qty: Set(fill_delta),
                price: Set(price.to_f64()),
                filled_at: Set(now_ms),
                created_at: Set(now_ms),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
            fill_price = Some(price);
        }

        let new_avg_price = update
            .avg_price
            .map(|p| p.to_f64())
            .or(current.avg_price);
        let res = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(update.status.as_str()))
            .col_expr(order::Column::CumQty, Expr::value(update.cum_qty))
            .col_expr(order::Column::AvgPrice, Expr::value(new_avg_price))
            .col_expr(order::Column::Version, Expr::value(current.version + 1))
            .col_expr(order::Column::LastPollAt, Expr::value(now_ms))
            .col_expr(order::Column::RawJson, Expr::value(update.raw_json.clone()))
            .col_expr(order::Column::UpdatedAt, Expr::value(now_ms))
            .filter(order::Column::Id.eq(current.id))
            .filter(order::Column::Version.eq(current.version))
            .exec(&txn)
            .await?;

        if res.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(PollOutcome::Stale);
        }
        txn.commit().await?;

        let mut applied = current.clone();
        applied.status = update.status.as_str().to_string();
        applied.cum_qty = update.cum_qty;
        applied.avg_price = new_avg_price;
        applied.version = current.version + 1;
        applied.last_poll_at = Some(now_ms);

        Ok(PollOutcome::Applied {
            order: applied,
            prev_status,
            new_status: update.status,
            fill_delta,
            fill_price,
        })
    }

    pub async fn fills_for_order(
        db: &DatabaseConnection,
        order_id: i64,
    ) -> StoreResult<Vec<fill::Model>> {
        Ok(fill::Entity::find()
            .filter(fill::Column::OrderId.eq(order_id))
            .order_by_asc(fill::Column::Id)
            .all(db)
            .await?)
    }
}
