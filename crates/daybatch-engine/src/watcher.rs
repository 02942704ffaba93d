//! Watcher: periodic reconciliation of broker orders and positions into
//! persistent fill state.
//!
//! Order progress flows through `OrderRepo::apply_poll` (one transaction
//! per order); entry progress then advances the parent item under its
//! version guard. Broker-side orders the store does not know are logged
//! loudly but never adopted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use daybatch_broker::{OrderSnapshot, PositionWire};
use daybatch_core::{
    CloseOutcome, EventLevel, ItemState, OrderRole, OrderStatus, Product,
};
use daybatch_store::entity::order;
use daybatch_store::{
    BatchRepo, EventRepo, ItemChanges, ItemRepo, OrderRepo, PollOutcome, PollUpdate, SnapshotRepo,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::EngineCtx;

pub struct Watcher {
    ctx: EngineCtx,
    orders_interval: Duration,
    positions_interval: Duration,
    /// Item ids with fresh fill state, consumed by the OCO manager.
    fill_tx: mpsc::Sender<i64>,
    /// Orphan broker ids already reported this process.
    warned_orphans: Mutex<HashSet<String>>,
    /// (symbol, handle) pairs already reported as unmatchable.
    warned_handles: Mutex<HashSet<(String, String)>>,
}

impl Watcher {
    pub fn new(
        ctx: EngineCtx,
        orders_interval: Duration,
        positions_interval: Duration,
        fill_tx: mpsc::Sender<i64>,
    ) -> Self {
        Self {
            ctx,
            orders_interval,
            positions_interval,
            fill_tx,
            warned_orphans: Mutex::new(HashSet::new()),
            warned_handles: Mutex::new(HashSet::new()),
        }
    }

    /// One orders poll: fetch, apply per-order updates, advance items,
    /// report orphans. Returns how many orders changed.
    pub async fn poll_orders_once(&self) -> EngineResult<usize> {
        self.ctx.rate.acquire_info().await;
        let snapshots = self.ctx.broker.list_orders().await?;
        let by_id: HashMap<&str, &OrderSnapshot> =
            snapshots.iter().map(|s| (s.id.as_str(), s)).collect();

        let mut applied = 0usize;
        for open in OrderRepo::open_orders(&self.ctx.db).await? {
            let Some(snap) = by_id.get(open.broker_order_id.as_str()) else {
                continue;
            };
            let update = PollUpdate {
                status: snap.status(),
                cum_qty: snap.cum_qty,
                avg_price: snap.avg_price(),
                raw_json: serde_json::to_string(snap).ok(),
            };
            let now = self.ctx.now_ms();
            match OrderRepo::apply_poll(&self.ctx.db, &open.broker_order_id, update, now).await? {
                PollOutcome::Applied {
                    order,
                    prev_status,
                    new_status,
                    fill_delta,
                    ..
                } => {
                    applied += 1;
                    debug!(
                        broker_order_id = %order.broker_order_id,
                        role = %order.role,
                        from = %prev_status,
                        to = %new_status,
                        fill_delta,
                        "Order progress applied"
                    );
                    if order.order_role()? == OrderRole::Entry {
                        self.apply_entry_progress(&order).await?;
                    }
                    // Hint the OCO manager; the durable scan is canonical,
                    // so a full queue is not an error.
                    let _ = self.fill_tx.try_send(order.batch_item_id);
                }
                PollOutcome::Stale => {
                    debug!(broker_order_id = %open.broker_order_id, "Poll lost a version race");
                }
                PollOutcome::Unknown | PollOutcome::Unchanged => {}
            }
        }

        self.report_orphans(&snapshots).await?;
        Ok(applied)
    }

    /// Propagate an entry order's aggregates to its item, retrying
    /// optimistic-version races.
    async fn apply_entry_progress(&self, entry: &order::Model) -> EngineResult<()> {
        let status = entry.order_status()?;
        loop {
            let item = ItemRepo::get(&self.ctx.db, entry.batch_item_id).await?;
            let state = item.state()?;
            if state.is_terminal() || state == ItemState::EodMarketSent {
                return Ok(());
            }

            let filled = entry.cum_qty;
            let mut changes = ItemChanges {
                filled_qty: (filled != item.filled_qty).then_some(filled),
                avg_fill_price: entry.avg_price,
                ..Default::default()
            };

            let target = match status {
                OrderStatus::Filled => match state {
                    ItemState::BracketSent => ItemState::BracketSent,
                    _ => ItemState::EntryFilled,
                },
                OrderStatus::Partial => match state {
                    ItemState::BracketSent | ItemState::EntryFilled => state,
                    _ => ItemState::EntryPartial,
                },
                OrderStatus::Cancelled | OrderStatus::Expired | OrderStatus::Rejected => {
                    if filled == 0 {
                        // Entry died before any fill: nothing to protect.
                        changes.close_outcome = Some(CloseOutcome::EntryCancelled);
                        ItemState::Closed
                    } else if state == ItemState::EntrySent {
                        // Remainder cancelled; the filled portion stands.
                        ItemState::EntryPartial
                    } else {
                        state
                    }
                }
                OrderStatus::New | OrderStatus::Working => {
                    if filled > 0 && state == ItemState::EntrySent {
                        ItemState::EntryPartial
                    } else {
                        state
                    }
                }
            };

            let filled_changed = filled != item.filled_qty;
            if target == state && !filled_changed {
                return Ok(());
            }

            let now = self.ctx.now_ms();
            if ItemRepo::transition(&self.ctx.db, &item, target, changes, now).await? {
                if target == ItemState::Closed {
                    info!(item = item.id, "Entry cancelled before fill, item closed");
                    EventRepo::append(
                        &self.ctx.db,
                        Some(item.batch_job_id),
                        Some(item.id),
                        EventLevel::Info,
                        "ENTRY_CANCELLED",
                        &format!("entry order {} ended unfilled", entry.broker_order_id),
                        now,
                    )
                    .await?;
                    BatchRepo::finalize_if_done(&self.ctx.db, item.batch_job_id, now).await?;
                } else if filled_changed {
                    info!(
                        item = item.id,
                        filled,
                        avg = ?entry.avg_price,
                        state = %target,
                        "Entry fill progress"
                    );
                    EventRepo::append(
                        &self.ctx.db,
                        Some(item.batch_job_id),
                        Some(item.id),
                        EventLevel::Info,
                        "ENTRY_FILL",
                        &format!("filled_qty={filled} avg={:?}", entry.avg_price),
                        now,
                    )
                    .await?;
                }
                return Ok(());
            }
        }
    }

    /// Broker-side orders unknown to the store: logged with the full
    /// payload, never adopted into the state machine.
    async fn report_orphans(&self, snapshots: &[OrderSnapshot]) -> EngineResult<()> {
        let known: HashSet<String> = OrderRepo::known_broker_ids(&self.ctx.db)
            .await?
            .into_iter()
            .collect();
        for snap in snapshots {
            if snap.id.is_empty() || known.contains(&snap.id) {
                continue;
            }
            if !self.warned_orphans.lock().insert(snap.id.clone()) {
                continue;
            }
            let payload = serde_json::to_string(snap).unwrap_or_else(|_| snap.id.clone());
            warn!(broker_order_id = %snap.id, "Broker order not found in store");
            EventRepo::append(
                &self.ctx.db,
                None,
                None,
                EventLevel::Warn,
                "ORPHAN_ORDER",
                &payload,
                self.ctx.now_ms(),
            )
            .await?;
        }
        Ok(())
    }

    /// One positions poll: snapshot for audit, then attach handles to
    /// margin items waiting on one.
    pub async fn poll_positions_once(&self) -> EngineResult<usize> {
        self.ctx.rate.acquire_info().await;
        let positions = self.ctx.broker.list_positions().await?;
        let now = self.ctx.now_ms();

        let rows: Vec<(String, String, String, i64)> = positions
            .iter()
            .filter_map(|p| {
                p.handle().map(|h| {
                    (
                        p.symbol.clone(),
                        p.side.clone(),
                        h.to_string(),
                        p.remaining_qty(),
                    )
                })
            })
            .collect();
        SnapshotRepo::record(&self.ctx.db, &rows, now).await?;

        let running = BatchRepo::running_ids(&self.ctx.db).await?;
        let candidates = ItemRepo::in_states(
            &self.ctx.db,
            &running,
            &[
                ItemState::EntryPartial,
                ItemState::EntryFilled,
                ItemState::BracketSent,
            ],
        )
        .await?;

        let mut attached = 0usize;
        for position in &positions {
            attached += self.match_handle(position, &candidates).await? as usize;
        }
        Ok(attached)
    }

    /// Attach a position handle to the unique margin item whose open qty
    /// and side match; ambiguity is reported and left alone.
    async fn match_handle(
        &self,
        position: &PositionWire,
        candidates: &[daybatch_store::entity::batch_item::Model],
    ) -> EngineResult<bool> {
        let symbol = position.symbol.trim();
        let Some(handle) = position.handle() else {
            return Ok(false);
        };
        let leaves = position.remaining_qty();
        if symbol.is_empty() || leaves <= 0 {
            return Ok(false);
        }

        let unassigned: Vec<_> = candidates
            .iter()
            .filter(|i| {
                i.symbol == symbol
                    && i.product == Product::Margin.as_str()
                    && i.hold_id.is_none()
            })
            .collect();
        if unassigned.is_empty() {
            return Ok(false);
        }

        if !daybatch_broker::wire::is_valid_handle(handle) {
            if self
                .warned_handles
                .lock()
                .insert((symbol.to_string(), handle.to_string()))
            {
                warn!(symbol, handle, "Position handle has unexpected shape");
                EventRepo::append(
                    &self.ctx.db,
                    None,
                    None,
                    EventLevel::Warn,
                    "INVALID_HOLD_ID",
                    &format!("symbol={symbol} hold_id={handle}"),
                    self.ctx.now_ms(),
                )
                .await?;
            }
            return Ok(false);
        }

        let side = position.position_side();
        let matched: Vec<_> = unassigned
            .iter()
            .filter(|i| {
                side.map_or(true, |s| i.side == s.as_str()) && i.open_qty() == leaves
            })
            .collect();

        if matched.len() != 1 {
            let key = (symbol.to_string(), handle.to_string());
            if self.warned_handles.lock().insert(key) {
                warn!(
                    symbol,
                    handle,
                    leaves,
                    matched = matched.len(),
                    "Position handle did not match exactly one item"
                );
                EventRepo::append(
                    &self.ctx.db,
                    None,
                    None,
                    EventLevel::Warn,
                    "HOLD_ID_MATCH_NOT_FOUND",
                    &format!(
                        "symbol={symbol} hold_id={handle} leaves_qty={leaves} matched={}",
                        matched.len()
                    ),
                    self.ctx.now_ms(),
                )
                .await?;
            }
            return Ok(false);
        }

        let item = matched[0];
        let now = self.ctx.now_ms();
        if ItemRepo::set_hold_id(&self.ctx.db, item.id, handle, now).await? {
            debug!(item = item.id, symbol, handle, "Position handle attached");
            EventRepo::append(
                &self.ctx.db,
                Some(item.batch_job_id),
                Some(item.id),
                EventLevel::Debug,
                "HOLD_ID_ASSIGNED",
                &format!("symbol={symbol} hold_id={handle} leaves_qty={leaves}"),
                now,
            )
            .await?;
            // The OCO manager may be waiting on this handle.
            let _ = self.fill_tx.try_send(item.id);
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut orders_ticker = tokio::time::interval(self.orders_interval);
        let mut positions_ticker = tokio::time::interval(self.positions_interval);
        orders_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        positions_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = orders_ticker.tick() => {
                    if let Err(e) = self.poll_orders_once().await {
                        warn!(error = %e, "Orders poll failed");
                    }
                }
                _ = positions_ticker.tick() => {
                    if let Err(e) = self.poll_positions_once().await {
                        warn!(error = %e, "Positions poll failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Watcher stopped");
                    break;
                }
            }
        }
    }
}
