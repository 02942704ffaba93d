//! OCO manager: bracket fan-out, mutual cancellation and completion.
//!
//! Triggered by fill hints from the watcher and by a periodic durable
//! scan; both paths converge on the same per-item handler, serialized by
//! an in-memory mutex keyed on item id. Every decision re-reads the
//! store, so hints can be lost or duplicated freely.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use daybatch_broker::{exit_payload, BrokerError, ClosePosition, ExitKind, ExitSpec};
use daybatch_core::{
    CloseOutcome, EventLevel, ItemState, OcoMode, OcoStatus, OrderKind, OrderRole, OrderSide,
    OrderStatus, Price, Product,
};
use daybatch_store::entity::{batch_item, oco_group, order};
use daybatch_store::{
    AuditRepo, BatchRepo, EventRepo, ItemChanges, ItemRepo, NewOrder, OcoRepo, OrderRepo,
    StoreError,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::EngineCtx;

/// TP and SL prices must sit on the profit/loss side of the fill average
/// for the entry side.
pub fn validate_bracket_prices(
    side: OrderSide,
    avg: Price,
    tp: Price,
    sl: Price,
) -> Result<(), String> {
    if !tp.is_positive() || !sl.is_positive() {
        return Err(format!("non-positive bracket prices: tp={tp} sl={sl}"));
    }
    let ok = match side {
        OrderSide::Buy => tp > avg && sl < avg,
        OrderSide::Sell => tp < avg && sl > avg,
    };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "bracket prices on wrong side of fill: side={side} avg={avg} tp={tp} sl={sl}"
        ))
    }
}

pub struct OcoManager {
    ctx: EngineCtx,
    mode: OcoMode,
    hold_wait_ms: i64,
    /// Per-item serialization: one OCO action in flight per item.
    locks: DashMap<i64, Arc<Mutex<()>>>,
    /// When an item first had to wait for a position handle.
    hold_wait_since: DashMap<i64, i64>,
    /// Items already warned about a pending fill price / handle.
    wait_warned: DashMap<i64, ()>,
    /// Sibling cancels sent this process (re-sent once after restart).
    cancels_sent: DashMap<i64, ()>,
}

impl OcoManager {
    pub fn new(ctx: EngineCtx, mode: OcoMode, hold_wait: Duration) -> Self {
        Self {
            ctx,
            mode,
            hold_wait_ms: hold_wait.as_millis() as i64,
            locks: DashMap::new(),
            hold_wait_since: DashMap::new(),
            wait_warned: DashMap::new(),
            cancels_sent: DashMap::new(),
        }
    }

    fn item_lock(&self, item_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .entry(item_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Startup reconciliation: a `PREPARING` intent row means the process
    /// died mid-bracket and a leg may or may not be live at the broker.
    /// The broker offers no client-id lookup, so the slice cannot be
    /// re-covered safely; the item is parked for the operator.
    pub async fn recover(&self) -> EngineResult<()> {
        for group in OcoRepo::preparing_groups(&self.ctx.db).await? {
            let now = self.ctx.now_ms();
            warn!(
                group = group.id,
                item = group.batch_item_id,
                "Unresolved bracket intent from a previous run"
            );
            OcoRepo::abandon(&self.ctx.db, group.id, now).await?;
            ItemRepo::mark_error(
                &self.ctx.db,
                group.batch_item_id,
                "BRACKET_INTENT_UNRESOLVED",
                now,
            )
            .await?;
            let item = ItemRepo::get(&self.ctx.db, group.batch_item_id).await?;
            EventRepo::append(
                &self.ctx.db,
                Some(item.batch_job_id),
                Some(item.id),
                EventLevel::Error,
                "BRACKET_INTENT_UNRESOLVED",
                &format!("group={} qty={}", group.id, group.qty),
                now,
            )
            .await?;
        }
        Ok(())
    }

    /// Durable trigger: walk every item that can need OCO work.
    pub async fn scan(&self) -> EngineResult<usize> {
        let running = BatchRepo::running_ids(&self.ctx.db).await?;
        let items = ItemRepo::in_states(
            &self.ctx.db,
            &running,
            &[
                ItemState::EntryPartial,
                ItemState::EntryFilled,
                ItemState::BracketSent,
            ],
        )
        .await?;
        let count = items.len();
        for item in items {
            if let Err(e) = self.handle_item(item.id).await {
                error!(item = item.id, error = %e, "OCO handling failed");
            }
        }
        Ok(count)
    }

    /// Process one item end to end: cover new fills, then progress its
    /// groups.
    pub async fn handle_item(&self, item_id: i64) -> EngineResult<()> {
        let lock = self.item_lock(item_id);
        let _guard = lock.lock().await;
        self.cover_fills(item_id).await?;
        self.progress_groups(item_id).await?;
        Ok(())
    }

    /// Emit a bracket pair for fill qty not yet covered by a group.
    async fn cover_fills(&self, item_id: i64) -> EngineResult<()> {
        let item = ItemRepo::get(&self.ctx.db, item_id).await?;
        let state = item.state()?;
        if !matches!(
            state,
            ItemState::EntryPartial | ItemState::EntryFilled | ItemState::BracketSent
        ) {
            return Ok(());
        }
        let Some(job) = BatchRepo::find(&self.ctx.db, item.batch_job_id).await? else {
            return Ok(());
        };
        if job.batch_status()? != daybatch_core::BatchStatus::Running {
            return Ok(());
        }

        let covered = OcoRepo::covered_qty(&self.ctx.db, item_id).await?;
        let qty = match self.mode {
            OcoMode::PerPartial => item.filled_qty - covered,
            OcoMode::PostComplete => {
                if state != ItemState::EntryFilled || covered > 0 {
                    return Ok(());
                }
                item.filled_qty
            }
        };
        if qty <= 0 {
            return Ok(());
        }

        let Some(avg) = item.avg_fill() else {
            // A filled entry without a usable average parks until the
            // price surfaces on a later poll.
            if self.wait_warned.insert(item_id, ()).is_none() {
                warn!(item = item_id, "Fill price pending, brackets deferred");
                EventRepo::append(
                    &self.ctx.db,
                    Some(item.batch_job_id),
                    Some(item_id),
                    EventLevel::Warn,
                    "OCO_WAIT_PRICE",
                    "fill average not yet available",
                    self.ctx.now_ms(),
                )
                .await?;
            }
            return Ok(());
        };

        let (tp, sl) = match (item.tp(), item.sl_trigger()) {
            (Some(tp), Some(sl)) => (tp, sl),
            _ => {
                return Err(EngineError::InternalInvariant(format!(
                    "item {item_id} missing bracket prices"
                )))
            }
        };
        let side = item.order_side()?;
        if let Err(reason) = validate_bracket_prices(side, avg, tp, sl) {
            let now = self.ctx.now_ms();
            ItemRepo::mark_error(&self.ctx.db, item_id, &reason, now).await?;
            EventRepo::append(
                &self.ctx.db,
                Some(item.batch_job_id),
                Some(item_id),
                EventLevel::Error,
                "OCO_PRICE_INVALID",
                &reason,
                now,
            )
            .await?;
            return Ok(());
        }

        let product = item.item_product()?;
        let holds = match product {
            Product::Cash => Vec::new(),
            Product::Margin => match item.hold_id.as_deref() {
                Some(handle) => vec![ClosePosition {
                    hold_id: handle.to_string(),
                    qty,
                }],
                None => {
                    let now = self.ctx.now_ms();
                    let since = *self.hold_wait_since.entry(item_id).or_insert(now);
                    if now - since >= self.hold_wait_ms {
                        self.hold_wait_since.remove(&item_id);
                        ItemRepo::mark_error(
                            &self.ctx.db,
                            item_id,
                            "POSITION_NOT_AVAILABLE",
                            now,
                        )
                        .await?;
                        EventRepo::append(
                            &self.ctx.db,
                            Some(item.batch_job_id),
                            Some(item_id),
                            EventLevel::Error,
                            "OCO_HOLD_TIMEOUT",
                            &format!("no position handle within {} ms", self.hold_wait_ms),
                            now,
                        )
                        .await?;
                        return Err(EngineError::PositionNotAvailable { item: item_id });
                    }
                    if self.wait_warned.insert(item_id, ()).is_none() {
                        EventRepo::append(
                            &self.ctx.db,
                            Some(item.batch_job_id),
                            Some(item_id),
                            EventLevel::Warn,
                            "OCO_WAIT_HOLD_ID",
                            "position handle not yet visible",
                            now,
                        )
                        .await?;
                    }
                    return Ok(());
                }
            },
        };
        self.hold_wait_since.remove(&item_id);
        self.wait_warned.remove(&item_id);

        self.submit_bracket_pair(&item, side, product, qty, avg, tp, sl, holds)
            .await
    }

    /// Intent row, TP submit, SL submit, rollback on a split outcome.
    #[allow(clippy::too_many_arguments)]
    async fn submit_bracket_pair(
        &self,
        item: &batch_item::Model,
        side: OrderSide,
        product: Product,
        qty: i64,
        avg: Price,
        tp: Price,
        sl: Price,
        holds: Vec<ClosePosition>,
    ) -> EngineResult<()> {
        let now = self.ctx.now_ms();
        let hold_json = (!holds.is_empty())
            .then(|| serde_json::to_string(&holds).unwrap_or_default());
        let group =
            OcoRepo::create_preparing(&self.ctx.db, item.id, qty, hold_json, now).await?;
        info!(
            item = item.id,
            group = group.id,
            qty,
            %avg,
            "Covering fill slice with a bracket pair"
        );

        let tp_spec = ExitSpec {
            symbol: &item.symbol,
            exchange: item.exchange,
            product,
            entry_side: side,
            qty,
            kind: ExitKind::TpLimit(tp),
            holds: holds.clone(),
        };
        let tp_payload = exit_payload(&tp_spec)?;
        EventRepo::append(
            &self.ctx.db,
            Some(item.batch_job_id),
            Some(item.id),
            EventLevel::Debug,
            "TP_PAYLOAD",
            &tp_payload.masked_summary().to_string(),
            now,
        )
        .await?;

        self.ctx.rate.acquire_order().await;
        let tp_ack = match self.ctx.broker.send_order(tp_payload).await {
            Ok(ack) => ack,
            Err(e) => {
                let now = self.ctx.now_ms();
                OcoRepo::abandon(&self.ctx.db, group.id, now).await?;
                if let BrokerError::Rejected { .. } = e {
                    // First leg refused: nothing live, no rollback needed.
                    let reason = format!("BRACKET_FIRST_LEG_REJECTED: {e}");
                    ItemRepo::mark_error(&self.ctx.db, item.id, &reason, now).await?;
                    EventRepo::append(
                        &self.ctx.db,
                        Some(item.batch_job_id),
                        Some(item.id),
                        EventLevel::Error,
                        "OCO_FAILED",
                        &reason,
                        now,
                    )
                    .await?;
                } else {
                    // Transient: the abandoned intent frees the slice for
                    // the next scan.
                    warn!(item = item.id, error = %e, "TP submit failed transiently");
                    EventRepo::append(
                        &self.ctx.db,
                        Some(item.batch_job_id),
                        Some(item.id),
                        EventLevel::Warn,
                        "OCO_RETRY",
                        &e.to_string(),
                        now,
                    )
                    .await?;
                }
                return Ok(());
            }
        };

        OrderRepo::insert(
            &self.ctx.db,
            NewOrder {
                batch_item_id: item.id,
                role: OrderRole::Tp,
                broker_order_id: tp_ack.order_id.clone(),
                client_ref: None,
                side: side.opposite(),
                qty,
                kind: OrderKind::Limit,
                price: Some(tp),
                trigger_price: None,
            },
            self.ctx.now_ms(),
        )
        .await
        .map_err(|e| match e {
            StoreError::DuplicateBrokerOrderId(id) => {
                EngineError::InternalInvariant(format!("duplicate TP broker id {id}"))
            }
            other => other.into(),
        })?;

        let sl_spec = ExitSpec {
            symbol: &item.symbol,
            exchange: item.exchange,
            product,
            entry_side: side,
            qty,
            kind: ExitKind::SlStop(sl),
            holds,
        };
        let sl_payload = exit_payload(&sl_spec)?;
        EventRepo::append(
            &self.ctx.db,
            Some(item.batch_job_id),
            Some(item.id),
            EventLevel::Debug,
            "SL_PAYLOAD",
            &sl_payload.masked_summary().to_string(),
            self.ctx.now_ms(),
        )
        .await?;

        self.ctx.rate.acquire_order().await;
        match self.ctx.broker.send_order(sl_payload).await {
            Ok(sl_ack) => {
                let now = self.ctx.now_ms();
                OrderRepo::insert(
                    &self.ctx.db,
                    NewOrder {
                        batch_item_id: item.id,
                        role: OrderRole::Sl,
                        broker_order_id: sl_ack.order_id.clone(),
                        client_ref: None,
                        side: side.opposite(),
                        qty,
                        kind: OrderKind::Stop,
                        price: None,
                        trigger_price: Some(sl),
                    },
                    now,
                )
                .await?;
                OcoRepo::activate(&self.ctx.db, group.id, &tp_ack.order_id, &sl_ack.order_id, now)
                    .await?;
                self.advance_to_bracket_sent(item.id).await?;
                info!(
                    item = item.id,
                    group = group.id,
                    tp = %tp_ack.order_id,
                    sl = %sl_ack.order_id,
                    "Bracket pair live"
                );
                EventRepo::append(
                    &self.ctx.db,
                    Some(item.batch_job_id),
                    Some(item.id),
                    EventLevel::Info,
                    "OCO_SENT",
                    &format!(
                        "group={} qty={qty} tp={} sl={}",
                        group.id, tp_ack.order_id, sl_ack.order_id
                    ),
                    now,
                )
                .await?;
                Ok(())
            }
            Err(sl_err) => {
                // Mandatory rollback: the accepted TP must not survive a
                // half-bracket.
                warn!(
                    item = item.id,
                    tp = %tp_ack.order_id,
                    error = %sl_err,
                    "SL leg failed, rolling back TP"
                );
                self.ctx.rate.acquire_order().await;
                let rollback = self.ctx.broker.cancel_order(&tp_ack.order_id).await;
                let now = self.ctx.now_ms();
                OcoRepo::abandon(&self.ctx.db, group.id, now).await?;
                match rollback {
                    Ok(()) | Err(BrokerError::OrderNotFound(_)) => {
                        let reason = format!("BRACKET_SECOND_LEG_REJECTED: {sl_err}");
                        ItemRepo::mark_error(&self.ctx.db, item.id, &reason, now).await?;
                        EventRepo::append(
                            &self.ctx.db,
                            Some(item.batch_job_id),
                            Some(item.id),
                            EventLevel::Error,
                            "BRACKET_ROLLED_BACK",
                            &format!("tp={} cancelled after SL failure: {sl_err}", tp_ack.order_id),
                            now,
                        )
                        .await?;
                        Ok(())
                    }
                    Err(cancel_err) => {
                        let reason = format!(
                            "BRACKET_ROLLBACK_FAILED: tp={} still live: {cancel_err}",
                            tp_ack.order_id
                        );
                        error!(item = item.id, %reason, "Rollback cancel failed; operator intervention required");
                        ItemRepo::mark_error(&self.ctx.db, item.id, &reason, now).await?;
                        EventRepo::append(
                            &self.ctx.db,
                            Some(item.batch_job_id),
                            Some(item.id),
                            EventLevel::Error,
                            "BRACKET_ROLLBACK_FAILED",
                            &reason,
                            now,
                        )
                        .await?;
                        Err(EngineError::BracketRollbackFailed {
                            item: item.id,
                            order: tp_ack.order_id,
                        })
                    }
                }
            }
        }
    }

    async fn advance_to_bracket_sent(&self, item_id: i64) -> EngineResult<()> {
        loop {
            let item = ItemRepo::get(&self.ctx.db, item_id).await?;
            let state = item.state()?;
            if !matches!(state, ItemState::EntryPartial | ItemState::EntryFilled) {
                return Ok(());
            }
            let changes = ItemChanges {
                clear_error: true,
                ..Default::default()
            };
            if ItemRepo::transition(
                &self.ctx.db,
                &item,
                ItemState::BracketSent,
                changes,
                self.ctx.now_ms(),
            )
            .await?
            {
                return Ok(());
            }
        }
    }

    /// Advance every group of the item, then check the item for
    /// completion.
    async fn progress_groups(&self, item_id: i64) -> EngineResult<()> {
        for group in OcoRepo::groups_for_item(&self.ctx.db, item_id).await? {
            let result = match group.group_status()? {
                OcoStatus::Active => self.check_active_group(&group).await,
                OcoStatus::TpFilled | OcoStatus::SlFilled => self.try_close_group(&group).await,
                OcoStatus::Preparing | OcoStatus::Closed => Ok(()),
            };
            if let Err(e) = result {
                error!(group = group.id, error = %e, "Group progression failed");
            }
        }
        self.try_complete_item(item_id).await
    }

    async fn leg_orders(
        &self,
        group: &oco_group::Model,
    ) -> EngineResult<(order::Model, order::Model)> {
        let tp_id = group.tp_order_id.as_deref().ok_or_else(|| {
            EngineError::InternalInvariant(format!("group {} active without TP id", group.id))
        })?;
        let sl_id = group.sl_order_id.as_deref().ok_or_else(|| {
            EngineError::InternalInvariant(format!("group {} active without SL id", group.id))
        })?;
        let tp = OrderRepo::find_by_broker_id(&self.ctx.db, tp_id)
            .await?
            .ok_or_else(|| {
                EngineError::InternalInvariant(format!("group {} TP order row missing", group.id))
            })?;
        let sl = OrderRepo::find_by_broker_id(&self.ctx.db, sl_id)
            .await?
            .ok_or_else(|| {
                EngineError::InternalInvariant(format!("group {} SL order row missing", group.id))
            })?;
        Ok((tp, sl))
    }

    async fn check_active_group(&self, group: &oco_group::Model) -> EngineResult<()> {
        let (tp, sl) = self.leg_orders(group).await?;
        let tp_filled = tp.order_status()? == OrderStatus::Filled;
        let sl_filled = sl.order_status()? == OrderStatus::Filled;

        if tp_filled && sl_filled {
            return self.handle_overfill(group).await;
        }

        let (winner, winner_leg, sibling) = if tp_filled {
            (OcoStatus::TpFilled, "TP_FILLED", sl)
        } else if sl_filled {
            (OcoStatus::SlFilled, "SL_FILLED", tp)
        } else {
            // Operator-cancelled brackets: both legs die without a fill
            // and the group ends with no winner.
            if tp.order_status()?.is_terminal() && sl.order_status()?.is_terminal() {
                let now = self.ctx.now_ms();
                if OcoRepo::close(&self.ctx.db, group.id, now).await? {
                    let item = ItemRepo::get(&self.ctx.db, group.batch_item_id).await?;
                    info!(group = group.id, item = item.id, "Group closed with both legs cancelled");
                    EventRepo::append(
                        &self.ctx.db,
                        Some(item.batch_job_id),
                        Some(item.id),
                        EventLevel::Info,
                        "OCO_CLOSED",
                        &format!("group={} both legs cancelled", group.id),
                        now,
                    )
                    .await?;
                }
            }
            return Ok(());
        };

        let now = self.ctx.now_ms();
        if OcoRepo::mark_leg_filled(&self.ctx.db, group.id, winner, now).await? {
            let item = ItemRepo::get(&self.ctx.db, group.batch_item_id).await?;
            info!(group = group.id, item = item.id, leg = winner_leg, "Bracket leg filled");
            EventRepo::append(
                &self.ctx.db,
                Some(item.batch_job_id),
                Some(item.id),
                EventLevel::Info,
                winner_leg,
                &format!("group={} sibling={}", group.id, sibling.broker_order_id),
                now,
            )
            .await?;
        }

        self.cancel_sibling(group.id, &sibling).await?;

        // Close immediately when the sibling is already terminal.
        let fresh = OcoRepo::find(&self.ctx.db, group.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("oco_group {}", group.id)))?;
        if matches!(fresh.group_status()?, OcoStatus::TpFilled | OcoStatus::SlFilled) {
            self.try_close_group(&fresh).await?;
        }
        Ok(())
    }

    /// Submit the sibling cancel once per process; `OrderNotFound` means
    /// the sibling already reached a terminal state and the next poll
    /// settles which one.
    async fn cancel_sibling(&self, group_id: i64, sibling: &order::Model) -> EngineResult<()> {
        if sibling.order_status()?.is_terminal() {
            return Ok(());
        }
        if self.cancels_sent.insert(group_id, ()).is_some() {
            return Ok(());
        }
        self.ctx.rate.acquire_order().await;
        match self.ctx.broker.cancel_order(&sibling.broker_order_id).await {
            Ok(()) => {
                debug!(group = group_id, sibling = %sibling.broker_order_id, "Sibling cancel submitted");
                Ok(())
            }
            Err(BrokerError::OrderNotFound(_)) => {
                debug!(
                    group = group_id,
                    sibling = %sibling.broker_order_id,
                    "Sibling already terminal at broker, awaiting poll"
                );
                Ok(())
            }
            Err(e) => {
                // Retry on the next scan.
                self.cancels_sent.remove(&group_id);
                warn!(group = group_id, error = %e, "Sibling cancel failed");
                Ok(())
            }
        }
    }

    async fn try_close_group(&self, group: &oco_group::Model) -> EngineResult<()> {
        let (tp, sl) = self.leg_orders(group).await?;
        let (winner, sibling) = match group.group_status()? {
            OcoStatus::TpFilled => (&tp, &sl),
            OcoStatus::SlFilled => (&sl, &tp),
            _ => return Ok(()),
        };

        // Mutual-cancel race: the sibling filled before the cancel landed.
        if sibling.order_status()? == OrderStatus::Filled {
            return self.handle_overfill(group).await;
        }

        if !sibling.order_status()?.is_terminal() {
            // Restart path: make sure a cancel is in flight.
            self.cancel_sibling(group.id, sibling).await?;
            return Ok(());
        }

        let now = self.ctx.now_ms();
        if OcoRepo::close(&self.ctx.db, group.id, now).await? {
            self.cancels_sent.remove(&group.id);
            let item = ItemRepo::get(&self.ctx.db, group.batch_item_id).await?;
            info!(
                group = group.id,
                item = item.id,
                winner = %winner.broker_order_id,
                "OCO group closed"
            );
            EventRepo::append(
                &self.ctx.db,
                Some(item.batch_job_id),
                Some(item.id),
                EventLevel::Info,
                "OCO_CLOSED",
                &format!(
                    "group={} winner={} sibling={}",
                    group.id, winner.broker_order_id, sibling.broker_order_id
                ),
                now,
            )
            .await?;
        }
        Ok(())
    }

    /// TP and SL both reported fills on one slice: no automatic re-hedge,
    /// the item is parked with a loud trail.
    async fn handle_overfill(&self, group: &oco_group::Model) -> EngineResult<()> {
        let now = self.ctx.now_ms();
        OcoRepo::close(&self.ctx.db, group.id, now).await?;
        let item = ItemRepo::get(&self.ctx.db, group.batch_item_id).await?;
        error!(
            group = group.id,
            item = item.id,
            "Both bracket legs filled on the same slice"
        );
        ItemRepo::mark_error(&self.ctx.db, item.id, "OVERFILL_DETECTED", now).await?;
        EventRepo::append(
            &self.ctx.db,
            Some(item.batch_job_id),
            Some(item.id),
            EventLevel::Error,
            "OVERFILL_DETECTED",
            &format!(
                "group={} tp={:?} sl={:?}",
                group.id, group.tp_order_id, group.sl_order_id
            ),
            now,
        )
        .await?;
        AuditRepo::append(
            &self.ctx.db,
            "system",
            "overfill_detected",
            Some(item.batch_job_id),
            Some(item.id),
            "TP and SL both filled before mutual cancel landed",
            now,
        )
        .await?;
        BatchRepo::finalize_if_done(&self.ctx.db, item.batch_job_id, now).await?;
        Err(EngineError::OverfillDetected { group: group.id })
    }

    /// Close the item once its closed groups account for the plan (or for
    /// everything the entry actually filled, when the entry ended short).
    async fn try_complete_item(&self, item_id: i64) -> EngineResult<()> {
        let item = ItemRepo::get(&self.ctx.db, item_id).await?;
        let state = item.state()?;
        if state != ItemState::BracketSent {
            return Ok(());
        }

        let groups = OcoRepo::groups_for_item(&self.ctx.db, item_id).await?;
        let activated: Vec<_> = groups
            .iter()
            .filter(|g| g.tp_order_id.is_some())
            .collect();
        if activated.is_empty() {
            return Ok(());
        }

        let mut closed_qty = 0i64;
        let mut tp_won = false;
        let mut sl_won = false;
        let mut all_closed = true;
        for group in &activated {
            if group.group_status()? != OcoStatus::Closed {
                all_closed = false;
                continue;
            }
            let (tp, sl) = self.leg_orders(group).await?;
            if tp.order_status()? == OrderStatus::Filled {
                tp_won = true;
                closed_qty += tp.cum_qty.min(group.qty);
            } else if sl.order_status()? == OrderStatus::Filled {
                sl_won = true;
                closed_qty += sl.cum_qty.min(group.qty);
            }
        }

        let entry_terminal = OrderRepo::orders_for_item(&self.ctx.db, item_id)
            .await?
            .iter()
            .find(|o| o.role == OrderRole::Entry.as_str())
            .map(|o| o.order_status().map(|s| s.is_terminal()))
            .transpose()?
            .unwrap_or(false);

        let fully_closed = closed_qty >= item.qty
            || (entry_terminal && all_closed && item.filled_qty > 0 && closed_qty >= item.filled_qty);
        if !(tp_won || sl_won) || !fully_closed {
            // Still persist progress so EOD residuals stay accurate.
            if closed_qty != item.closed_qty {
                let changes = ItemChanges {
                    closed_qty: Some(closed_qty),
                    ..Default::default()
                };
                let _ = ItemRepo::transition(
                    &self.ctx.db,
                    &item,
                    ItemState::BracketSent,
                    changes,
                    self.ctx.now_ms(),
                )
                .await?;
            }
            return Ok(());
        }

        let outcome = match (tp_won, sl_won) {
            (true, false) => CloseOutcome::TpFilled,
            (false, true) => CloseOutcome::SlFilled,
            _ => CloseOutcome::Mixed,
        };
        self.close_item(&item, outcome, closed_qty).await
    }

    /// `BRACKET_SENT -> TP_FILLED/SL_FILLED -> CLOSED` (or straight to
    /// `CLOSED` for a mixed outcome), with the substate recorded.
    async fn close_item(
        &self,
        item: &batch_item::Model,
        outcome: CloseOutcome,
        closed_qty: i64,
    ) -> EngineResult<()> {
        let now = self.ctx.now_ms();
        let via = match outcome {
            CloseOutcome::TpFilled => Some(ItemState::TpFilled),
            CloseOutcome::SlFilled => Some(ItemState::SlFilled),
            _ => None,
        };

        let mut current = item.clone();
        if let Some(mid) = via {
            if ItemRepo::transition(
                &self.ctx.db,
                &current,
                mid,
                ItemChanges {
                    closed_qty: Some(closed_qty),
                    ..Default::default()
                },
                now,
            )
            .await?
            {
                current = ItemRepo::get(&self.ctx.db, item.id).await?;
            } else {
                return Ok(());
            }
        }

        let changes = ItemChanges {
            closed_qty: Some(closed_qty),
            close_outcome: Some(outcome),
            clear_error: true,
            ..Default::default()
        };
        if ItemRepo::transition(&self.ctx.db, &current, ItemState::Closed, changes, now).await? {
            info!(item = item.id, %outcome, closed_qty, "Item closed by brackets");
            EventRepo::append(
                &self.ctx.db,
                Some(item.batch_job_id),
                Some(item.id),
                EventLevel::Info,
                "ITEM_CLOSED",
                &format!("outcome={outcome} closed_qty={closed_qty}"),
                now,
            )
            .await?;
            BatchRepo::finalize_if_done(&self.ctx.db, item.batch_job_id, now).await?;
        }
        Ok(())
    }

    /// Consume fill hints and run the durable scan on a fallback period.
    pub async fn run(
        self: Arc<Self>,
        mut fill_rx: mpsc::Receiver<i64>,
        scan_interval: Duration,
        shutdown: CancellationToken,
    ) {
        if let Err(e) = self.recover().await {
            error!(error = %e, "OCO recovery failed");
        }
        let mut ticker = tokio::time::interval(scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                maybe_item = fill_rx.recv() => {
                    match maybe_item {
                        Some(item_id) => {
                            if let Err(e) = self.handle_item(item_id).await {
                                error!(item = item_id, error = %e, "OCO handling failed");
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        error!(error = %e, "OCO scan failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("OCO manager stopped");
                    break;
                }
            }
        }
    }
}
