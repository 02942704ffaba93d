//! EOD closer: deterministic flatten at the configured wall-clock time.
//!
//! Cancels whatever is still open for an item, waits a bounded time for
//! the cancels to settle, then market-closes any residual position. The
//! supervisor's panic-stop runs the same algorithm out of schedule.

use std::sync::Arc;
use std::time::Duration;

use daybatch_broker::{exit_payload, BrokerError, ClosePosition, ExitKind, ExitSpec};
use daybatch_core::{
    clock::parse_hhmm, CloseOutcome, EventLevel, ItemState, OrderKind, OrderRole, OrderStatus,
    Product,
};
use daybatch_store::entity::batch_item;
use daybatch_store::{
    BatchRepo, EventRepo, ItemChanges, ItemRepo, NewOrder, OrderRepo,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::watcher::Watcher;
use crate::EngineCtx;

/// Item states with possibly-open exposure, excluding `EOD_MARKET_SENT`
/// (already being flattened).
const OPEN_STATES: [ItemState; 7] = [
    ItemState::Ready,
    ItemState::EntrySent,
    ItemState::EntryPartial,
    ItemState::EntryFilled,
    ItemState::BracketSent,
    ItemState::TpFilled,
    ItemState::SlFilled,
];

pub struct EodCloser {
    ctx: EngineCtx,
    /// Shared with the main polling loop so the flatten path can force a
    /// fresh reconciliation while it waits for cancels.
    watcher: Arc<Watcher>,
    enabled: bool,
    cancel_wait: Duration,
}

impl EodCloser {
    pub fn new(
        ctx: EngineCtx,
        watcher: Arc<Watcher>,
        enabled: bool,
        cancel_wait: Duration,
    ) -> Self {
        Self {
            ctx,
            watcher,
            enabled,
            cancel_wait,
        }
    }

    /// One pass: flatten batches whose close time has arrived, then sweep
    /// `EOD_MARKET_SENT` items whose close order has filled. Returns how
    /// many items were driven this pass.
    pub async fn tick(&self) -> EngineResult<usize> {
        if !self.enabled || !self.ctx.clock.is_business_day() {
            return Ok(0);
        }

        let mut driven = 0usize;
        for job in BatchRepo::running_or_paused(&self.ctx.db).await? {
            if !job.eod_force_close {
                continue;
            }
            let close_time = parse_hhmm(&job.eod_close_time)?;
            if !self.ctx.clock.local_time_reached(close_time) {
                continue;
            }
            driven += self.flatten_batch(job.id).await?;
        }
        driven += self.sweep_market_sent().await?;
        Ok(driven)
    }

    /// Flatten every non-terminal item of one batch. Also used by
    /// panic-stop and per-item force-close.
    pub async fn flatten_batch(&self, batch_job_id: i64) -> EngineResult<usize> {
        let items = ItemRepo::in_states(&self.ctx.db, &[batch_job_id], &OPEN_STATES).await?;
        let mut driven = 0usize;
        for item in items {
            match self.flatten_item(item.id).await {
                Ok(()) => driven += 1,
                Err(e) => error!(item = item.id, error = %e, "EOD flatten failed"),
            }
        }
        BatchRepo::finalize_if_done(&self.ctx.db, batch_job_id, self.ctx.now_ms()).await?;
        Ok(driven)
    }

    /// Cancel open orders, wait for confirmations, market-close the
    /// residual.
    pub async fn flatten_item(&self, item_id: i64) -> EngineResult<()> {
        let item = ItemRepo::get(&self.ctx.db, item_id).await?;
        let state = item.state()?;
        if state.is_terminal() || state == ItemState::EodMarketSent {
            return Ok(());
        }

        self.cancel_open_orders(&item).await?;
        self.await_cancel_settlement(&item).await?;

        // Residual from the reconciled view.
        let item = ItemRepo::get(&self.ctx.db, item_id).await?;
        let state = item.state()?;
        if state.is_terminal() || state == ItemState::EodMarketSent {
            return Ok(());
        }
        let residual = item.open_qty();

        if residual <= 0 {
            let outcome = if item.filled_qty == 0 {
                CloseOutcome::EntryCancelled
            } else {
                CloseOutcome::Eod
            };
            let changes = ItemChanges {
                close_outcome: Some(outcome),
                ..Default::default()
            };
            if ItemRepo::transition(&self.ctx.db, &item, ItemState::Closed, changes, self.ctx.now_ms())
                .await?
            {
                info!(item = item_id, "Nothing open at EOD, item closed flat");
            }
            return Ok(());
        }

        self.submit_market_close(&item, residual).await
    }

    async fn cancel_open_orders(&self, item: &batch_item::Model) -> EngineResult<()> {
        for order in OrderRepo::orders_for_item(&self.ctx.db, item.id).await? {
            if !order.order_status()?.is_active() {
                continue;
            }
            self.ctx.rate.acquire_order().await;
            match self.ctx.broker.cancel_order(&order.broker_order_id).await {
                Ok(()) | Err(BrokerError::OrderNotFound(_)) => {}
                Err(e) => {
                    warn!(
                        item = item.id,
                        broker_order_id = %order.broker_order_id,
                        error = %e,
                        "EOD cancel attempt failed"
                    );
                    EventRepo::append(
                        &self.ctx.db,
                        Some(item.batch_job_id),
                        Some(item.id),
                        EventLevel::Warn,
                        "EOD_CANCEL_FAILED",
                        &format!("order={} {e}", order.broker_order_id),
                        self.ctx.now_ms(),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Bounded wait: poll until every order of the item is terminal or
    /// the window elapses.
    async fn await_cancel_settlement(&self, item: &batch_item::Model) -> EngineResult<()> {
        let deadline = self.ctx.now_ms() + self.cancel_wait.as_millis() as i64;
        loop {
            self.watcher.poll_orders_once().await?;
            let all_terminal = OrderRepo::orders_for_item(&self.ctx.db, item.id)
                .await?
                .iter()
                .map(|o| o.order_status().map(|s| s.is_terminal()))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .all(|t| t);
            if all_terminal {
                return Ok(());
            }
            if self.ctx.now_ms() >= deadline {
                warn!(item = item.id, "Cancel confirmations still pending at deadline");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn submit_market_close(
        &self,
        item: &batch_item::Model,
        residual: i64,
    ) -> EngineResult<()> {
        let side = item.order_side()?;
        let product = item.item_product()?;

        let holds = match product {
            Product::Cash => Vec::new(),
            Product::Margin => {
                // Fresh snapshot: handles may have rotated since entry.
                self.ctx.rate.acquire_info().await;
                let positions = self.ctx.broker.list_positions().await?;
                let mut holds = Vec::new();
                let mut remaining = residual;
                for position in positions {
                    if remaining == 0 {
                        break;
                    }
                    if position.symbol != item.symbol
                        || position.position_side() != Some(side)
                    {
                        continue;
                    }
                    let Some(handle) = position.handle() else { continue };
                    if !daybatch_broker::wire::is_valid_handle(handle) {
                        continue;
                    }
                    let qty = position.remaining_qty().min(remaining);
                    if qty > 0 {
                        holds.push(ClosePosition {
                            hold_id: handle.to_string(),
                            qty,
                        });
                        remaining -= qty;
                    }
                }
                if remaining > 0 {
                    let now = self.ctx.now_ms();
                    let reason = format!(
                        "EOD_FAILED: position handles cover only {} of {residual}",
                        residual - remaining
                    );
                    ItemRepo::mark_error(&self.ctx.db, item.id, &reason, now).await?;
                    EventRepo::append(
                        &self.ctx.db,
                        Some(item.batch_job_id),
                        Some(item.id),
                        EventLevel::Error,
                        "EOD_HOLD_ID_MISSING",
                        &reason,
                        now,
                    )
                    .await?;
                    return Err(EngineError::EodFailed {
                        item: item.id,
                        reason,
                    });
                }
                holds
            }
        };

        let spec = ExitSpec {
            symbol: &item.symbol,
            exchange: item.exchange,
            product,
            entry_side: side,
            qty: residual,
            kind: ExitKind::Market,
            holds,
        };
        let payload = exit_payload(&spec)?;
        let now = self.ctx.now_ms();
        EventRepo::append(
            &self.ctx.db,
            Some(item.batch_job_id),
            Some(item.id),
            EventLevel::Debug,
            "EOD_PAYLOAD",
            &payload.masked_summary().to_string(),
            now,
        )
        .await?;

        self.ctx.rate.acquire_order().await;
        match self.ctx.broker.send_order(payload).await {
            Ok(ack) => {
                let now = self.ctx.now_ms();
                OrderRepo::insert(
                    &self.ctx.db,
                    NewOrder {
                        batch_item_id: item.id,
                        role: OrderRole::Eod,
                        broker_order_id: ack.order_id.clone(),
                        client_ref: None,
                        side: side.opposite(),
                        qty: residual,
                        kind: OrderKind::Market,
                        price: None,
                        trigger_price: None,
                    },
                    now,
                )
                .await?;
                self.advance_to_market_sent(item.id).await?;
                info!(item = item.id, order = %ack.order_id, residual, "EOD market close submitted");
                EventRepo::append(
                    &self.ctx.db,
                    Some(item.batch_job_id),
                    Some(item.id),
                    EventLevel::Warn,
                    "EOD_FORCE_CLOSE",
                    &format!("eod_order_id={} qty={residual}", ack.order_id),
                    now,
                )
                .await?;
                Ok(())
            }
            Err(e) => {
                let now = self.ctx.now_ms();
                let reason = format!("EOD_FAILED: {e}");
                ItemRepo::mark_error(&self.ctx.db, item.id, &reason, now).await?;
                EventRepo::append(
                    &self.ctx.db,
                    Some(item.batch_job_id),
                    Some(item.id),
                    EventLevel::Error,
                    "EOD_FAILED",
                    &reason,
                    now,
                )
                .await?;
                Err(EngineError::EodFailed {
                    item: item.id,
                    reason,
                })
            }
        }
    }

    async fn advance_to_market_sent(&self, item_id: i64) -> EngineResult<()> {
        loop {
            let item = ItemRepo::get(&self.ctx.db, item_id).await?;
            let state = item.state()?;
            if state.is_terminal() || state == ItemState::EodMarketSent {
                return Ok(());
            }
            if ItemRepo::transition(
                &self.ctx.db,
                &item,
                ItemState::EodMarketSent,
                ItemChanges::default(),
                self.ctx.now_ms(),
            )
            .await?
            {
                return Ok(());
            }
        }
    }

    /// Close items whose EOD market order has filled.
    pub async fn sweep_market_sent(&self) -> EngineResult<usize> {
        let jobs: Vec<i64> = BatchRepo::running_or_paused(&self.ctx.db)
            .await?
            .iter()
            .map(|j| j.id)
            .collect();
        let items =
            ItemRepo::in_states(&self.ctx.db, &jobs, &[ItemState::EodMarketSent]).await?;

        let mut closed = 0usize;
        for item in items {
            let eod_order = OrderRepo::orders_for_item(&self.ctx.db, item.id)
                .await?
                .into_iter()
                .filter(|o| o.role == OrderRole::Eod.as_str())
                .next_back();
            let Some(order) = eod_order else { continue };
            if order.order_status()? != OrderStatus::Filled {
                continue;
            }
            let now = self.ctx.now_ms();
            let changes = ItemChanges {
                closed_qty: Some(item.closed_qty + order.cum_qty),
                close_outcome: Some(CloseOutcome::Eod),
                ..Default::default()
            };
            if ItemRepo::transition(&self.ctx.db, &item, ItemState::Closed, changes, now).await? {
                closed += 1;
                info!(item = item.id, "EOD market order filled, item closed");
                EventRepo::append(
                    &self.ctx.db,
                    Some(item.batch_job_id),
                    Some(item.id),
                    EventLevel::Info,
                    "EOD_FILLED",
                    &format!("eod_order_id={}", order.broker_order_id),
                    now,
                )
                .await?;
                BatchRepo::finalize_if_done(&self.ctx.db, item.batch_job_id, now).await?;
            }
        }
        Ok(closed)
    }

    pub async fn run(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "EOD tick failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("EOD closer stopped");
                    break;
                }
            }
        }
    }
}
