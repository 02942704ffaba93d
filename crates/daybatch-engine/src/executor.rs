//! Execution engine: submits entries for activated batches.
//!
//! Items are processed in stable id order; one rejection parks the item
//! and the batch continues. An item that already has an entry order row
//! is never resubmitted, which makes restart after a crash between the
//! order insert and the item transition safe.

use daybatch_broker::{entry_payload, BrokerError, EntrySpec};
use daybatch_core::{BatchStatus, ClientOrderRef, EventLevel, ItemState, OrderKind, OrderRole};
use daybatch_store::entity::batch_item;
use daybatch_store::{BatchRepo, EventRepo, ItemChanges, ItemRepo, NewOrder, OrderRepo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::EngineResult;
use crate::EngineCtx;

pub struct ExecutionEngine {
    ctx: EngineCtx,
}

impl ExecutionEngine {
    pub fn new(ctx: EngineCtx) -> Self {
        Self { ctx }
    }

    /// Submit entries for every `READY` item of the batch, then try to
    /// finalize (covers the all-rejected case).
    pub async fn run_batch(&self, batch_job_id: i64) -> EngineResult<()> {
        let items = ItemRepo::ready_items(&self.ctx.db, batch_job_id).await?;
        for item in items {
            // Pause and panic-stop take effect between submits.
            let Some(job) = BatchRepo::find(&self.ctx.db, batch_job_id).await? else {
                return Ok(());
            };
            if job.batch_status()? != BatchStatus::Running {
                info!(batch = batch_job_id, status = %job.status, "Batch no longer running, stopping submits");
                return Ok(());
            }
            if let Err(e) = self.submit_entry(&item).await {
                error!(item = item.id, error = %e, "Entry submission errored");
            }
        }
        BatchRepo::finalize_if_done(&self.ctx.db, batch_job_id, self.ctx.now_ms()).await?;
        Ok(())
    }

    async fn submit_entry(&self, item: &batch_item::Model) -> EngineResult<()> {
        // Restart recovery: an entry order row means the submit already
        // happened; re-attach instead of resubmitting.
        let existing = OrderRepo::orders_for_item(&self.ctx.db, item.id)
            .await?
            .into_iter()
            .find(|o| o.role == OrderRole::Entry.as_str());
        if let Some(order) = existing {
            warn!(
                item = item.id,
                broker_order_id = %order.broker_order_id,
                "Entry order already recorded, skipping resubmit"
            );
            self.advance_to_sent(item.id, &order.broker_order_id, item.exchange)
                .await?;
            return Ok(());
        }

        let side = item.order_side()?;
        let product = item.item_product()?;
        let entry_type = item.item_entry_type()?;
        let spec = EntrySpec {
            symbol: &item.symbol,
            exchange: item.exchange,
            product,
            side,
            qty: item.qty,
            entry_type,
            limit_price: item.entry_price.and_then(daybatch_core::Price::from_f64),
        };
        let payload = entry_payload(&spec);
        let client_ref = ClientOrderRef::generate(self.ctx.now_ms());

        self.ctx.rate.acquire_order().await;
        let now = self.ctx.now_ms();
        EventRepo::append(
            &self.ctx.db,
            Some(item.batch_job_id),
            Some(item.id),
            EventLevel::Debug,
            "ENTRY_PAYLOAD",
            &payload.masked_summary().to_string(),
            now,
        )
        .await?;

        match self.ctx.broker.send_order(payload).await {
            Ok(ack) => {
                let now = self.ctx.now_ms();
                OrderRepo::insert(
                    &self.ctx.db,
                    NewOrder {
                        batch_item_id: item.id,
                        role: OrderRole::Entry,
                        broker_order_id: ack.order_id.clone(),
                        client_ref: Some(client_ref),
                        side,
                        qty: item.qty,
                        kind: match entry_type {
                            daybatch_core::EntryType::Market => OrderKind::Market,
                            daybatch_core::EntryType::Limit => OrderKind::Limit,
                        },
                        price: item.entry_price.and_then(daybatch_core::Price::from_f64),
                        trigger_price: None,
                    },
                    now,
                )
                .await?;
                self.advance_to_sent(item.id, &ack.order_id, ack.exchange).await?;
                info!(item = item.id, broker_order_id = %ack.order_id, "Entry submitted");
                EventRepo::append(
                    &self.ctx.db,
                    Some(item.batch_job_id),
                    Some(item.id),
                    EventLevel::Info,
                    "ORDER_SENT",
                    &format!("entry order_id={} exchange={}", ack.order_id, ack.exchange),
                    now,
                )
                .await?;
                Ok(())
            }
            Err(BrokerError::Rejected { code, message }) => {
                // One rejection does not abort the batch.
                let now = self.ctx.now_ms();
                let reason = format!("entry rejected: code={code:?} {message}");
                ItemRepo::mark_error(&self.ctx.db, item.id, &reason, now).await?;
                EventRepo::append(
                    &self.ctx.db,
                    Some(item.batch_job_id),
                    Some(item.id),
                    EventLevel::Error,
                    "ORDER_REJECTED",
                    &reason,
                    now,
                )
                .await?;
                Ok(())
            }
            Err(e) => {
                // No acknowledged response: do NOT write an order row; the
                // watcher's orphan reconciliation reports anything that
                // actually reached the broker.
                let now = self.ctx.now_ms();
                warn!(item = item.id, error = %e, "Entry submit without response, left READY");
                EventRepo::append(
                    &self.ctx.db,
                    Some(item.batch_job_id),
                    Some(item.id),
                    EventLevel::Warn,
                    "ENTRY_UNCONFIRMED",
                    &e.to_string(),
                    now,
                )
                .await?;
                Ok(())
            }
        }
    }

    /// `READY -> ENTRY_SENT` with the broker id attached; retries version
    /// races and tolerates the item having been force-closed meanwhile.
    async fn advance_to_sent(
        &self,
        item_id: i64,
        broker_order_id: &str,
        exchange: i32,
    ) -> EngineResult<()> {
        loop {
            let item = ItemRepo::get(&self.ctx.db, item_id).await?;
            let state = item.state()?;
            if state != ItemState::Ready {
                return Ok(());
            }
            let changes = ItemChanges {
                entry_order_id: Some(broker_order_id.to_string()),
                exchange: Some(exchange),
                clear_error: true,
                ..Default::default()
            };
            if ItemRepo::transition(
                &self.ctx.db,
                &item,
                ItemState::EntrySent,
                changes,
                self.ctx.now_ms(),
            )
            .await?
            {
                return Ok(());
            }
        }
    }

    /// Rescan every `RUNNING` batch; covers restart recovery and items
    /// left `READY` by an unconfirmed submit.
    pub async fn rescan_running(&self) {
        match BatchRepo::running_ids(&self.ctx.db).await {
            Ok(ids) => {
                for id in ids {
                    if let Err(e) = self.run_batch(id).await {
                        error!(batch = id, error = %e, "Batch rescan failed");
                    }
                }
            }
            Err(e) => error!(error = %e, "Rescan query failed"),
        }
    }

    /// Consume batch ids from the scheduler. The periodic rescan is the
    /// durable fallback: a hint lost to a crash or a full queue is picked
    /// up on the next pass.
    pub async fn run(
        self,
        mut run_rx: mpsc::Receiver<i64>,
        rescan_interval: std::time::Duration,
        shutdown: CancellationToken,
    ) {
        self.rescan_running().await;

        let mut ticker = tokio::time::interval(rescan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                maybe_id = run_rx.recv() => {
                    match maybe_id {
                        Some(id) => {
                            if let Err(e) = self.run_batch(id).await {
                                error!(batch = id, error = %e, "Batch run failed");
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.rescan_running().await;
                }
                _ = shutdown.cancelled() => {
                    info!("Execution engine stopped");
                    break;
                }
            }
        }
    }
}
