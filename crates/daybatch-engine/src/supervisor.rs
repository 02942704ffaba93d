//! Supervisor: wires the actors, owns shutdown, and exposes the manual
//! command surface.
//!
//! Every manual command is validated, serialized per batch, and leaves an
//! audit row with actor and reason.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use daybatch_broker::{DynBroker, RateLimiter};
use daybatch_core::{
    clock::parse_hhmm, BatchStatus, DynClock, EntryType, EventLevel, OcoMode, OrderSide, RunMode,
};
use daybatch_store::{AuditRepo, BatchRepo, EventRepo, NewBatch, NewItem, OcoRepo, OrderRepo};
use parking_lot::Mutex as SyncMutex;
use sea_orm::DatabaseConnection;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::eod::EodCloser;
use crate::error::{EngineError, EngineResult};
use crate::executor::ExecutionEngine;
use crate::oco::OcoManager;
use crate::scheduler::Scheduler;
use crate::watcher::Watcher;
use crate::EngineCtx;

/// Tunables for the control plane, resolved from configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Default market code stamped on items created without one.
    pub market_code: i32,
    pub scheduler_tick: Duration,
    pub miss_grace: Duration,
    pub orders_poll_interval: Duration,
    pub positions_poll_interval: Duration,
    pub oco_mode: OcoMode,
    pub oco_scan_interval: Duration,
    pub hold_wait: Duration,
    pub cancel_wait: Duration,
    pub eod_enabled: bool,
    pub eod_tick: Duration,
    /// Close time stamped on batches created without one.
    pub eod_default_close_time: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            market_code: 9,
            scheduler_tick: Duration::from_secs(1),
            miss_grace: Duration::from_secs(300),
            orders_poll_interval: Duration::from_millis(1500),
            positions_poll_interval: Duration::from_millis(3000),
            oco_mode: OcoMode::PerPartial,
            oco_scan_interval: Duration::from_secs(1),
            hold_wait: Duration::from_secs(10),
            cancel_wait: Duration::from_millis(3000),
            eod_enabled: true,
            eod_tick: Duration::from_secs(1),
            eod_default_close_time: "14:30".to_string(),
        }
    }
}

/// Pieces consumed when the loops start.
struct RunParts {
    scheduler: Scheduler,
    executor: ExecutionEngine,
    run_rx: mpsc::Receiver<i64>,
    fill_rx: mpsc::Receiver<i64>,
}

pub struct Supervisor {
    ctx: EngineCtx,
    cfg: SupervisorConfig,
    watcher: Arc<Watcher>,
    oco: Arc<OcoManager>,
    eod: Arc<EodCloser>,
    parts: SyncMutex<Option<RunParts>>,
    shutdown: CancellationToken,
    /// Manual commands are serialized per batch.
    batch_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl Supervisor {
    pub fn new(
        db: DatabaseConnection,
        broker: DynBroker,
        rate: Arc<RateLimiter>,
        clock: DynClock,
        cfg: SupervisorConfig,
    ) -> Self {
        let ctx = EngineCtx::new(db, broker, rate, clock);

        let (run_tx, run_rx) = mpsc::channel(64);
        let (fill_tx, fill_rx) = mpsc::channel(1024);

        let scheduler = Scheduler::new(
            ctx.clone(),
            cfg.scheduler_tick,
            cfg.miss_grace,
            run_tx,
        );
        let executor = ExecutionEngine::new(ctx.clone());
        let watcher = Arc::new(Watcher::new(
            ctx.clone(),
            cfg.orders_poll_interval,
            cfg.positions_poll_interval,
            fill_tx,
        ));
        let oco = Arc::new(OcoManager::new(ctx.clone(), cfg.oco_mode, cfg.hold_wait));
        let eod = Arc::new(EodCloser::new(
            ctx.clone(),
            watcher.clone(),
            cfg.eod_enabled,
            cfg.cancel_wait,
        ));

        Self {
            ctx,
            cfg,
            watcher,
            oco,
            eod,
            parts: SyncMutex::new(Some(RunParts {
                scheduler,
                executor,
                run_rx,
                fill_rx,
            })),
            shutdown: CancellationToken::new(),
            batch_locks: DashMap::new(),
        }
    }

    pub fn watcher(&self) -> Arc<Watcher> {
        self.watcher.clone()
    }

    pub fn oco(&self) -> Arc<OcoManager> {
        self.oco.clone()
    }

    pub fn eod(&self) -> Arc<EodCloser> {
        self.eod.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting new work; in-flight broker calls finish and
    /// unfinished work stays in its intermediate state for the next
    /// process instance.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Spawn every loop and block until shutdown, then drain the tasks.
    pub async fn run_until_shutdown(&self) -> EngineResult<()> {
        let parts = self
            .parts
            .lock()
            .take()
            .ok_or_else(|| EngineError::InternalInvariant("supervisor already running".into()))?;

        info!("Starting control plane");
        let token = self.shutdown.clone();
        let handles: Vec<JoinHandle<()>> = vec![
            tokio::spawn(parts.scheduler.run(token.clone())),
            tokio::spawn(parts.executor.run(
                parts.run_rx,
                self.cfg.scheduler_tick.max(Duration::from_secs(2)),
                token.clone(),
            )),
            tokio::spawn(self.watcher.clone().run(token.clone())),
            tokio::spawn(self.oco.clone().run(
                parts.fill_rx,
                self.cfg.oco_scan_interval,
                token.clone(),
            )),
            tokio::spawn(self.eod.clone().run(self.cfg.eod_tick, token.clone())),
        ];

        token.cancelled().await;
        for handle in handles {
            let _ = handle.await;
        }
        info!("Control plane stopped");
        Ok(())
    }

    fn batch_lock(&self, batch_job_id: i64) -> Arc<Mutex<()>> {
        self.batch_locks
            .entry(batch_job_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// `ValidationError` fails the command without touching state.
    fn validate_batch(&self, batch: &NewBatch, items: &[NewItem]) -> EngineResult<()> {
        if batch.batch_code.trim().is_empty() || batch.name.trim().is_empty() {
            return Err(EngineError::Validation(
                "batch_code and name are required".into(),
            ));
        }
        match batch.run_mode {
            RunMode::Scheduled if batch.scheduled_at.is_none() => {
                return Err(EngineError::Validation(
                    "scheduled batch requires scheduled_at".into(),
                ))
            }
            RunMode::Immediate if batch.scheduled_at.is_some() => {
                return Err(EngineError::Validation(
                    "immediate batch must not set scheduled_at".into(),
                ))
            }
            _ => {}
        }
        parse_hhmm(&batch.eod_close_time)
            .map_err(|e| EngineError::Validation(format!("eod_close_time: {e}")))?;
        if items.is_empty() {
            return Err(EngineError::Validation("batch has no items".into()));
        }

        for item in items {
            if item.symbol.trim().is_empty() {
                return Err(EngineError::Validation("item symbol is required".into()));
            }
            if item.qty <= 0 {
                return Err(EngineError::Validation(format!(
                    "item {} qty must be positive",
                    item.symbol
                )));
            }
            if !item.tp_price.is_positive() || !item.sl_trigger_price.is_positive() {
                return Err(EngineError::Validation(format!(
                    "item {} bracket prices must be positive",
                    item.symbol
                )));
            }
            match item.entry_type {
                EntryType::Limit => {
                    let Some(limit) = item.entry_price else {
                        return Err(EngineError::Validation(format!(
                            "item {} limit entry requires entry_price",
                            item.symbol
                        )));
                    };
                    if !limit.is_positive() {
                        return Err(EngineError::Validation(format!(
                            "item {} entry_price must be positive",
                            item.symbol
                        )));
                    }
                    // TP/SL must sit on the profit/loss side of the entry.
                    let ok = match item.side {
                        OrderSide::Buy => {
                            item.tp_price > limit && item.sl_trigger_price < limit
                        }
                        OrderSide::Sell => {
                            item.tp_price < limit && item.sl_trigger_price > limit
                        }
                    };
                    if !ok {
                        return Err(EngineError::Validation(format!(
                            "item {} bracket prices on wrong side of entry {limit}",
                            item.symbol
                        )));
                    }
                }
                EntryType::Market => {
                    if item.entry_price.is_some() {
                        return Err(EngineError::Validation(format!(
                            "item {} market entry must not set entry_price",
                            item.symbol
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Create a batch (items default to the configured market code).
    pub async fn create_batch(
        &self,
        actor: &str,
        mut batch: NewBatch,
        mut items: Vec<NewItem>,
    ) -> EngineResult<i64> {
        if batch.eod_close_time.trim().is_empty() {
            batch.eod_close_time = self.cfg.eod_default_close_time.clone();
        }
        for item in &mut items {
            if item.exchange <= 0 {
                item.exchange = self.cfg.market_code;
            }
        }
        self.validate_batch(&batch, &items)?;

        let now = self.ctx.now_ms();
        let code = batch.batch_code.clone();
        let item_count = items.len();
        let job = BatchRepo::create(&self.ctx.db, batch, items, now).await?;
        info!(batch = job.id, %code, items = item_count, actor, "Batch created");
        EventRepo::append(
            &self.ctx.db,
            Some(job.id),
            None,
            EventLevel::Info,
            "BATCH_CREATED",
            &format!("batch_code={code} items={item_count}"),
            now,
        )
        .await?;
        AuditRepo::append(
            &self.ctx.db,
            actor,
            "create_batch",
            Some(job.id),
            None,
            &format!("items={item_count}"),
            now,
        )
        .await?;
        Ok(job.id)
    }

    pub async fn schedule_batch(
        &self,
        actor: &str,
        batch_job_id: i64,
        scheduled_at: i64,
    ) -> EngineResult<()> {
        let lock = self.batch_lock(batch_job_id);
        let _guard = lock.lock().await;
        let now = self.ctx.now_ms();
        if !BatchRepo::reschedule(&self.ctx.db, batch_job_id, scheduled_at, now).await? {
            return Err(EngineError::Validation(format!(
                "batch {batch_job_id} is not SCHEDULED"
            )));
        }
        AuditRepo::append(
            &self.ctx.db,
            actor,
            "schedule_batch",
            Some(batch_job_id),
            None,
            &format!("scheduled_at={scheduled_at}"),
            now,
        )
        .await?;
        Ok(())
    }

    pub async fn pause_batch(&self, actor: &str, batch_job_id: i64, reason: &str) -> EngineResult<()> {
        let lock = self.batch_lock(batch_job_id);
        let _guard = lock.lock().await;
        let now = self.ctx.now_ms();
        if !BatchRepo::pause(&self.ctx.db, batch_job_id, now).await? {
            return Err(EngineError::Validation(format!(
                "batch {batch_job_id} is not RUNNING"
            )));
        }
        info!(batch = batch_job_id, actor, "Batch paused");
        AuditRepo::append(&self.ctx.db, actor, "pause_batch", Some(batch_job_id), None, reason, now)
            .await?;
        Ok(())
    }

    pub async fn resume_batch(
        &self,
        actor: &str,
        batch_job_id: i64,
        reason: &str,
    ) -> EngineResult<()> {
        let lock = self.batch_lock(batch_job_id);
        let _guard = lock.lock().await;
        let now = self.ctx.now_ms();
        if !BatchRepo::resume(&self.ctx.db, batch_job_id, now).await? {
            return Err(EngineError::Validation(format!(
                "batch {batch_job_id} is not PAUSED"
            )));
        }
        info!(batch = batch_job_id, actor, "Batch resumed");
        AuditRepo::append(&self.ctx.db, actor, "resume_batch", Some(batch_job_id), None, reason, now)
            .await?;
        Ok(())
    }

    /// Cancel a batch that has not started; started batches go through
    /// `panic_stop_all` so positions are flattened first.
    pub async fn cancel_batch(
        &self,
        actor: &str,
        batch_job_id: i64,
        reason: &str,
    ) -> EngineResult<()> {
        let lock = self.batch_lock(batch_job_id);
        let _guard = lock.lock().await;
        let now = self.ctx.now_ms();
        if !BatchRepo::cancel_scheduled(&self.ctx.db, batch_job_id, now).await? {
            return Err(EngineError::Validation(format!(
                "batch {batch_job_id} is not SCHEDULED; use panic stop for started batches"
            )));
        }
        info!(batch = batch_job_id, actor, "Batch cancelled");
        AuditRepo::append(&self.ctx.db, actor, "cancel_batch", Some(batch_job_id), None, reason, now)
            .await?;
        Ok(())
    }

    /// Cancel the live bracket legs of one item, leaving the position
    /// deliberately unprotected.
    pub async fn cancel_item_brackets(
        &self,
        actor: &str,
        batch_item_id: i64,
        reason: &str,
    ) -> EngineResult<()> {
        let item = daybatch_store::ItemRepo::get(&self.ctx.db, batch_item_id).await?;
        let lock = self.batch_lock(item.batch_job_id);
        let _guard = lock.lock().await;

        let mut cancelled = 0usize;
        for group in OcoRepo::groups_for_item(&self.ctx.db, batch_item_id).await? {
            if group.group_status()? != daybatch_core::OcoStatus::Active {
                continue;
            }
            for leg in [group.tp_order_id.as_deref(), group.sl_order_id.as_deref()]
                .into_iter()
                .flatten()
            {
                if let Some(order) = OrderRepo::find_by_broker_id(&self.ctx.db, leg).await? {
                    if !order.order_status()?.is_active() {
                        continue;
                    }
                }
                self.ctx.rate.acquire_order().await;
                match self.ctx.broker.cancel_order(leg).await {
                    Ok(()) | Err(daybatch_broker::BrokerError::OrderNotFound(_)) => cancelled += 1,
                    Err(e) => warn!(order = leg, error = %e, "Bracket cancel failed"),
                }
            }
        }

        let now = self.ctx.now_ms();
        EventRepo::append(
            &self.ctx.db,
            Some(item.batch_job_id),
            Some(batch_item_id),
            EventLevel::Warn,
            "BRACKETS_CANCELLED",
            &format!("legs_cancelled={cancelled} by={actor}"),
            now,
        )
        .await?;
        AuditRepo::append(
            &self.ctx.db,
            actor,
            "cancel_item_brackets",
            Some(item.batch_job_id),
            Some(batch_item_id),
            reason,
            now,
        )
        .await?;
        Ok(())
    }

    /// Run the EOD flatten for one item, out of schedule.
    pub async fn force_close_item(
        &self,
        actor: &str,
        batch_item_id: i64,
        reason: &str,
    ) -> EngineResult<()> {
        let item = daybatch_store::ItemRepo::get(&self.ctx.db, batch_item_id).await?;
        let lock = self.batch_lock(item.batch_job_id);
        let _guard = lock.lock().await;

        let now = self.ctx.now_ms();
        AuditRepo::append(
            &self.ctx.db,
            actor,
            "force_close_item",
            Some(item.batch_job_id),
            Some(batch_item_id),
            reason,
            now,
        )
        .await?;
        self.eod.flatten_item(batch_item_id).await
    }

    /// Flatten everything: cancel scheduled batches, run the EOD
    /// algorithm over every started batch.
    pub async fn panic_stop_all(&self, actor: &str, reason: &str) -> EngineResult<usize> {
        let now = self.ctx.now_ms();
        warn!(actor, reason, "PANIC STOP invoked");
        AuditRepo::append(&self.ctx.db, actor, "panic_stop_all", None, None, reason, now).await?;
        EventRepo::append(
            &self.ctx.db,
            None,
            None,
            EventLevel::Error,
            "PANIC_STOP",
            &format!("by={actor} reason={reason}"),
            now,
        )
        .await?;

        let mut driven = 0usize;
        for job in BatchRepo::due(&self.ctx.db, i64::MAX).await? {
            if BatchRepo::cancel_scheduled(&self.ctx.db, job.id, now).await? {
                driven += 1;
            }
        }
        for job in BatchRepo::running_or_paused(&self.ctx.db).await? {
            let lock = self.batch_lock(job.id);
            let _guard = lock.lock().await;
            driven += self.eod.flatten_batch(job.id).await?;
        }
        Ok(driven)
    }

    /// Optional pre-trade validation: resolve a symbol's display name.
    pub async fn lookup_symbol_name(&self, symbol: &str) -> EngineResult<Option<String>> {
        self.ctx.rate.acquire_info().await;
        Ok(self.ctx.broker.symbol_name(symbol).await?)
    }

    /// Batch status lookup for the control surface.
    pub async fn batch_status(&self, batch_job_id: i64) -> EngineResult<BatchStatus> {
        let job = BatchRepo::find(&self.ctx.db, batch_job_id)
            .await?
            .ok_or_else(|| EngineError::Validation(format!("batch {batch_job_id} not found")))?;
        Ok(job.batch_status()?)
    }
}
