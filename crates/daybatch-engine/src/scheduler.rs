//! Scheduler: activates due batches.
//!
//! Runs at coarse resolution and flips `SCHEDULED` batches to `RUNNING`
//! with a conditional claim; a batch whose fire time is older than the
//! grace window errors out instead of firing late.

use std::time::Duration;

use daybatch_core::{EventLevel, RunMode};
use daybatch_store::{BatchRepo, EventRepo, SchedulerRunRepo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::EngineResult;
use crate::EngineCtx;

pub struct Scheduler {
    ctx: EngineCtx,
    tick_interval: Duration,
    miss_grace_ms: i64,
    /// Batch ids handed to the execution engine.
    run_tx: mpsc::Sender<i64>,
}

impl Scheduler {
    pub fn new(
        ctx: EngineCtx,
        tick_interval: Duration,
        miss_grace: Duration,
        run_tx: mpsc::Sender<i64>,
    ) -> Self {
        Self {
            ctx,
            tick_interval: tick_interval.max(Duration::from_secs(1)),
            miss_grace_ms: miss_grace.as_millis() as i64,
            run_tx,
        }
    }

    /// One scan: claim due batches, error out missed ones, record the run.
    /// Returns `(triggered, missed)`.
    pub async fn tick(&self) -> EngineResult<(usize, usize)> {
        let now = self.ctx.now_ms();
        let due = BatchRepo::due(&self.ctx.db, now).await?;
        let mut triggered = 0usize;
        let mut missed = 0usize;

        for job in due {
            let fired_late = job.batch_run_mode()? == RunMode::Scheduled
                && job
                    .scheduled_at
                    .is_some_and(|at| now - at > self.miss_grace_ms);

            if fired_late {
                if BatchRepo::mark_missed(&self.ctx.db, job.id, "SCHEDULE_MISSED", now).await? {
                    missed += 1;
                    warn!(batch = job.id, code = %job.batch_code, "Scheduled time missed beyond grace window");
                    EventRepo::append(
                        &self.ctx.db,
                        Some(job.id),
                        None,
                        EventLevel::Error,
                        "SCHEDULE_MISSED",
                        &format!(
                            "scheduled_at={:?} now={} grace_ms={}",
                            job.scheduled_at, now, self.miss_grace_ms
                        ),
                        now,
                    )
                    .await?;
                }
                continue;
            }

            // Conditional swap keyed on (id, SCHEDULED); losers skip.
            if BatchRepo::claim_running(&self.ctx.db, job.id, now).await? {
                triggered += 1;
                let event_type = match job.batch_run_mode()? {
                    RunMode::Immediate => "IMMEDIATE_TRIGGERED",
                    RunMode::Scheduled => "SCHEDULE_TRIGGERED",
                };
                info!(batch = job.id, code = %job.batch_code, event_type, "Batch activated");
                EventRepo::append(
                    &self.ctx.db,
                    Some(job.id),
                    None,
                    EventLevel::Info,
                    event_type,
                    &format!("batch_code={}", job.batch_code),
                    now,
                )
                .await?;
                if self.run_tx.send(job.id).await.is_err() {
                    // Executor gone; the startup rescan picks the batch up.
                    warn!(batch = job.id, "Execution queue closed, batch left for rescan");
                }
            }
        }

        SchedulerRunRepo::record(&self.ctx.db, now, triggered as i32, missed as i32, "ok").await?;
        Ok((triggered, missed))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Scheduler stopped");
                    break;
                }
            }
        }
    }
}
