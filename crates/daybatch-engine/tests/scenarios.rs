//! End-to-end control-plane scenarios against a scripted broker and a
//! manual clock: entry → fill → brackets → mutual cancel → close, the
//! EOD flatten, restart idempotency and the failure branches.

use std::sync::Arc;
use std::time::Duration;

use daybatch_broker::{BrokerError, DynBroker, MockBroker, PositionWire, RateLimiter};
use daybatch_core::{
    Clock, DynClock, EntryType, ManualClock, OcoMode, OrderSide, Price, Product, RunMode,
};
use daybatch_engine::eod::EodCloser;
use daybatch_engine::executor::ExecutionEngine;
use daybatch_engine::oco::OcoManager;
use daybatch_engine::scheduler::Scheduler;
use daybatch_engine::watcher::Watcher;
use daybatch_engine::{EngineCtx, Supervisor, SupervisorConfig};
use daybatch_store::{
    establish_connection, BatchRepo, EventRepo, ItemRepo, NewBatch, NewItem, OcoRepo, OrderRepo,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::DatabaseConnection;
use tokio::sync::mpsc;

struct Harness {
    db: DatabaseConnection,
    broker: Arc<MockBroker>,
    clock: Arc<ManualClock>,
    scheduler: Scheduler,
    executor: ExecutionEngine,
    watcher: Arc<Watcher>,
    oco: OcoManager,
    eod: EodCloser,
    sup: Supervisor,
    run_rx: mpsc::Receiver<i64>,
}

async fn harness() -> Harness {
    harness_with_mode(OcoMode::PerPartial).await
}

async fn harness_with_mode(mode: OcoMode) -> Harness {
    let db = establish_connection("sqlite::memory:").await.unwrap();
    let broker = Arc::new(MockBroker::new());
    // 2026-03-02 is a Monday; the session starts mid-morning.
    let clock = Arc::new(ManualClock::at_local(2026, 3, 2, "09:05"));
    let rate = Arc::new(RateLimiter::new(1000, 1000));

    let dyn_broker: DynBroker = broker.clone();
    let dyn_clock: DynClock = clock.clone();
    let ctx = EngineCtx::new(db.clone(), dyn_broker.clone(), rate.clone(), dyn_clock.clone());

    let (run_tx, run_rx) = mpsc::channel(64);
    let (fill_tx, _fill_rx) = mpsc::channel(1024);

    let scheduler = Scheduler::new(
        ctx.clone(),
        Duration::from_secs(1),
        Duration::from_secs(300),
        run_tx,
    );
    let executor = ExecutionEngine::new(ctx.clone());
    let watcher = Arc::new(Watcher::new(
        ctx.clone(),
        Duration::from_millis(1500),
        Duration::from_millis(3000),
        fill_tx,
    ));
    let oco = OcoManager::new(ctx.clone(), mode, Duration::from_secs(10));
    let eod = EodCloser::new(ctx.clone(), watcher.clone(), true, Duration::from_millis(500));

    let sup = Supervisor::new(
        db.clone(),
        dyn_broker,
        rate,
        dyn_clock,
        SupervisorConfig::default(),
    );

    Harness {
        db,
        broker,
        clock,
        scheduler,
        executor,
        watcher,
        oco,
        eod,
        sup,
        run_rx,
    }
}

fn immediate_batch(code: &str) -> NewBatch {
    NewBatch {
        batch_code: code.to_string(),
        name: "intraday".to_string(),
        run_mode: RunMode::Immediate,
        scheduled_at: None,
        eod_close_time: "14:30".to_string(),
        eod_force_close: true,
    }
}

fn cash_buy_item(symbol: &str, qty: i64, tp: i64, sl: i64) -> NewItem {
    NewItem {
        symbol: symbol.to_string(),
        exchange: 9,
        product: Product::Cash,
        side: OrderSide::Buy,
        qty,
        entry_type: EntryType::Market,
        entry_price: None,
        tp_price: Price::new(Decimal::from(tp)),
        sl_trigger_price: Price::new(Decimal::from(sl)),
    }
}

impl Harness {
    /// Scheduler tick plus executor runs for every activated batch.
    async fn activate_and_submit(&mut self) {
        self.scheduler.tick().await.unwrap();
        while let Ok(batch_id) = self.run_rx.try_recv() {
            self.executor.run_batch(batch_id).await.unwrap();
        }
    }

    async fn item(&self, id: i64) -> daybatch_store::entity::batch_item::Model {
        ItemRepo::get(&self.db, id).await.unwrap()
    }

    async fn only_item(&self, batch_id: i64) -> daybatch_store::entity::batch_item::Model {
        let items = ItemRepo::items_of(&self.db, batch_id).await.unwrap();
        assert_eq!(items.len(), 1);
        items.into_iter().next().unwrap()
    }
}

#[tokio::test]
async fn happy_cash_tp() {
    let mut h = harness().await;
    let batch_id = h
        .sup
        .create_batch("op", immediate_batch("B-TP"), vec![cash_buy_item("9432", 100, 1000, 900)])
        .await
        .unwrap();

    h.activate_and_submit().await;
    let item = h.only_item(batch_id).await;
    assert_eq!(item.status, "ENTRY_SENT");
    let entry_id = item.entry_order_id.clone().unwrap();

    // Full fill at 950.
    h.broker.fill_order(&entry_id, 100, 950.0);
    h.watcher.poll_orders_once().await.unwrap();
    let item = h.item(item.id).await;
    assert_eq!(item.status, "ENTRY_FILLED");
    assert_eq!(item.filled_qty, 100);
    assert_eq!(item.avg_fill_price, Some(950.0));

    // Brackets: sell-limit 1000 and sell-stop 900.
    h.oco.handle_item(item.id).await.unwrap();
    let item = h.item(item.id).await;
    assert_eq!(item.status, "BRACKET_SENT");

    let payloads = h.broker.sent_payloads();
    assert_eq!(payloads.len(), 3);
    let tp_payload = &payloads[1];
    assert_eq!(tp_payload.side, "1");
    assert_eq!(tp_payload.front_order_type, 20);
    assert_eq!(tp_payload.price, dec!(1000));
    let sl_payload = &payloads[2];
    assert_eq!(sl_payload.front_order_type, 30);
    let reverse = sl_payload.reverse_limit_order.as_ref().unwrap();
    assert_eq!(reverse.trigger_price, dec!(900));
    assert_eq!(reverse.under_over, 1);

    let ids = h.broker.acked_ids();
    let (tp_id, sl_id) = (ids[1].clone(), ids[2].clone());

    // TP fills; the manager cancels the SL survivor.
    h.broker.fill_order(&tp_id, 100, 1000.0);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.scan().await.unwrap();
    assert_eq!(h.broker.cancelled_ids(), vec![sl_id.clone()]);

    h.watcher.poll_orders_once().await.unwrap();
    h.oco.scan().await.unwrap();

    let item = h.item(item.id).await;
    assert_eq!(item.status, "CLOSED");
    assert_eq!(item.close_outcome.as_deref(), Some("TP_FILLED"));
    assert_eq!(item.closed_qty, 100);

    let groups = OcoRepo::groups_for_item(&h.db, item.id).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].status, "CLOSED");

    let sl_row = OrderRepo::find_by_broker_id(&h.db, &sl_id).await.unwrap().unwrap();
    assert_eq!(sl_row.status, "CANCELLED");

    let job = BatchRepo::find(&h.db, batch_id).await.unwrap().unwrap();
    assert_eq!(job.status, "DONE");

    // Fill-accounting invariant: entry fills sum to the item's filled qty.
    let entry_row = OrderRepo::find_by_broker_id(&h.db, &entry_id).await.unwrap().unwrap();
    let fills = OrderRepo::fills_for_order(&h.db, entry_row.id).await.unwrap();
    assert_eq!(fills.iter().map(|f| f.qty).sum::<i64>(), item.filled_qty);
    assert_eq!(entry_row.cum_qty, item.filled_qty);
}

#[tokio::test]
async fn happy_margin_sl_with_position_handle() {
    let mut h = harness().await;
    let item_spec = NewItem {
        symbol: "9433".to_string(),
        exchange: 9,
        product: Product::Margin,
        side: OrderSide::Sell,
        qty: 200,
        entry_type: EntryType::Market,
        entry_price: None,
        tp_price: Price::new(dec!(1800)),
        sl_trigger_price: Price::new(dec!(2050)),
    };
    let batch_id = h
        .sup
        .create_batch("op", immediate_batch("B-SL"), vec![item_spec])
        .await
        .unwrap();

    h.activate_and_submit().await;
    let item = h.only_item(batch_id).await;
    let entry_id = item.entry_order_id.clone().unwrap();

    h.broker.fill_order(&entry_id, 200, 2000.0);
    h.watcher.poll_orders_once().await.unwrap();

    // No handle yet: brackets are deferred, not failed.
    h.oco.handle_item(item.id).await.unwrap();
    assert_eq!(h.broker.sent_payloads().len(), 1);
    assert_eq!(
        EventRepo::by_type(&h.db, "OCO_WAIT_HOLD_ID").await.unwrap().len(),
        1
    );

    // The handle shows up on the next positions poll.
    h.broker.set_positions(vec![PositionWire {
        symbol: "9433".to_string(),
        side: "1".to_string(),
        hold_id: Some("E2026ABC".to_string()),
        leaves_qty: 200,
        ..Default::default()
    }]);
    h.watcher.poll_positions_once().await.unwrap();
    let item = h.item(item.id).await;
    assert_eq!(item.hold_id.as_deref(), Some("E2026ABC"));

    let snapshots = daybatch_store::SnapshotRepo::recent(&h.db, 5).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].hold_id, "E2026ABC");

    h.oco.handle_item(item.id).await.unwrap();
    let payloads = h.broker.sent_payloads();
    assert_eq!(payloads.len(), 3);
    // Short entry closes with buy orders citing the handle.
    let tp_payload = &payloads[1];
    assert_eq!(tp_payload.side, "2");
    assert_eq!(tp_payload.cash_margin, 3);
    let holds = tp_payload.close_positions.as_ref().unwrap();
    assert_eq!(holds[0].hold_id, "E2026ABC");
    assert_eq!(holds[0].qty, 200);
    let sl_payload = &payloads[2];
    let reverse = sl_payload.reverse_limit_order.as_ref().unwrap();
    assert_eq!(reverse.trigger_price, dec!(2050));
    // Stop on a short triggers when price goes over.
    assert_eq!(reverse.under_over, 2);

    // Price spikes: SL triggers and fills at 2055.
    let ids = h.broker.acked_ids();
    let (tp_id, sl_id) = (ids[1].clone(), ids[2].clone());
    h.broker.fill_order(&sl_id, 200, 2055.0);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.scan().await.unwrap();
    assert_eq!(h.broker.cancelled_ids(), vec![tp_id]);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.scan().await.unwrap();

    let item = h.item(item.id).await;
    assert_eq!(item.status, "CLOSED");
    assert_eq!(item.close_outcome.as_deref(), Some("SL_FILLED"));
}

#[tokio::test]
async fn partial_fill_fans_out_one_group_per_slice() {
    let mut h = harness().await;
    let mut spec = cash_buy_item("9434", 300, 520, 480);
    spec.entry_type = EntryType::Limit;
    spec.entry_price = Some(Price::new(dec!(500)));
    let batch_id = h
        .sup
        .create_batch("op", immediate_batch("B-PART"), vec![spec])
        .await
        .unwrap();

    h.activate_and_submit().await;
    let item = h.only_item(batch_id).await;
    let entry_id = item.entry_order_id.clone().unwrap();

    // First slice: 100 @ 500.
    h.broker.partial_fill_order(&entry_id, 100, 500.0);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.handle_item(item.id).await.unwrap();

    let groups = OcoRepo::groups_for_item(&h.db, item.id).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].qty, 100);
    assert_eq!(groups[0].status, "ACTIVE");

    // Second slice: 200 @ 501 completes the entry.
    let avg = (100.0 * 500.0 + 200.0 * 501.0) / 300.0;
    h.broker.fill_order(&entry_id, 300, avg);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.handle_item(item.id).await.unwrap();

    let groups = OcoRepo::groups_for_item(&h.db, item.id).await.unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[1].qty, 200);

    // The synthetic second fill lands near 501.
    let entry_row = OrderRepo::find_by_broker_id(&h.db, &entry_id).await.unwrap().unwrap();
    let fills = OrderRepo::fills_for_order(&h.db, entry_row.id).await.unwrap();
    assert_eq!(fills.len(), 2);
    assert_eq!(fills[0].qty, 100);
    assert_eq!(fills[1].qty, 200);
    assert!((fills[1].price - 501.0).abs() < 0.01);

    // TP of the first group fills: only that group closes.
    let ids = h.broker.acked_ids();
    let group1_tp = ids[1].clone();
    h.broker.fill_order(&group1_tp, 100, 520.0);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.scan().await.unwrap();
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.scan().await.unwrap();

    let groups = OcoRepo::groups_for_item(&h.db, item.id).await.unwrap();
    assert_eq!(groups[0].status, "CLOSED");
    assert_eq!(groups[1].status, "ACTIVE");

    let item = h.item(item.id).await;
    assert_eq!(item.status, "BRACKET_SENT");
    assert_eq!(item.closed_qty, 100);
}

#[tokio::test]
async fn post_complete_mode_waits_for_full_fill() {
    let mut h = harness_with_mode(OcoMode::PostComplete).await;
    let mut spec = cash_buy_item("9434", 300, 520, 480);
    spec.entry_type = EntryType::Limit;
    spec.entry_price = Some(Price::new(dec!(500)));
    let batch_id = h
        .sup
        .create_batch("op", immediate_batch("B-POST"), vec![spec])
        .await
        .unwrap();

    h.activate_and_submit().await;
    let item = h.only_item(batch_id).await;
    let entry_id = item.entry_order_id.clone().unwrap();

    h.broker.partial_fill_order(&entry_id, 100, 500.0);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.handle_item(item.id).await.unwrap();
    // Partial fill: no brackets yet in post-complete mode.
    assert!(OcoRepo::groups_for_item(&h.db, item.id).await.unwrap().is_empty());

    h.broker.fill_order(&entry_id, 300, 500.0);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.handle_item(item.id).await.unwrap();

    let groups = OcoRepo::groups_for_item(&h.db, item.id).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].qty, 300);
}

#[tokio::test]
async fn eod_flattens_open_bracket_position() {
    let mut h = harness().await;
    let batch_id = h
        .sup
        .create_batch("op", immediate_batch("B-EOD"), vec![cash_buy_item("9432", 100, 1000, 900)])
        .await
        .unwrap();

    h.activate_and_submit().await;
    let item = h.only_item(batch_id).await;
    let entry_id = item.entry_order_id.clone().unwrap();
    h.broker.fill_order(&entry_id, 100, 950.0);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.handle_item(item.id).await.unwrap();
    assert_eq!(h.item(item.id).await.status, "BRACKET_SENT");

    // Before the close time nothing happens.
    assert_eq!(h.eod.tick().await.unwrap(), 0);

    h.clock.set_local_time("14:30");
    h.eod.tick().await.unwrap();

    let item = h.item(item.id).await;
    assert_eq!(item.status, "EOD_MARKET_SENT");
    // TP and SL were cancelled before the market close went out.
    assert_eq!(h.broker.cancelled_ids().len(), 2);

    let eod_order = OrderRepo::orders_for_item(&h.db, item.id)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.role == "eod")
        .unwrap();
    assert_eq!(eod_order.qty, 100);
    assert_eq!(eod_order.side, "sell");

    // Close order fills; the sweep closes the item.
    h.broker.fill_order(&eod_order.broker_order_id, 100, 940.0);
    h.watcher.poll_orders_once().await.unwrap();
    h.eod.tick().await.unwrap();

    let item = h.item(item.id).await;
    assert_eq!(item.status, "CLOSED");
    assert_eq!(item.close_outcome.as_deref(), Some("EOD"));
    let job = BatchRepo::find(&h.db, batch_id).await.unwrap().unwrap();
    assert_eq!(job.status, "DONE");
}

#[tokio::test]
async fn second_leg_rejection_rolls_back_first_leg() {
    let mut h = harness().await;
    let batch_id = h
        .sup
        .create_batch("op", immediate_batch("B-ROLL"), vec![cash_buy_item("9432", 100, 1000, 900)])
        .await
        .unwrap();

    h.activate_and_submit().await;
    let item = h.only_item(batch_id).await;
    let entry_id = item.entry_order_id.clone().unwrap();
    h.broker.fill_order(&entry_id, 100, 950.0);
    h.watcher.poll_orders_once().await.unwrap();

    // TP accepted, SL refused.
    h.broker.queue_send_ok();
    h.broker.queue_send_error(BrokerError::Rejected {
        code: Some("4001010".to_string()),
        message: "stop orders disabled".to_string(),
    });
    h.oco.handle_item(item.id).await.unwrap();

    let item = h.item(item.id).await;
    assert_eq!(item.status, "ERROR");
    assert!(item
        .last_error
        .as_deref()
        .unwrap()
        .contains("BRACKET_SECOND_LEG_REJECTED"));

    // The surviving TP was cancelled.
    let tp_id = h.broker.acked_ids()[1].clone();
    assert_eq!(h.broker.cancelled_ids(), vec![tp_id]);

    // The intent row never activated.
    let groups = OcoRepo::groups_for_item(&h.db, item.id).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].status, "CLOSED");
    assert!(groups[0].tp_order_id.is_none());

    assert_eq!(
        EventRepo::by_type(&h.db, "BRACKET_ROLLED_BACK").await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn restart_never_resubmits_a_recorded_entry() {
    let mut h = harness().await;
    let batch_id = h
        .sup
        .create_batch("op", immediate_batch("B-RST"), vec![cash_buy_item("9432", 100, 1000, 900)])
        .await
        .unwrap();

    // Crash window: the entry order row was persisted but the item never
    // left READY.
    h.scheduler.tick().await.unwrap();
    let _ = h.run_rx.try_recv();
    let item = h.only_item(batch_id).await;
    OrderRepo::insert(
        &h.db,
        daybatch_store::NewOrder {
            batch_item_id: item.id,
            role: daybatch_core::OrderRole::Entry,
            broker_order_id: "PRE-1".to_string(),
            client_ref: None,
            side: OrderSide::Buy,
            qty: 100,
            kind: daybatch_core::OrderKind::Market,
            price: None,
            trigger_price: None,
        },
        h.clock.now_ms(),
    )
    .await
    .unwrap();

    // Restarted engine re-runs the batch: no broker submit happens.
    h.executor.run_batch(batch_id).await.unwrap();
    assert!(h.broker.sent_payloads().is_empty());
    let item = h.item(item.id).await;
    assert_eq!(item.status, "ENTRY_SENT");
    assert_eq!(item.entry_order_id.as_deref(), Some("PRE-1"));

    // Running it again changes nothing further.
    h.executor.run_batch(batch_id).await.unwrap();
    assert!(h.broker.sent_payloads().is_empty());
}

#[tokio::test]
async fn missed_schedule_errors_instead_of_firing() {
    let mut h = harness().await;
    let now = h.clock.now_ms();
    let batch = NewBatch {
        batch_code: "B-MISS".to_string(),
        name: "stale".to_string(),
        run_mode: RunMode::Scheduled,
        scheduled_at: Some(now - 400_000),
        eod_close_time: "14:30".to_string(),
        eod_force_close: true,
    };
    let batch_id = h
        .sup
        .create_batch("op", batch, vec![cash_buy_item("9432", 100, 1000, 900)])
        .await
        .unwrap();

    let (triggered, missed) = h.scheduler.tick().await.unwrap();
    assert_eq!((triggered, missed), (0, 1));
    assert!(h.run_rx.try_recv().is_err());

    let job = BatchRepo::find(&h.db, batch_id).await.unwrap().unwrap();
    assert_eq!(job.status, "ERROR");
    assert_eq!(job.last_error.as_deref(), Some("SCHEDULE_MISSED"));
    assert!(h.broker.sent_payloads().is_empty());
    assert_eq!(EventRepo::by_type(&h.db, "SCHEDULE_MISSED").await.unwrap().len(), 1);

    let runs = daybatch_store::SchedulerRunRepo::recent(&h.db, 1).await.unwrap();
    assert_eq!(runs[0].triggered, 0);
    assert_eq!(runs[0].missed, 1);
}

#[tokio::test]
async fn entry_rejection_parks_item_and_batch_continues() {
    let mut h = harness().await;
    let batch_id = h
        .sup
        .create_batch(
            "op",
            immediate_batch("B-REJ"),
            vec![
                cash_buy_item("9431", 100, 1000, 900),
                cash_buy_item("9432", 100, 1000, 900),
            ],
        )
        .await
        .unwrap();

    h.broker.queue_send_error(BrokerError::Rejected {
        code: Some("4001001".to_string()),
        message: "symbol suspended".to_string(),
    });
    h.activate_and_submit().await;

    let items = ItemRepo::items_of(&h.db, batch_id).await.unwrap();
    assert_eq!(items[0].status, "ERROR");
    assert!(items[0].last_error.as_deref().unwrap().contains("symbol suspended"));
    // The second item still went out.
    assert_eq!(items[1].status, "ENTRY_SENT");
    assert_eq!(h.broker.sent_payloads().len(), 2);
}

#[tokio::test]
async fn overfill_race_is_detected_and_parked() {
    let mut h = harness().await;
    let batch_id = h
        .sup
        .create_batch("op", immediate_batch("B-OVR"), vec![cash_buy_item("9432", 100, 1000, 900)])
        .await
        .unwrap();

    h.activate_and_submit().await;
    let item = h.only_item(batch_id).await;
    let entry_id = item.entry_order_id.clone().unwrap();
    h.broker.fill_order(&entry_id, 100, 950.0);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.handle_item(item.id).await.unwrap();

    // Both legs report FILLED before either cancel lands.
    let ids = h.broker.acked_ids();
    h.broker.fill_order(&ids[1], 100, 1000.0);
    h.broker.fill_order(&ids[2], 100, 900.0);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.scan().await.unwrap();

    let item = h.item(item.id).await;
    assert_eq!(item.status, "ERROR");
    assert_eq!(item.last_error.as_deref(), Some("OVERFILL_DETECTED"));

    let groups = OcoRepo::groups_for_item(&h.db, item.id).await.unwrap();
    assert_eq!(groups[0].status, "CLOSED");
    assert_eq!(EventRepo::by_type(&h.db, "OVERFILL_DETECTED").await.unwrap().len(), 1);

    let audits = daybatch_store::AuditRepo::recent(&h.db, 10).await.unwrap();
    assert!(audits.iter().any(|a| a.action == "overfill_detected"));
}

#[tokio::test]
async fn mixed_tp_sl_close_across_slices() {
    let mut h = harness().await;
    let mut spec = cash_buy_item("9434", 100, 520, 480);
    spec.entry_type = EntryType::Limit;
    spec.entry_price = Some(Price::new(dec!(500)));
    let batch_id = h
        .sup
        .create_batch("op", immediate_batch("B-MIX"), vec![spec])
        .await
        .unwrap();

    h.activate_and_submit().await;
    let item = h.only_item(batch_id).await;
    let entry_id = item.entry_order_id.clone().unwrap();

    // Slice A: 30, slice B: 70.
    h.broker.partial_fill_order(&entry_id, 30, 500.0);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.handle_item(item.id).await.unwrap();
    h.broker.fill_order(&entry_id, 100, 500.0);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.handle_item(item.id).await.unwrap();

    let groups = OcoRepo::groups_for_item(&h.db, item.id).await.unwrap();
    assert_eq!(groups.iter().map(|g| g.qty).collect::<Vec<_>>(), vec![30, 70]);

    // TP of A fills, SL of B fills.
    let ids = h.broker.acked_ids();
    let (tp_a, sl_b) = (ids[1].clone(), ids[4].clone());
    h.broker.fill_order(&tp_a, 30, 520.0);
    h.broker.fill_order(&sl_b, 70, 480.0);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.scan().await.unwrap();
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.scan().await.unwrap();

    let item = h.item(item.id).await;
    assert_eq!(item.status, "CLOSED");
    assert_eq!(item.close_outcome.as_deref(), Some("MIXED"));
    assert_eq!(item.closed_qty, 100);
}

#[tokio::test]
async fn orphan_broker_orders_are_reported_once_and_not_adopted() {
    let h = harness().await;
    h.broker.inject_order(daybatch_broker::OrderSnapshot {
        id: "GHOST-1".to_string(),
        state: 1,
        symbol: "9999".to_string(),
        qty: 100,
        ..Default::default()
    });

    h.watcher.poll_orders_once().await.unwrap();
    // Replaying the poll produces no second report.
    h.watcher.poll_orders_once().await.unwrap();

    let events = EventRepo::by_type(&h.db, "ORPHAN_ORDER").await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].message.contains("GHOST-1"));
    assert!(OrderRepo::find_by_broker_id(&h.db, "GHOST-1").await.unwrap().is_none());
}

#[tokio::test]
async fn hold_wait_times_out_into_position_not_available() {
    let mut h = harness().await;
    let spec = NewItem {
        symbol: "9433".to_string(),
        exchange: 9,
        product: Product::Margin,
        side: OrderSide::Sell,
        qty: 200,
        entry_type: EntryType::Market,
        entry_price: None,
        tp_price: Price::new(dec!(1800)),
        sl_trigger_price: Price::new(dec!(2050)),
    };
    let batch_id = h
        .sup
        .create_batch("op", immediate_batch("B-HOLD"), vec![spec])
        .await
        .unwrap();

    h.activate_and_submit().await;
    let item = h.only_item(batch_id).await;
    let entry_id = item.entry_order_id.clone().unwrap();
    h.broker.fill_order(&entry_id, 200, 2000.0);
    h.watcher.poll_orders_once().await.unwrap();

    // First attempt starts the wait window.
    h.oco.handle_item(item.id).await.unwrap();
    assert_eq!(h.item(item.id).await.status, "ENTRY_FILLED");

    // Past the bounded window the item is parked.
    h.clock.advance_ms(11_000);
    let result = h.oco.handle_item(item.id).await;
    assert!(result.is_err());
    let item = h.item(item.id).await;
    assert_eq!(item.status, "ERROR");
    assert_eq!(item.last_error.as_deref(), Some("POSITION_NOT_AVAILABLE"));
}

#[tokio::test]
async fn supervisor_validation_rejects_bad_plans() {
    let h = harness().await;

    // Brackets on the wrong side of a limit entry.
    let mut bad = cash_buy_item("9432", 100, 450, 400);
    bad.entry_type = EntryType::Limit;
    bad.entry_price = Some(Price::new(dec!(500)));
    let err = h
        .sup
        .create_batch("op", immediate_batch("B-V1"), vec![bad])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("wrong side"));

    // Limit entry without a price.
    let mut missing = cash_buy_item("9432", 100, 1000, 900);
    missing.entry_type = EntryType::Limit;
    let err = h
        .sup
        .create_batch("op", immediate_batch("B-V2"), vec![missing])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("requires entry_price"));

    // Nothing was persisted by the failed commands.
    assert!(BatchRepo::find_by_code(&h.db, "B-V1").await.unwrap().is_none());
    assert!(BatchRepo::find_by_code(&h.db, "B-V2").await.unwrap().is_none());
}

#[tokio::test]
async fn symbol_lookup_resolves_display_name() {
    let h = harness().await;
    h.broker.set_symbol_name("9432", "Nippon Telegraph and Telephone");
    assert_eq!(
        h.sup.lookup_symbol_name("9432").await.unwrap().as_deref(),
        Some("Nippon Telegraph and Telephone")
    );
    assert_eq!(h.sup.lookup_symbol_name("0000").await.unwrap(), None);
}

#[tokio::test]
async fn pause_stops_submits_and_resume_continues() {
    let mut h = harness().await;
    let batch_id = h
        .sup
        .create_batch(
            "op",
            immediate_batch("B-PAUSE"),
            vec![
                cash_buy_item("9431", 100, 1000, 900),
                cash_buy_item("9432", 100, 1000, 900),
            ],
        )
        .await
        .unwrap();

    h.scheduler.tick().await.unwrap();
    let _ = h.run_rx.try_recv();
    h.sup.pause_batch("op", batch_id, "manual hold").await.unwrap();

    // A paused batch submits nothing.
    h.executor.run_batch(batch_id).await.unwrap();
    assert!(h.broker.sent_payloads().is_empty());

    h.sup.resume_batch("op", batch_id, "resuming").await.unwrap();
    h.executor.run_batch(batch_id).await.unwrap();
    assert_eq!(h.broker.sent_payloads().len(), 2);

    let audits = daybatch_store::AuditRepo::recent(&h.db, 10).await.unwrap();
    assert!(audits.iter().any(|a| a.action == "pause_batch"));
    assert!(audits.iter().any(|a| a.action == "resume_batch"));
}

#[tokio::test]
async fn panic_stop_cancels_scheduled_and_flattens_running() {
    let mut h = harness().await;
    let scheduled_id = h
        .sup
        .create_batch(
            "op",
            NewBatch {
                batch_code: "B-SCHED".to_string(),
                name: "later".to_string(),
                run_mode: RunMode::Scheduled,
                scheduled_at: Some(h.clock.now_ms() + 3_600_000),
                eod_close_time: "14:30".to_string(),
                eod_force_close: true,
            },
            vec![cash_buy_item("9431", 100, 1000, 900)],
        )
        .await
        .unwrap();
    let running_id = h
        .sup
        .create_batch("op", immediate_batch("B-RUN"), vec![cash_buy_item("9432", 100, 1000, 900)])
        .await
        .unwrap();

    h.activate_and_submit().await;
    let item = h.only_item(running_id).await;
    let entry_id = item.entry_order_id.clone().unwrap();
    h.broker.fill_order(&entry_id, 100, 950.0);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.handle_item(item.id).await.unwrap();

    h.sup.panic_stop_all("op", "fat finger").await.unwrap();

    let scheduled = BatchRepo::find(&h.db, scheduled_id).await.unwrap().unwrap();
    assert_eq!(scheduled.status, "CANCELLED");

    // The running item was flattened through the EOD algorithm.
    let item = h.item(item.id).await;
    assert_eq!(item.status, "EOD_MARKET_SENT");

    let audits = daybatch_store::AuditRepo::recent(&h.db, 10).await.unwrap();
    assert!(audits.iter().any(|a| a.action == "panic_stop_all"));
    assert_eq!(EventRepo::by_type(&h.db, "PANIC_STOP").await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancel_item_brackets_leaves_position_deliberately_bare() {
    let mut h = harness().await;
    let batch_id = h
        .sup
        .create_batch("op", immediate_batch("B-BARE"), vec![cash_buy_item("9432", 100, 1000, 900)])
        .await
        .unwrap();

    h.activate_and_submit().await;
    let item = h.only_item(batch_id).await;
    let entry_id = item.entry_order_id.clone().unwrap();
    h.broker.fill_order(&entry_id, 100, 950.0);
    h.watcher.poll_orders_once().await.unwrap();
    h.oco.handle_item(item.id).await.unwrap();

    h.sup
        .cancel_item_brackets("op", item.id, "news event, manual exit planned")
        .await
        .unwrap();
    assert_eq!(h.broker.cancelled_ids().len(), 2);

    h.watcher.poll_orders_once().await.unwrap();
    h.oco.scan().await.unwrap();

    // Group closed with no winner; the item keeps its open position.
    let groups = OcoRepo::groups_for_item(&h.db, item.id).await.unwrap();
    assert_eq!(groups[0].status, "CLOSED");
    let item = h.item(item.id).await;
    assert_eq!(item.status, "BRACKET_SENT");
    assert_eq!(item.closed_qty, 0);
}

#[tokio::test]
async fn preparing_intent_from_previous_run_parks_item() {
    let mut h = harness().await;
    let batch_id = h
        .sup
        .create_batch("op", immediate_batch("B-PREP"), vec![cash_buy_item("9432", 100, 1000, 900)])
        .await
        .unwrap();

    h.activate_and_submit().await;
    let item = h.only_item(batch_id).await;
    let entry_id = item.entry_order_id.clone().unwrap();
    h.broker.fill_order(&entry_id, 100, 950.0);
    h.watcher.poll_orders_once().await.unwrap();

    // Simulate a crash that left a PREPARING intent behind.
    OcoRepo::create_preparing(&h.db, item.id, 100, None, h.clock.now_ms())
        .await
        .unwrap();

    h.oco.recover().await.unwrap();

    let item = h.item(item.id).await;
    assert_eq!(item.status, "ERROR");
    assert_eq!(item.last_error.as_deref(), Some("BRACKET_INTENT_UNRESOLVED"));
    let groups = OcoRepo::groups_for_item(&h.db, item.id).await.unwrap();
    assert_eq!(groups[0].status, "CLOSED");
    assert_eq!(
        EventRepo::by_type(&h.db, "BRACKET_INTENT_UNRESOLVED").await.unwrap().len(),
        1
    );
}
