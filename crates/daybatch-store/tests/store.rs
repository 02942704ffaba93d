//! Store-level behavior: conditional claims, guarded transitions,
//! poll idempotency and the uniqueness rules the engine relies on.

use daybatch_core::{
    EntryType, EventLevel, ItemState, OcoStatus, OrderKind, OrderRole, OrderSide, OrderStatus,
    Price, Product, RunMode,
};
use daybatch_store::{
    establish_connection, BatchRepo, EventRepo, ItemChanges, ItemRepo, NewBatch, NewItem, NewOrder,
    OcoRepo, OrderRepo, PollOutcome, PollUpdate, StoreError,
};
use rust_decimal::Decimal;
use sea_orm::DatabaseConnection;

const NOW: i64 = 1_772_400_000_000;

fn price(v: i64) -> Price {
    Price::new(Decimal::from(v))
}

fn new_batch(code: &str, mode: RunMode, scheduled_at: Option<i64>) -> NewBatch {
    NewBatch {
        batch_code: code.to_string(),
        name: "morning".to_string(),
        run_mode: mode,
        scheduled_at,
        eod_close_time: "14:30".to_string(),
        eod_force_close: true,
    }
}

fn new_item(symbol: &str) -> NewItem {
    NewItem {
        symbol: symbol.to_string(),
        exchange: 9,
        product: Product::Cash,
        side: OrderSide::Buy,
        qty: 100,
        entry_type: EntryType::Market,
        entry_price: None,
        tp_price: price(1000),
        sl_trigger_price: price(900),
    }
}

async fn setup() -> DatabaseConnection {
    establish_connection("sqlite::memory:").await.unwrap()
}

async fn setup_with_item() -> (DatabaseConnection, i64, i64) {
    let db = setup().await;
    let job = BatchRepo::create(
        &db,
        new_batch("B-1", RunMode::Immediate, None),
        vec![new_item("9432")],
        NOW,
    )
    .await
    .unwrap();
    let item_id = ItemRepo::items_of(&db, job.id).await.unwrap()[0].id;
    (db, job.id, item_id)
}

#[tokio::test]
async fn claim_is_exactly_once() {
    let (db, job_id, _) = setup_with_item().await;

    assert!(BatchRepo::claim_running(&db, job_id, NOW).await.unwrap());
    // Losing claimers observe zero rows changed.
    assert!(!BatchRepo::claim_running(&db, job_id, NOW).await.unwrap());

    let job = BatchRepo::find(&db, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, "RUNNING");
    assert_eq!(job.started_at, Some(NOW));
}

#[tokio::test]
async fn due_scan_covers_immediate_and_past_scheduled() {
    let db = setup().await;
    BatchRepo::create(&db, new_batch("IMM", RunMode::Immediate, None), vec![new_item("1")], NOW)
        .await
        .unwrap();
    BatchRepo::create(
        &db,
        new_batch("PAST", RunMode::Scheduled, Some(NOW - 1_000)),
        vec![new_item("2")],
        NOW,
    )
    .await
    .unwrap();
    BatchRepo::create(
        &db,
        new_batch("FUTURE", RunMode::Scheduled, Some(NOW + 60_000)),
        vec![new_item("3")],
        NOW,
    )
    .await
    .unwrap();

    let due = BatchRepo::due(&db, NOW).await.unwrap();
    let codes: Vec<&str> = due.iter().map(|j| j.batch_code.as_str()).collect();
    assert_eq!(codes, vec!["IMM", "PAST"]);
}

#[tokio::test]
async fn duplicate_batch_code_is_refused() {
    let db = setup().await;
    BatchRepo::create(&db, new_batch("B-1", RunMode::Immediate, None), vec![new_item("1")], NOW)
        .await
        .unwrap();
    let dup = BatchRepo::create(
        &db,
        new_batch("B-1", RunMode::Immediate, None),
        vec![new_item("2")],
        NOW,
    )
    .await;
    assert!(dup.is_err());
}

#[tokio::test]
async fn transition_guards_status_and_version() {
    let (db, _, item_id) = setup_with_item().await;
    let item = ItemRepo::get(&db, item_id).await.unwrap();

    // Illegal jump is refused before any write.
    let err = ItemRepo::transition(&db, &item, ItemState::BracketSent, ItemChanges::default(), NOW)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::IllegalTransition { .. }));

    // Legal transition succeeds and bumps the version.
    assert!(ItemRepo::transition(
        &db,
        &item,
        ItemState::EntrySent,
        ItemChanges {
            entry_order_id: Some("A1".to_string()),
            ..Default::default()
        },
        NOW,
    )
    .await
    .unwrap());

    // Re-running with the stale snapshot loses the race.
    let stale_attempt = ItemRepo::transition(
        &db,
        &item,
        ItemState::EntrySent,
        ItemChanges::default(),
        NOW,
    )
    .await
    .unwrap();
    assert!(!stale_attempt);

    let fresh = ItemRepo::get(&db, item_id).await.unwrap();
    assert_eq!(fresh.status, "ENTRY_SENT");
    assert_eq!(fresh.version, item.version + 1);
    assert_eq!(fresh.entry_order_id.as_deref(), Some("A1"));
}

#[tokio::test]
async fn terminal_items_never_move_again() {
    let (db, _, item_id) = setup_with_item().await;

    assert!(ItemRepo::mark_error(&db, item_id, "broker refused", NOW).await.unwrap());
    // Second error mark is a no-op, not a transition.
    assert!(!ItemRepo::mark_error(&db, item_id, "again", NOW).await.unwrap());

    let item = ItemRepo::get(&db, item_id).await.unwrap();
    assert_eq!(item.status, "ERROR");
    assert_eq!(item.last_error.as_deref(), Some("broker refused"));

    let err = ItemRepo::transition(&db, &item, ItemState::Closed, ItemChanges::default(), NOW)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::IllegalTransition { .. }));
}

#[tokio::test]
async fn plan_fields_lock_while_batch_active() {
    let (db, job_id, item_id) = setup_with_item().await;

    // Editable while SCHEDULED.
    BatchRepo::update_item_plan(&db, item_id, Some(200), None, None, None, NOW)
        .await
        .unwrap();

    BatchRepo::claim_running(&db, job_id, NOW).await.unwrap();
    let err = BatchRepo::update_item_plan(&db, item_id, Some(300), None, None, None, NOW)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::PlanLocked(_)));

    let item = ItemRepo::get(&db, item_id).await.unwrap();
    assert_eq!(item.qty, 200);
}

#[tokio::test]
async fn broker_order_id_is_globally_unique() {
    let (db, _, item_id) = setup_with_item().await;
    let order = |id: &str| NewOrder {
        batch_item_id: item_id,
        role: OrderRole::Entry,
        broker_order_id: id.to_string(),
        client_ref: None,
        side: OrderSide::Buy,
        qty: 100,
        kind: OrderKind::Market,
        price: None,
        trigger_price: None,
    };

    OrderRepo::insert(&db, order("DUP-1"), NOW).await.unwrap();
    let err = OrderRepo::insert(&db, order("DUP-1"), NOW).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateBrokerOrderId(_)));
}

#[tokio::test]
async fn poll_replay_produces_no_new_fills() {
    let (db, _, item_id) = setup_with_item().await;
    let order = OrderRepo::insert(
        &db,
        NewOrder {
            batch_item_id: item_id,
            role: OrderRole::Entry,
            broker_order_id: "A1".to_string(),
            client_ref: None,
            side: OrderSide::Buy,
            qty: 100,
            kind: OrderKind::Market,
            price: None,
            trigger_price: None,
        },
        NOW,
    )
    .await
    .unwrap();

    let update = PollUpdate {
        status: OrderStatus::Partial,
        cum_qty: 30,
        avg_price: Some(price(500)),
        raw_json: None,
    };
    let first = OrderRepo::apply_poll(&db, "A1", update.clone(), NOW).await.unwrap();
    match first {
        PollOutcome::Applied { fill_delta, fill_price, .. } => {
            assert_eq!(fill_delta, 30);
            assert_eq!(fill_price, Some(price(500)));
        }
        other => panic!("expected Applied, got {other:?}"),
    }

    // Identical snapshot replayed: no fills, no version bump.
    let replay = OrderRepo::apply_poll(&db, "A1", update, NOW + 1_000).await.unwrap();
    assert!(matches!(replay, PollOutcome::Unchanged));
    assert_eq!(OrderRepo::fills_for_order(&db, order.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn poll_synthesizes_delta_fill_price() {
    let (db, _, item_id) = setup_with_item().await;
    OrderRepo::insert(
        &db,
        NewOrder {
            batch_item_id: item_id,
            role: OrderRole::Entry,
            broker_order_id: "A2".to_string(),
            client_ref: None,
            side: OrderSide::Buy,
            qty: 300,
            kind: OrderKind::Limit,
            price: Some(price(500)),
            trigger_price: None,
        },
        NOW,
    )
    .await
    .unwrap();

    // 100 @ 500.
    OrderRepo::apply_poll(
        &db,
        "A2",
        PollUpdate {
            status: OrderStatus::Partial,
            cum_qty: 100,
            avg_price: Some(price(500)),
            raw_json: None,
        },
        NOW,
    )
    .await
    .unwrap();

    // Aggregate moves to 300 @ 500.67 -> synthetic 200-share fill near 501.
    let avg = Price::new(Decimal::new(500_666_667, 6));
    let outcome = OrderRepo::apply_poll(
        &db,
        "A2",
        PollUpdate {
            status: OrderStatus::Filled,
            cum_qty: 300,
            avg_price: Some(avg),
            raw_json: None,
        },
        NOW + 500,
    )
    .await
    .unwrap();

    match outcome {
        PollOutcome::Applied { fill_delta, fill_price, new_status, .. } => {
            assert_eq!(fill_delta, 200);
            assert_eq!(new_status, OrderStatus::Filled);
            let synthetic = fill_price.unwrap().inner();
            assert!((synthetic - Decimal::from(501)).abs() < Decimal::new(1, 2));
        }
        other => panic!("expected Applied, got {other:?}"),
    }
}

#[tokio::test]
async fn poll_ignores_regressions_and_terminal_rows() {
    let (db, _, item_id) = setup_with_item().await;
    OrderRepo::insert(
        &db,
        NewOrder {
            batch_item_id: item_id,
            role: OrderRole::Entry,
            broker_order_id: "A3".to_string(),
            client_ref: None,
            side: OrderSide::Buy,
            qty: 100,
            kind: OrderKind::Market,
            price: None,
            trigger_price: None,
        },
        NOW,
    )
    .await
    .unwrap();

    OrderRepo::apply_poll(
        &db,
        "A3",
        PollUpdate {
            status: OrderStatus::Filled,
            cum_qty: 100,
            avg_price: Some(price(950)),
            raw_json: None,
        },
        NOW,
    )
    .await
    .unwrap();

    // Terminal order: later snapshots are no-ops.
    let late = OrderRepo::apply_poll(
        &db,
        "A3",
        PollUpdate {
            status: OrderStatus::Cancelled,
            cum_qty: 0,
            avg_price: None,
            raw_json: None,
        },
        NOW + 100,
    )
    .await
    .unwrap();
    assert!(matches!(late, PollOutcome::Unchanged));

    let unknown = OrderRepo::apply_poll(
        &db,
        "GHOST",
        PollUpdate {
            status: OrderStatus::Working,
            cum_qty: 0,
            avg_price: None,
            raw_json: None,
        },
        NOW,
    )
    .await
    .unwrap();
    assert!(matches!(unknown, PollOutcome::Unknown));
}

#[tokio::test]
async fn oco_group_lifecycle_and_race_detection() {
    let (db, _, item_id) = setup_with_item().await;

    let group = OcoRepo::create_preparing(&db, item_id, 100, None, NOW).await.unwrap();
    assert_eq!(group.status, "PREPARING");
    assert_eq!(OcoRepo::covered_qty(&db, item_id).await.unwrap(), 100);

    assert!(OcoRepo::activate(&db, group.id, "TP-1", "SL-1", NOW).await.unwrap());
    assert!(!OcoRepo::activate(&db, group.id, "TP-1", "SL-1", NOW).await.unwrap());

    // First completed leg wins the conditional update...
    assert!(OcoRepo::mark_leg_filled(&db, group.id, OcoStatus::TpFilled, NOW).await.unwrap());
    // ...and the losing leg observes the race instead of overwriting.
    assert!(!OcoRepo::mark_leg_filled(&db, group.id, OcoStatus::SlFilled, NOW).await.unwrap());

    assert!(OcoRepo::close(&db, group.id, NOW).await.unwrap());
    let closed = OcoRepo::find(&db, group.id).await.unwrap().unwrap();
    assert_eq!(closed.status, "CLOSED");
    assert_eq!(closed.closed_at, Some(NOW));
}

#[tokio::test]
async fn abandoned_intent_rows_close_without_activating() {
    let (db, _, item_id) = setup_with_item().await;
    let group = OcoRepo::create_preparing(&db, item_id, 50, None, NOW).await.unwrap();
    assert_eq!(OcoRepo::preparing_groups(&db).await.unwrap().len(), 1);

    assert!(OcoRepo::abandon(&db, group.id, NOW).await.unwrap());
    assert!(OcoRepo::preparing_groups(&db).await.unwrap().is_empty());
    // Never activated, so it cannot be closed as a completed pair twice.
    assert!(!OcoRepo::close(&db, group.id, NOW).await.unwrap());
}

#[tokio::test]
async fn finalize_reflects_item_outcomes() {
    let db = setup().await;
    let job = BatchRepo::create(
        &db,
        new_batch("B-F", RunMode::Immediate, None),
        vec![new_item("9432"), new_item("9433")],
        NOW,
    )
    .await
    .unwrap();
    BatchRepo::claim_running(&db, job.id, NOW).await.unwrap();
    let items = ItemRepo::items_of(&db, job.id).await.unwrap();

    // One item still open: no finalization.
    ItemRepo::mark_error(&db, items[0].id, "rejected", NOW).await.unwrap();
    assert!(BatchRepo::finalize_if_done(&db, job.id, NOW).await.unwrap().is_none());

    let second = ItemRepo::get(&db, items[1].id).await.unwrap();
    ItemRepo::transition(&db, &second, ItemState::Closed, ItemChanges::default(), NOW)
        .await
        .unwrap();

    let status = BatchRepo::finalize_if_done(&db, job.id, NOW).await.unwrap();
    assert_eq!(status, Some(daybatch_core::BatchStatus::Error));
    let job = BatchRepo::find(&db, job.id).await.unwrap().unwrap();
    assert_eq!(job.finished_at, Some(NOW));
}

#[tokio::test]
async fn events_are_append_only_and_queryable() {
    let (db, job_id, item_id) = setup_with_item().await;
    EventRepo::append(&db, Some(job_id), Some(item_id), EventLevel::Info, "ORDER_SENT", "A1", NOW)
        .await
        .unwrap();
    EventRepo::append(&db, Some(job_id), None, EventLevel::Warn, "ORPHAN_ORDER", "X9", NOW)
        .await
        .unwrap();

    let events = EventRepo::for_job(&db, job_id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, "ORDER_SENT");
    assert_eq!(EventRepo::by_type(&db, "ORPHAN_ORDER").await.unwrap().len(), 1);
}
