mod common;

use common::{MockBackend, SCOPE, canonical_item, canonical_order, item, local_orders, order};
use pos_sync::{
    Action, ActionStatus, ActionType, BackendError, ConnectivityMonitor, EngineConfig, ErrorKind,
    LocalRecord, LocalStore, Order, OrderStatus, OutboxConfig, PullConfig, PullStep, Query,
    QueueStats, RecordKey, Step, SyncEngine, SyncError, Table, TimeWindow, UserConfirmed,
};

struct Fixture {
    store: LocalStore,
    net: ConnectivityMonitor,
    config: EngineConfig,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    fn with_config(config: EngineConfig) -> Self {
        Self {
            store: LocalStore::open_in_memory().unwrap(),
            net: ConnectivityMonitor::new(false),
            config,
        }
    }

    fn engine<'a>(&'a self, backend: &'a MockBackend) -> SyncEngine<'a, &'a MockBackend> {
        SyncEngine::new(&self.store, backend, &self.net, &self.config)
    }
}

#[test]
fn offline_order_is_confirmed_and_reconciled() {
    let fx = Fixture::new();
    let backend = MockBackend::starting_at(42);
    let engine = fx.engine(&backend);

    let created = engine
        .create_order_offline(SCOPE, order(OrderStatus::InProgress), vec![item("menu-hummus")])
        .unwrap();
    let local_id = created.order.key.id().to_string();
    assert!(created.order.is_offline);
    assert!(backend.calls().is_empty());

    let report = engine
        .handle_connectivity_change(true, SCOPE)
        .unwrap()
        .expect("coming online runs a cycle");
    assert!(report.success(), "{report:?}");
    let drain = report.drain.done().unwrap();
    assert_eq!(drain.completed, 1);
    let reconciled = report.reconcile.done().unwrap();
    assert_eq!(reconciled.deleted_local, 1);
    assert_eq!(reconciled.deleted_children, 1);
    assert!(matches!(report.pull, Step::Done(PullStep::InitialLoad(_))));

    let orders = local_orders(&fx.store);
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].key.id(), "S-42");
    assert!(!orders[0].pending_sync && !orders[0].is_offline);
    assert!(fx.store.get(Table::Orders, SCOPE, &local_id).unwrap().is_none());

    let items = fx
        .store
        .query(Table::OrderItems, SCOPE, Query::Parent("S-42"))
        .unwrap();
    assert_eq!(items.len(), 1);
    assert!(!items[0].key.is_local());

    assert_eq!(
        engine.queue_stats(SCOPE).unwrap(),
        QueueStats {
            pending: 0,
            in_flight: 0,
            failed: 0,
            completed: 1,
        }
    );
}

#[test]
fn replayed_payload_creates_one_canonical_order() {
    let fx = Fixture::new();
    let backend = MockBackend::new();
    backend.lose_responses(1);
    let engine = fx.engine(&backend);
    engine
        .create_order_offline(SCOPE, order(OrderStatus::InProgress), vec![])
        .unwrap();
    fx.net.set_online(true);

    let first = engine.run_sync_cycle(SCOPE).unwrap();
    let failure = &first.drain.done().unwrap().failures[0];
    assert_eq!(failure.failure.kind, ErrorKind::NetworkError);
    assert!(failure.will_retry);

    let second = engine.run_sync_cycle(SCOPE).unwrap();
    assert_eq!(second.drain.done().unwrap().completed, 1);

    let calls = backend.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].idempotency_key, calls[1].idempotency_key);
    assert_eq!(backend.rows(Table::Orders).len(), 1);
    assert_eq!(local_orders(&fx.store).len(), 1);
}

#[test]
fn dependent_actions_apply_in_creation_order() {
    let fx = Fixture::new();
    let backend = MockBackend::starting_at(42);
    backend.seed(Table::Orders, canonical_order("S-7", OrderStatus::InProgress, 2));
    let engine = fx.engine(&backend);
    fx.net.set_online(true);
    engine.run_sync_cycle(SCOPE).unwrap();
    fx.net.set_online(false);

    let a = engine
        .create_order_offline(SCOPE, order(OrderStatus::InProgress), vec![])
        .unwrap();
    let local_id = a.order.key.id().to_string();
    let b = engine
        .update_order_status(SCOPE, &local_id, OrderStatus::Ready)
        .unwrap();
    let c = engine
        .update_order_status(SCOPE, "S-7", OrderStatus::Completed)
        .unwrap();
    assert!(a.action.id < b.id && b.id < c.id);

    engine.handle_connectivity_change(true, SCOPE).unwrap();
    let calls = backend.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].idempotency_key, a.action.payload.idempotency_key);
    assert_eq!(calls[1].idempotency_key, b.payload.idempotency_key);
    // B reached the backend already pointing at the confirmed order.
    assert_eq!(calls[1].action.order_ref(), "S-42");
    assert_eq!(calls[2].idempotency_key, c.payload.idempotency_key);

    let s42: pos_sync::LocalRecord<Order> = fx.store.get_record(SCOPE, "S-42").unwrap().unwrap();
    assert_eq!(s42.fields.status, OrderStatus::Ready);
    assert_eq!(
        backend.row(Table::Orders, "S-42").unwrap().status.as_deref(),
        Some("ready")
    );
}

#[test]
fn failed_create_holds_back_its_successors_only() {
    let fx = Fixture::new();
    let backend = MockBackend::starting_at(42);
    backend.seed(Table::Orders, canonical_order("S-7", OrderStatus::InProgress, 2));
    let engine = fx.engine(&backend);
    fx.net.set_online(true);
    engine.run_sync_cycle(SCOPE).unwrap();
    fx.net.set_online(false);

    let a = engine
        .create_order_offline(SCOPE, order(OrderStatus::InProgress), vec![])
        .unwrap();
    let b = engine
        .update_order_status(SCOPE, a.order.key.id(), OrderStatus::Ready)
        .unwrap();
    let c = engine
        .update_order_status(SCOPE, "S-7", OrderStatus::Ready)
        .unwrap();

    backend.fail_next(BackendError::Network("timeout".into()));
    let report = engine.handle_connectivity_change(true, SCOPE).unwrap().unwrap();
    let drain = report.drain.done().unwrap();
    assert_eq!(drain.completed, 1);
    assert_eq!(drain.blocked, 1);

    let outbox = engine.outbox();
    assert_eq!(outbox.get(a.action.id).unwrap().unwrap().status, ActionStatus::Pending);
    assert_eq!(outbox.get(b.id).unwrap().unwrap().attempts, 0);
    assert_eq!(outbox.get(c.id).unwrap().unwrap().status, ActionStatus::Completed);

    let report = engine.run_sync_cycle(SCOPE).unwrap();
    assert_eq!(report.drain.done().unwrap().completed, 2);
    assert_eq!(engine.queue_stats(SCOPE).unwrap().completed, 3);
}

#[test]
fn pull_keeps_rows_with_unconfirmed_actions() {
    let fx = Fixture::new();
    let backend = MockBackend::new();
    backend.seed(Table::Orders, canonical_order("S-7", OrderStatus::InProgress, 1));
    backend.seed(Table::OrderItems, canonical_item("SI-70", "S-7"));
    let engine = fx.engine(&backend);
    fx.net.set_online(true);
    engine.run_sync_cycle(SCOPE).unwrap();
    fx.net.set_online(false);

    engine
        .update_order_status(SCOPE, "S-7", OrderStatus::Ready)
        .unwrap();

    fx.net.set_online(true);
    let outcome = engine.pull().sync_orders(SCOPE);
    assert!(outcome.success);
    assert_eq!(outcome.skipped, 2);

    let s7 = fx.store.get(Table::Orders, SCOPE, "S-7").unwrap().unwrap();
    assert_eq!(s7.status.as_deref(), Some("ready"));
    assert!(s7.pending_sync);
    let item = fx.store.get(Table::OrderItems, SCOPE, "SI-70").unwrap().unwrap();
    assert_eq!(item.fields["item_status"], "ready");

    let report = engine.run_sync_cycle(SCOPE).unwrap();
    assert!(report.success(), "{report:?}");
    let s7 = fx.store.get(Table::Orders, SCOPE, "S-7").unwrap().unwrap();
    assert_eq!(s7.status.as_deref(), Some("ready"));
    assert!(!s7.pending_sync && !s7.is_offline);
}

#[test]
fn reconciliation_twice_deletes_nothing_the_second_time() {
    let fx = Fixture::new();
    let backend = MockBackend::new();
    let engine = fx.engine(&backend);
    engine
        .create_order_offline(SCOPE, order(OrderStatus::InProgress), vec![item("menu-tea")])
        .unwrap();
    engine.handle_connectivity_change(true, SCOPE).unwrap();

    let again = engine.reconciler().reconcile(SCOPE).unwrap();
    assert!(again.is_noop());
    let once_more = engine.reconciler().reconcile(SCOPE).unwrap();
    assert_eq!(once_more, again);

    let cycle = engine.run_sync_cycle(SCOPE).unwrap();
    assert!(cycle.reconcile.done().unwrap().is_noop());
    assert!(matches!(cycle.pull, Step::Done(PullStep::Orders(_))));
}

#[test]
fn validator_reports_each_kind_of_drift() {
    let fx = Fixture::new();
    let backend = MockBackend::new();
    backend.seed(Table::Orders, canonical_order("S-1", OrderStatus::Ready, 1));
    backend.seed(Table::Orders, canonical_order("S-2", OrderStatus::Ready, 1));
    let engine = fx.engine(&backend);

    fx.store
        .put(
            Table::Orders,
            &LocalRecord::from_canonical(canonical_order("S-2", OrderStatus::InProgress, 1)),
        )
        .unwrap();
    fx.store
        .put(
            Table::Orders,
            &LocalRecord::from_canonical(canonical_order("S-3", OrderStatus::Completed, 1)),
        )
        .unwrap();

    let offline = engine.validate(SCOPE, TimeWindow::last_days(1));
    assert!(matches!(offline, Err(SyncError::Network(_))));

    fx.net.set_online(true);
    let result = engine.validate(SCOPE, TimeWindow::last_days(1)).unwrap();
    assert_eq!(result.remote_only.len(), 1);
    assert_eq!(result.local_only.len(), 1);
    assert_eq!(result.status_mismatch.len(), 1);
    assert!(!result.is_valid);
    assert_eq!(result.remote_only[0].id, "S-1");
    assert_eq!(result.local_only[0].key.id(), "S-3");
    assert_eq!(result.status_mismatch[0].id, "S-2");

    let validator = engine.validator();
    assert_eq!(
        validator
            .delete_local_only(&result, UserConfirmed::acknowledge())
            .unwrap(),
        1
    );
    assert_eq!(
        validator
            .adopt_remote_status(&result, UserConfirmed::acknowledge())
            .unwrap(),
        1
    );
    let after = engine.validate(SCOPE, TimeWindow::last_days(1)).unwrap();
    assert!(after.local_only.is_empty() && after.status_mismatch.is_empty());
    assert_eq!(after.remote_only.len(), 1);
}

#[test]
fn truncated_remote_listing_refuses_local_only_cleanup() {
    let fx = Fixture::with_config(EngineConfig {
        pull: PullConfig {
            batch_size: 2,
            ..PullConfig::default()
        },
        ..EngineConfig::default()
    });
    let backend = MockBackend::new();
    for id in ["S-1", "S-2", "S-3"] {
        backend.seed(Table::Orders, canonical_order(id, OrderStatus::Ready, 1));
        fx.store
            .put(
                Table::Orders,
                &LocalRecord::from_canonical(canonical_order(id, OrderStatus::Ready, 1)),
            )
            .unwrap();
    }
    let engine = fx.engine(&backend);
    fx.net.set_online(true);

    let result = engine.validate(SCOPE, TimeWindow::last_days(1)).unwrap();
    assert!(!result.remote_complete);
    assert!(result.local_only.is_empty(), "{}", result.summary());
    assert!(!result.is_valid);

    let refused = engine
        .validator()
        .delete_local_only(&result, UserConfirmed::acknowledge());
    assert!(matches!(refused, Err(SyncError::State(_))));
    assert_eq!(local_orders(&fx.store).len(), 3);
}

#[test]
fn item_change_queued_behind_its_create_reaches_the_server_item() {
    let fx = Fixture::new();
    let backend = MockBackend::new();
    let engine = fx.engine(&backend);
    let created = engine
        .create_order_offline(SCOPE, order(OrderStatus::InProgress), vec![item("menu-shakshuka")])
        .unwrap();
    engine
        .enqueue_action(
            SCOPE,
            Action::UpdateItemStatus {
                order_id: created.order.key.id().to_string(),
                item_id: created.items[0].key.id().to_string(),
                new_status: OrderStatus::Ready,
            },
        )
        .unwrap();

    let report = engine
        .handle_connectivity_change(true, SCOPE)
        .unwrap()
        .expect("coming online runs a cycle");
    assert!(report.success(), "{report:?}");

    let calls = backend.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(
        &calls[1].action,
        Action::UpdateItemStatus { order_id, item_id, .. } if order_id == "S-1" && item_id == "SI-2"
    ));
    assert_eq!(
        backend.row(Table::OrderItems, "SI-2").unwrap().status.as_deref(),
        Some("ready")
    );

    let items = fx.store.query(Table::OrderItems, SCOPE, Query::All).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].key, RecordKey::Server("SI-2".into()));
    assert_eq!(items[0].fields["item_status"], "ready");
    assert!(!items[0].pending_sync);
    assert_eq!(
        engine.queue_stats(SCOPE).unwrap(),
        QueueStats {
            completed: 2,
            ..QueueStats::default()
        }
    );
}

#[test]
fn customer_item_and_payment_changes_drain_to_the_backend() {
    let fx = Fixture::new();
    let backend = MockBackend::new();
    backend.seed(Table::Orders, canonical_order("S-7", OrderStatus::InProgress, 1));
    backend.seed(Table::OrderItems, canonical_item("SI-70", "S-7"));
    let engine = fx.engine(&backend);
    engine.handle_connectivity_change(true, SCOPE).unwrap();
    engine.handle_connectivity_change(false, SCOPE).unwrap();

    for action in [
        Action::UpdateCustomer {
            order_id: "S-7".into(),
            customer_id: Some("cust-3".into()),
            customer_name: Some("Noa".into()),
            customer_phone: None,
        },
        Action::UpdateItemStatus {
            order_id: "S-7".into(),
            item_id: "SI-70".into(),
            new_status: OrderStatus::Ready,
        },
        Action::ConfirmPayment {
            order_id: "S-7".into(),
            payment_method: "card".into(),
        },
    ] {
        engine.enqueue_action(SCOPE, action).unwrap();
    }

    let report = engine
        .handle_connectivity_change(true, SCOPE)
        .unwrap()
        .expect("coming online runs a cycle");
    assert!(report.success(), "{report:?}");
    assert_eq!(report.drain.done().unwrap().completed, 3);

    let kinds = backend
        .calls()
        .iter()
        .map(|call| call.action.action_type())
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        [
            ActionType::UpdateCustomer,
            ActionType::UpdateItemStatus,
            ActionType::ConfirmPayment
        ]
    );

    let remote = backend.row(Table::Orders, "S-7").unwrap();
    assert_eq!(remote.data["customer_id"], "cust-3");
    assert_eq!(remote.data["customer_name"], "Noa");
    assert_eq!(remote.data["customer_phone"], "0500000000");
    assert_eq!(remote.data["is_paid"], true);
    assert_eq!(remote.data["payment_method"], "card");
    assert_eq!(
        backend.row(Table::OrderItems, "SI-70").unwrap().data["item_status"],
        "ready"
    );

    let local = fx.store.get(Table::Orders, SCOPE, "S-7").unwrap().unwrap();
    assert_eq!(local.fields["customer_name"], "Noa");
    assert_eq!(local.fields["payment_method"], "card");
    assert!(!local.pending_sync && !local.is_offline);
    let item = fx.store.get(Table::OrderItems, SCOPE, "SI-70").unwrap().unwrap();
    assert_eq!(item.fields["item_status"], "ready");
    assert!(!item.pending_sync);
}

#[test]
fn rejected_action_stops_at_the_attempts_cap() {
    let fx = Fixture::with_config(EngineConfig {
        outbox: OutboxConfig {
            max_attempts: 3,
            ..OutboxConfig::default()
        },
        ..EngineConfig::default()
    });
    let backend = MockBackend::new();
    backend.reject_all("total does not match items");
    let engine = fx.engine(&backend);
    let created = engine
        .create_order_offline(SCOPE, order(OrderStatus::InProgress), vec![])
        .unwrap();
    fx.net.set_online(true);

    for attempt in 1..=3u32 {
        let report = engine.run_sync_cycle(SCOPE).unwrap();
        let failure = &report.drain.done().unwrap().failures[0];
        assert_eq!(failure.attempts, attempt);
        let expected = if attempt < 3 {
            ErrorKind::BackendRejected
        } else {
            ErrorKind::QueueCapacityExceeded
        };
        assert_eq!(failure.failure.kind, expected);
    }

    let report = engine.run_sync_cycle(SCOPE).unwrap();
    assert_eq!(report.drain.done().unwrap().attempted, 0);
    assert_eq!(backend.calls().len(), 3);

    let action = engine.outbox().get(created.action.id).unwrap().unwrap();
    assert_eq!(action.status, ActionStatus::Failed);
    assert!(action.last_error.unwrap().contains("total does not match"));
    let stats = engine.queue_stats(SCOPE).unwrap();
    assert_eq!((stats.pending, stats.failed, stats.completed), (0, 1, 0));

    // Local row is untouched and still awaiting sync.
    let row = fx
        .store
        .get(Table::Orders, SCOPE, created.order.key.id())
        .unwrap()
        .unwrap();
    assert!(row.pending_sync);

    // Manual resolution after the backend is fixed.
    backend.accept_all();
    engine.outbox().retry_action(created.action.id).unwrap();
    let report = engine.run_sync_cycle(SCOPE).unwrap();
    assert_eq!(report.drain.done().unwrap().completed, 1);
}

#[test]
fn connectivity_transitions_drive_cycles() {
    let fx = Fixture::new();
    let backend = MockBackend::new();
    let engine = fx.engine(&backend);
    let mut online = engine.subscribe_connectivity();

    assert!(engine.handle_connectivity_change(false, SCOPE).unwrap().is_none());
    assert!(engine.handle_connectivity_change(true, SCOPE).unwrap().is_some());
    assert!(online.has_changed().unwrap());
    assert!(*online.borrow_and_update());
    assert!(engine.handle_connectivity_change(true, SCOPE).unwrap().is_none());
    assert!(engine.handle_connectivity_change(false, SCOPE).unwrap().is_none());

    let offline = engine.run_sync_cycle(SCOPE).unwrap();
    assert!(matches!(offline.drain, Step::Skipped(_)));
    assert!(!offline.success());
}

#[test]
fn scopes_never_see_each_other() {
    let fx = Fixture::new();
    let backend = MockBackend::new();
    let engine = fx.engine(&backend);
    engine
        .create_order_offline("biz-2", order(OrderStatus::InProgress), vec![])
        .unwrap();
    engine
        .create_order_offline(SCOPE, order(OrderStatus::InProgress), vec![])
        .unwrap();

    engine.handle_connectivity_change(true, SCOPE).unwrap();
    assert_eq!(backend.calls().len(), 1);
    assert_eq!(backend.calls()[0].business_id, SCOPE);
    assert_eq!(engine.outbox().pending_actions("biz-2").unwrap().len(), 1);
    assert_eq!(
        fx.store.query(Table::Orders, "biz-2", Query::All).unwrap().len(),
        1
    );
    assert_eq!(engine.queue_stats(SCOPE).unwrap().pending, 0);
    assert_eq!(engine.queue_stats("biz-2").unwrap().pending, 1);
    assert_eq!(engine.queue_stats_all().unwrap().pending, 1);
}

#[test]
fn local_writes_notify_subscribers() {
    let fx = Fixture::new();
    let backend = MockBackend::new();
    let engine = fx.engine(&backend);
    let mut orders = engine.subscribe(Table::Orders);
    let mut items = engine.subscribe(Table::OrderItems);
    let mut menu = engine.subscribe(Table::MenuItems);

    engine
        .enqueue_action(
            SCOPE,
            Action::CreateOrder(pos_sync::outbox::CreateOrder {
                local_order_id: "L-manual".into(),
                order: order(OrderStatus::Pending),
                items: vec![pos_sync::outbox::ProvisionalItem {
                    local_item_id: "L-manual-1".into(),
                    item: pos_sync::OrderItem {
                        order_id: "L-manual".into(),
                        ..item("menu-soup")
                    },
                }],
            }),
        )
        .unwrap();

    assert!(orders.has_changed().unwrap());
    assert!(items.has_changed().unwrap());
    assert!(!menu.has_changed().unwrap());
    orders.borrow_and_update();
    items.borrow_and_update();
    assert!(fx.store.get(Table::Orders, SCOPE, "L-manual").unwrap().is_some());
}

#[test]
fn clearing_local_data_needs_confirmation_and_empties_everything() {
    let fx = Fixture::new();
    let backend = MockBackend::new();
    let engine = fx.engine(&backend);
    engine
        .create_order_offline(SCOPE, order(OrderStatus::InProgress), vec![item("menu-tea")])
        .unwrap();

    let before = engine.export_snapshot().unwrap();
    assert_eq!(before.tables[&Table::Orders].len(), 1);
    assert_eq!(before.outbox.len(), 1);

    engine
        .clear_all_local_data(UserConfirmed::acknowledge())
        .unwrap();
    let after = engine.export_snapshot().unwrap();
    assert!(after.tables.values().all(Vec::is_empty));
    assert!(after.outbox.is_empty());
    assert_eq!(engine.queue_stats(SCOPE).unwrap(), QueueStats::default());
}
