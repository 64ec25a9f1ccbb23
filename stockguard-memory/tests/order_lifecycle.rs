//! Confirm, cancel, expire and compensate orders.

use std::time::Duration;

use stockguard::config::{BackoffConfig, ConflictRetryConfig, MaxConflictRetries};
use stockguard::{
    OrderCoordinator, OrderError, OrderId, OrderStatus, ReleaseReason, StockError, Version,
};
use stockguard_memory::InMemoryStore;
use stockguard_testing::{
    init_test_tracing, line, quantity, sku, test_config, with_reservation_ttl, ChaosConfig,
    ChaosStore, ChaosStoreExt, Fault,
};

async fn coordinator_with(available: u64) -> OrderCoordinator<InMemoryStore> {
    init_test_tracing();
    let coordinator = OrderCoordinator::new(InMemoryStore::new(), test_config());
    coordinator
        .register_sku(&sku("A"), available)
        .await
        .unwrap();
    coordinator
}

async fn chaotic(
    available: u64,
) -> (
    OrderCoordinator<ChaosStore<InMemoryStore>>,
    ChaosStore<InMemoryStore>,
) {
    init_test_tracing();
    let store = InMemoryStore::new().with_chaos(ChaosConfig::deterministic());
    let coordinator = OrderCoordinator::new(store.clone(), test_config());
    coordinator
        .register_sku(&sku("A"), available)
        .await
        .unwrap();
    (coordinator, store)
}

#[tokio::test]
async fn release_is_the_inverse_of_reserve() {
    let coordinator = coordinator_with(5).await;
    let stock = coordinator.stock();

    stock.reserve(&sku("A"), quantity(3)).await.unwrap();
    let released = stock.release(&sku("A"), quantity(3)).await.unwrap();

    assert_eq!((released.available, released.reserved), (5, 0));
    assert_eq!(released.version, Version::new(2));
}

#[tokio::test]
async fn commit_consumes_reserved_units_only() {
    let coordinator = coordinator_with(5).await;
    let stock = coordinator.stock();

    stock.reserve(&sku("A"), quantity(2)).await.unwrap();
    let committed = stock.commit(&sku("A"), quantity(2)).await.unwrap();

    assert_eq!((committed.available, committed.reserved), (3, 0));
    assert!(matches!(
        stock.commit(&sku("A"), quantity(1)).await,
        Err(StockError::InsufficientReserved { .. })
    ));
}

#[tokio::test]
async fn cancel_returns_units_and_repeats_quietly() {
    let coordinator = coordinator_with(5).await;
    let placed = coordinator
        .place_order(Some("k"), "buyer", &[line("A", 2)])
        .await
        .unwrap();

    for _ in 0..2 {
        let cancelled = coordinator.cancel_order(placed.order_id).await;
        assert_eq!(cancelled, Ok(OrderStatus::Cancelled));
    }

    let stats = coordinator.get_stock_stats("A").await.unwrap();
    assert_eq!(
        (stats.available, stats.reserved, stats.version),
        (5, 0, Version::new(2))
    );

    assert_eq!(
        coordinator.confirm_order(placed.order_id).await,
        Err(OrderError::InvalidOrderState {
            order: placed.order_id,
            status: OrderStatus::Cancelled,
        })
    );
}

#[tokio::test]
async fn confirm_consumes_stock_and_blocks_cancellation() {
    let coordinator = coordinator_with(5).await;
    let placed = coordinator
        .place_order(Some("k"), "buyer", &[line("A", 2)])
        .await
        .unwrap();

    for _ in 0..2 {
        let confirmed = coordinator.confirm_order(placed.order_id).await;
        assert_eq!(confirmed, Ok(OrderStatus::Committed));
    }

    let stats = coordinator.get_stock_stats("A").await.unwrap();
    assert_eq!((stats.available, stats.reserved), (3, 0));

    let cancel = coordinator.cancel_order(placed.order_id).await;
    assert!(matches!(
        cancel,
        Err(OrderError::InvalidOrderState {
            status: OrderStatus::Committed,
            ..
        })
    ));
    assert_eq!(cancel.unwrap_err().code(), "INVALID_ORDER_STATE");
}

#[tokio::test]
async fn settling_an_unknown_order_fails() {
    let coordinator = coordinator_with(5).await;
    let ghost = OrderId::generate();

    let missing = Err(OrderError::OrderNotFound(ghost));
    assert_eq!(coordinator.cancel_order(ghost).await, missing);
    assert_eq!(coordinator.confirm_order(ghost).await, missing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cancels_release_once() {
    let coordinator = coordinator_with(5).await;
    let placed = coordinator
        .place_order(Some("k"), "buyer", &[line("A", 3)])
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator.cancel_order(placed.order_id).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), Ok(OrderStatus::Cancelled));
    }

    let stats = coordinator.get_stock_stats("A").await.unwrap();
    assert_eq!((stats.available, stats.reserved), (5, 0));
}

#[tokio::test]
async fn stale_reservations_expire() {
    init_test_tracing();
    let config = with_reservation_ttl(test_config(), Duration::from_millis(50));
    let coordinator = OrderCoordinator::new(InMemoryStore::new(), config);
    coordinator.register_sku(&sku("A"), 5).await.unwrap();

    let (two, one) = ([line("A", 2)], [line("A", 1)]);

    let stale = coordinator
        .place_order(Some("old"), "buyer", &two)
        .await
        .unwrap();
    let paid = coordinator
        .place_order(Some("paid"), "buyer", &one)
        .await
        .unwrap();
    coordinator.confirm_order(paid.order_id).await.unwrap();

    assert_eq!(coordinator.expire_reservations().await, Ok(0));
    tokio::time::sleep(Duration::from_millis(80)).await;
    let fresh = coordinator
        .place_order(Some("new"), "buyer", &one)
        .await
        .unwrap();

    assert_eq!(coordinator.expire_reservations().await, Ok(1));
    for (placed, status) in [
        (stale.clone(), OrderStatus::Expired),
        (fresh, OrderStatus::Reserved),
        (paid, OrderStatus::Committed),
    ] {
        let order = coordinator.get_order(placed.order_id).await.unwrap();
        assert_eq!(order.status, status);
    }

    let stats = coordinator.get_stock_stats("A").await.unwrap();
    assert_eq!((stats.available, stats.reserved), (3, 1));
    let cancelled = coordinator.cancel_order(stale.order_id).await;
    assert_eq!(cancelled, Ok(OrderStatus::Expired));
}

#[tokio::test]
async fn stats_reject_bad_and_unknown_skus() {
    let coordinator = coordinator_with(5).await;

    assert_eq!(
        coordinator.get_stock_stats("  ").await,
        Err(OrderError::InvalidSku("  ".into()))
    );
    assert_eq!(
        coordinator.get_stock_stats("Z").await,
        Err(OrderError::UnknownSku(sku("Z")))
    );
    assert_eq!(
        coordinator.register_sku(&sku("A"), 1).await,
        Err(StockError::SkuExists(sku("A")))
    );
}

#[tokio::test]
async fn orders_for_unknown_skus_are_rejected_and_replayed() {
    let coordinator = coordinator_with(5).await;
    let lines = [line("A", 1), line("Z", 1)];

    let first = coordinator.place_order(Some("k"), "buyer", &lines).await;
    assert_eq!(first, Err(OrderError::UnknownSku(sku("Z"))));

    coordinator.register_sku(&sku("Z"), 5).await.unwrap();
    let replayed = coordinator.place_order(Some("k"), "buyer", &lines).await;
    assert_eq!(replayed, first);
}

#[tokio::test]
async fn ambiguous_commit_is_compensated() {
    let (coordinator, store) = chaotic(5).await;

    store.inject(Fault::FailAfterCommit);
    let lines = [line("A", 2)];
    let aborted = coordinator.place_order(Some("k"), "buyer", &lines).await;

    let order = match &aborted {
        Err(error @ OrderError::TransactionAbort { order, .. }) => {
            assert!(error.is_retryable());
            *order
        }
        other => panic!("expected a transaction abort, got {other:?}"),
    };
    let status = coordinator.get_order(order).await.unwrap().status;
    assert_eq!(status, OrderStatus::Aborted);

    let stats = coordinator.get_stock_stats("A").await.unwrap();
    assert_eq!(
        (stats.available, stats.reserved, stats.version),
        (5, 0, Version::new(2))
    );

    // The key was freed, so the client's retry goes through.
    let retried = coordinator
        .place_order(Some("k"), "buyer", &lines)
        .await
        .unwrap();
    assert_ne!(retried.order_id, order);
    assert_eq!(store.inner().order_count(), 2);
}

#[tokio::test]
async fn failed_commit_leaves_nothing_behind() {
    let (coordinator, store) = chaotic(5).await;

    store.inject(Fault::FailBeforeCommit);
    let aborted = coordinator
        .place_order(Some("k"), "buyer", &[line("A", 2)])
        .await;

    assert!(matches!(aborted, Err(OrderError::TransactionAbort { .. })));
    assert_eq!(aborted.unwrap_err().code(), "TRANSACTION_ABORT");
    assert_eq!(store.inner().order_count(), 0);
    let stats = coordinator.get_stock_stats("A").await.unwrap();
    assert_eq!(
        (stats.available, stats.reserved, stats.version),
        (5, 0, Version::initial())
    );
}

#[tokio::test]
async fn releasing_twice_reports_the_terminal_status() {
    let (coordinator, _store) = chaotic(5).await;
    let placed = coordinator
        .place_order(Some("k"), "buyer", &[line("A", 1)])
        .await
        .unwrap();

    coordinator
        .stock()
        .release_order(placed.order_id, ReleaseReason::Aborted)
        .await
        .unwrap();
    let again = coordinator
        .stock()
        .release_order(placed.order_id, ReleaseReason::Aborted)
        .await;
    assert!(matches!(
        again,
        Err(StockError::OrderNotPending {
            status: OrderStatus::Aborted,
            ..
        })
    ));
}

#[tokio::test]
async fn spurious_conflicts_are_retried_transparently() {
    let (coordinator, store) = chaotic(5).await;

    store.inject(Fault::Conflict);
    store.inject(Fault::Conflict);
    let placed = coordinator
        .place_order(Some("k"), "buyer", &[line("A", 1)])
        .await;

    assert_eq!(placed.unwrap().status, OrderStatus::Reserved);
    let stats = coordinator.get_stock_stats("A").await.unwrap();
    assert_eq!((stats.available, stats.reserved), (4, 1));
}

#[tokio::test]
async fn persistent_conflicts_exhaust_the_retry_budget() {
    init_test_tracing();
    let store = InMemoryStore::new().with_chaos(ChaosConfig::deterministic());
    let retries = ConflictRetryConfig::new()
        .unwrap()
        .with_max_retries(MaxConflictRetries::try_new(2).unwrap())
        .with_backoff(BackoffConfig::fast().unwrap());
    let config = test_config().with_retries(retries);
    let coordinator = OrderCoordinator::new(store.clone(), config);
    coordinator.register_sku(&sku("A"), 5).await.unwrap();

    for _ in 0..3 {
        store.inject(Fault::Conflict);
    }
    let restock = coordinator.restock(&sku("A"), quantity(1)).await;
    assert!(matches!(
        restock,
        Err(StockError::ConflictExhausted { attempts: 3, .. })
    ));

    for _ in 0..3 {
        store.inject(Fault::Conflict);
    }
    let lines = [line("A", 1)];
    let placed = coordinator.place_order(Some("k"), "buyer", &lines).await;
    assert!(matches!(placed, Err(OrderError::ConflictExhausted { .. })));

    // Retryable, so the key is free and stock untouched.
    let stats = coordinator.get_stock_stats("A").await.unwrap();
    assert_eq!((stats.available, stats.reserved), (5, 0));
    coordinator
        .place_order(Some("k"), "buyer", &lines)
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restocks_under_random_conflicts_all_land() {
    init_test_tracing();
    let store = InMemoryStore::new().with_chaos(
        ChaosConfig::default()
            .with_seed(7)
            .with_version_conflict_probability(0.3),
    );
    let coordinator = OrderCoordinator::new(store.clone(), test_config());
    coordinator.register_sku(&sku("A"), 0).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator.restock(&sku("A"), quantity(3)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stats = coordinator.get_stock_stats("A").await.unwrap();
    assert_eq!((stats.available, stats.reserved), (15, 0));
}
