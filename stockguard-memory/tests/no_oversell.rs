//! Concurrent checkouts against shared stock never oversell.

use std::time::Duration;

use stockguard::{OrderCoordinator, OrderError, OrderStatus, Version};
use stockguard_memory::InMemoryStore;
use stockguard_testing::{init_test_tracing, line, quantity, sku, test_config};

async fn coordinator_with(
    stock: &[(&str, u64)],
) -> (OrderCoordinator<InMemoryStore>, InMemoryStore) {
    init_test_tracing();
    let store = InMemoryStore::new();
    let coordinator = OrderCoordinator::new(store.clone(), test_config());
    for (name, units) in stock {
        coordinator.register_sku(&sku(name), *units).await.unwrap();
    }
    (coordinator, store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_buyers_five_units() {
    let (coordinator, store) = coordinator_with(&[("A", 5)]).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            let key = format!("order-{i}");
            let buyer = format!("buyer-{i}");
            coordinator
                .place_order(Some(&key), &buyer, &[line("A", 1)])
                .await
        }));
    }

    let mut placed = 0;
    let mut sold_out = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(order) => {
                assert_eq!(order.status, OrderStatus::Reserved);
                placed += 1;
            }
            Err(OrderError::InsufficientStock { .. }) => sold_out += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!((placed, sold_out), (5, 5));
    let stats = coordinator.get_stock_stats("A").await.unwrap();
    assert_eq!(stats.available, 0);
    assert_eq!(stats.reserved, 5);
    assert_eq!(stats.version, Version::new(5));
    assert_eq!(store.order_count(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bare_reservations_without_locks_never_oversell() {
    // The version check alone must hold the line when callers skip the locks.
    let (coordinator, _store) = coordinator_with(&[("A", 7)]).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator.stock().reserve(&sku("A"), quantity(1)).await
        }));
    }

    let mut reserved = 0;
    let mut sold_out = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => reserved += 1,
            Err(stockguard::StockError::InsufficientStock { .. }) => sold_out += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!((reserved, sold_out), (7, 13));
    let stats = coordinator.get_stock_stats("A").await.unwrap();
    assert_eq!((stats.available, stats.reserved), (0, 7));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_multi_sku_orders_conserve_stock() {
    let (coordinator, _store) = coordinator_with(&[("A", 6), ("B", 6), ("C", 6)]).await;

    let baskets = [
        vec![line("A", 1), line("B", 1)],
        vec![line("C", 1), line("A", 1)],
        vec![line("B", 2), line("C", 1)],
        vec![line("C", 1), line("B", 1), line("A", 1)],
    ];

    let mut handles = Vec::new();
    for i in 0..12 {
        let coordinator = coordinator.clone();
        let basket = baskets[i % baskets.len()].clone();
        handles.push(tokio::spawn(async move {
            let key = format!("basket-{i}");
            coordinator
                .place_order(Some(&key), "shopper", &basket)
                .await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    for result in &results {
        if let Err(error) = result {
            assert!(
                matches!(error, OrderError::InsufficientStock { .. }),
                "unexpected error: {error}"
            );
        }
    }

    let mut reserved_total = 0;
    for name in ["A", "B", "C"] {
        let stats = coordinator.get_stock_stats(name).await.unwrap();
        assert_eq!(
            stats.available + stats.reserved,
            6,
            "total changed for {name}"
        );
        reserved_total += stats.reserved;
    }

    let expected: u64 = results
        .iter()
        .enumerate()
        .filter(|(_, result)| result.is_ok())
        .map(|(i, _)| {
            baskets[i % baskets.len()]
                .iter()
                .map(|line| u64::try_from(line.quantity).unwrap())
                .sum::<u64>()
        })
        .sum();
    assert_eq!(reserved_total, expected);
}

#[tokio::test]
async fn partial_shortage_reserves_nothing() {
    let (coordinator, store) = coordinator_with(&[("A", 5), ("B", 2)]).await;

    let result = coordinator
        .place_order(Some("k"), "buyer", &[line("A", 1), line("B", 3)])
        .await;

    assert_eq!(
        result,
        Err(OrderError::InsufficientStock {
            sku: sku("B"),
            requested: 3,
            available: 2,
        })
    );
    let a = coordinator.get_stock_stats("A").await.unwrap();
    assert_eq!(
        (a.available, a.reserved, a.version),
        (5, 0, Version::initial())
    );
    assert_eq!(store.order_count(), 0);
}

#[tokio::test]
async fn repeated_skus_are_reserved_as_one_demand() {
    let (coordinator, _store) = coordinator_with(&[("A", 5)]).await;

    coordinator
        .place_order(Some("k"), "buyer", &[line("A", 2), line("A", 3)])
        .await
        .unwrap();

    let stats = coordinator.get_stock_stats("A").await.unwrap();
    assert_eq!((stats.available, stats.reserved), (0, 5));
    // One commit for the whole order.
    assert_eq!(stats.version, Version::new(1));
}

#[tokio::test]
async fn demand_beyond_the_counters_is_rejected_up_front() {
    let (coordinator, store) = coordinator_with(&[("A", 5)]).await;
    let lines = [line("A", i64::MAX), line("A", i64::MAX), line("A", i64::MAX)];

    let result = coordinator.place_order(Some("k"), "buyer", &lines).await;

    assert_eq!(
        result,
        Err(OrderError::InvalidQuantity {
            sku: "A".into(),
            quantity: i64::MAX,
        })
    );
    assert_eq!(store.order_count(), 0);
    assert_eq!(store.idempotency_record_count(), 0);
    let stats = coordinator.get_stock_stats("A").await.unwrap();
    assert_eq!((stats.available, stats.version), (5, Version::initial()));
}

#[tokio::test]
async fn contention_on_one_sku_leaves_others_free() {
    let (coordinator, _store) = coordinator_with(&[("A", 100), ("B", 100)]).await;
    let a_lines = [line("A", 1)];
    let b_lines = [line("B", 1)];

    let started = tokio::time::Instant::now();
    let (a, b) = tokio::join!(
        coordinator.place_order(Some("a"), "buyer", &a_lines),
        coordinator.place_order(Some("b"), "buyer", &b_lines),
    );
    a.unwrap();
    b.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}
