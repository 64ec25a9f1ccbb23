//! Lease-based locking: exclusivity, expiry, renewal and deadlock freedom.

use std::time::Duration;

use proptest::prelude::*;
use rand::seq::SliceRandom;
use stockguard::config::LockConfig;
use stockguard::{
    LockError, LockStore, OrderCoordinator, OrderError, OrderStatus, ResourceKey, ResourceKeys,
    ResourceLockManager,
};
use stockguard_memory::InMemoryStore;
use stockguard_testing::{
    fail_fast, init_test_tracing, line, sku, test_config, with_lease, ChaosConfig, ChaosStoreExt,
};

fn keys(names: &[&str]) -> ResourceKeys {
    ResourceKeys::new(names.iter().map(|name| ResourceKey::try_new(*name).unwrap()))
}

fn manager(store: &InMemoryStore, config: LockConfig) -> ResourceLockManager<InMemoryStore> {
    ResourceLockManager::new(store.clone(), config)
}

#[tokio::test]
async fn held_keys_are_exclusive() {
    init_test_tracing();
    let store = InMemoryStore::new();
    let locks = manager(&store, fail_fast(test_config(), Duration::ZERO).locks);

    let held = locks.acquire(&keys(&["A", "B"])).await.unwrap();
    assert_eq!(held.handles().len(), 2);

    let denied = locks.acquire(&keys(&["B"])).await;
    assert!(matches!(denied, Err(LockError::Timeout { .. })));

    locks.release(&held).await;
    locks.acquire(&keys(&["B"])).await.unwrap();
}

#[tokio::test]
async fn failed_acquisition_releases_what_it_took() {
    init_test_tracing();
    let store = InMemoryStore::new();
    let locks = manager(&store, fail_fast(test_config(), Duration::ZERO).locks);

    let _b = locks.acquire(&keys(&["B"])).await.unwrap();
    let denied = locks.acquire(&keys(&["A", "B"])).await;
    match denied {
        Err(LockError::Timeout { key, .. }) => assert_eq!(key.to_string(), "B"),
        other => panic!("expected a timeout on B, got {other:?}"),
    }

    // A was taken first and must have been given back.
    let a = ResourceKey::try_new("A").unwrap();
    assert!(store.lease(&a).await.unwrap().is_none());
}

#[tokio::test]
async fn waiting_acquirer_gets_the_lock_after_release() {
    init_test_tracing();
    let store = InMemoryStore::new();
    let locks = manager(&store, test_config().locks);

    let held = locks.acquire(&keys(&["A"])).await.unwrap();
    let waiter = {
        let locks = locks.clone();
        tokio::spawn(async move { locks.acquire(&keys(&["A"])).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    locks.release(&held).await;

    let acquired = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_ne!(acquired.owner(), held.owner());
}

#[tokio::test]
async fn expired_leases_can_be_taken_over() {
    init_test_tracing();
    let store = InMemoryStore::new();
    let short = with_lease(test_config(), Duration::from_millis(30)).locks;
    let crashed = manager(&store, short);
    let locks = manager(&store, test_config().locks);

    // The holder never releases.
    let _abandoned = crashed.acquire(&keys(&["A"])).await.unwrap();

    let started = tokio::time::Instant::now();
    locks.acquire(&keys(&["A"])).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn renewal_after_reassignment_reports_the_lost_key() {
    init_test_tracing();
    let store = InMemoryStore::new();
    let short = with_lease(test_config(), Duration::from_millis(30)).locks;
    let slow = manager(&store, short);
    let fast = manager(&store, test_config().locks);

    let mut held = slow.acquire(&keys(&["A", "B"])).await.unwrap();
    slow.renew(&mut held).await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    let thief = fast.acquire(&keys(&["A"])).await.unwrap();

    match slow.renew(&mut held).await {
        Err(LockError::Lost { key }) => assert_eq!(key.to_string(), "A"),
        other => panic!("expected A to be lost, got {other:?}"),
    }

    // Releasing a lost lease leaves the new holder alone.
    slow.release(&held).await;
    let a = ResourceKey::try_new("A").unwrap();
    let lease = store.lease(&a).await.unwrap().unwrap();
    assert_eq!(lease.owner, thief.owner());
}

#[tokio::test]
async fn renewal_extends_every_lease() {
    init_test_tracing();
    let store = InMemoryStore::new();
    let locks = manager(&store, test_config().locks);

    let mut held = locks.acquire(&keys(&["A", "B"])).await.unwrap();
    let before = held.expires_at().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    locks.renew(&mut held).await.unwrap();

    assert!(held.expires_at().unwrap() > before);
}

#[tokio::test]
async fn dropped_scope_gives_its_leases_back() {
    init_test_tracing();
    let store = InMemoryStore::new();
    let locks = manager(&store, test_config().locks);

    let scope = locks.acquire_scoped(&keys(&["A", "B"])).await.unwrap();
    assert_eq!(scope.set().handles().len(), 2);
    drop(scope);

    tokio::time::sleep(Duration::from_millis(20)).await;
    for name in ["A", "B"] {
        let key = ResourceKey::try_new(name).unwrap();
        assert!(store.lease(&key).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn placement_that_loses_its_lease_commits_nothing() {
    init_test_tracing();
    let memory = InMemoryStore::new();
    let healthy = OrderCoordinator::new(memory.clone(), test_config());
    healthy.register_sku(&sku("A"), 5).await.unwrap();

    // Every lease lapses before its holder hears it was granted.
    let chaos = ChaosConfig::deterministic().with_lock_latency(Duration::from_millis(60));
    let config = with_lease(test_config(), Duration::from_millis(20));
    let coordinator = OrderCoordinator::new(memory.clone().with_chaos(chaos), config);
    let lines = [line("A", 2)];

    let lost = coordinator.place_order(Some("k"), "buyer", &lines).await;
    assert!(matches!(&lost, Err(OrderError::LockLost { key }) if key == "A"));
    assert_eq!(lost.unwrap_err().code(), "LOCK_LOST");

    assert_eq!(memory.order_count(), 0);
    let stats = healthy.get_stock_stats("A").await.unwrap();
    assert_eq!((stats.available, stats.reserved), (5, 0));
    let a = ResourceKey::try_new("A").unwrap();
    assert!(memory.lease(&a).await.unwrap().is_none());

    // The key was freed, so the same request can go through.
    assert_eq!(memory.idempotency_record_count(), 0);
    let retried = healthy.place_order(Some("k"), "buyer", &lines).await;
    assert_eq!(retried.unwrap().status, OrderStatus::Reserved);
}

fn run_shuffled_orders(seed: u64, buyers: usize) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async move {
        let store = InMemoryStore::new();
        let coordinator = OrderCoordinator::new(store.clone(), test_config());
        let names = ["A", "B", "C", "D", "E"];
        for name in names {
            coordinator.register_sku(&sku(name), 1_000).await.unwrap();
        }

        let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(seed);
        let mut handles = Vec::new();
        for i in 0..buyers {
            let mut basket: Vec<&str> = names.to_vec();
            basket.shuffle(&mut rng);
            basket.truncate(2 + i % 4);
            let lines: Vec<_> = basket.iter().map(|name| line(name, 1)).collect();
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("order-{i}");
                coordinator.place_order(Some(&key), "buyer", &lines).await
            }));
        }

        let all = async {
            for handle in handles {
                handle.await.unwrap().unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(10), all)
            .await
            .expect("orders over overlapping SKUs must all make progress");

        for name in names {
            let stats = coordinator.get_stock_stats(name).await.unwrap();
            assert_eq!(stats.available + stats.reserved, 1_000);
        }
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn shuffled_sku_orders_never_deadlock(seed in any::<u64>(), buyers in 2usize..16) {
        run_shuffled_orders(seed, buyers);
    }
}
