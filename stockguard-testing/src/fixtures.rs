//! Fixtures for building requests and configuring coordinators in tests.

use std::time::Duration;

use stockguard::config::{
    AcquireMode, CoordinatorConfig, InProgressGraceMs, LockLeaseMs, LockTimeoutMs,
    ReservationTtlMs,
};
use stockguard::order::OrderLineRequest;
use stockguard::types::{Quantity, SkuId};

/// A valid SKU id. Panics on an invalid name.
pub fn sku(name: &str) -> SkuId {
    SkuId::try_new(name).expect("fixture SKU names are valid")
}

/// A valid quantity. Panics on zero.
pub fn quantity(units: u64) -> Quantity {
    Quantity::try_new(units).expect("fixture quantities are positive")
}

/// A request line priced at 100 minor units per unit.
pub fn line(sku: &str, quantity: i64) -> OrderLineRequest {
    OrderLineRequest::new(sku, quantity, 100)
}

/// Settings for tests: short backoff, generous retry budget, waiting locks.
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig::fast().expect("fast preset is valid")
}

/// `config` with a lock lease of `lease`.
pub fn with_lease(config: CoordinatorConfig, lease: Duration) -> CoordinatorConfig {
    let locks = config.locks.with_lease(
        LockLeaseMs::try_new(millis(lease)).expect("fixture lease is in range"),
    );
    config.with_locks(locks)
}

/// `config` with fail-fast locking that gives up after `timeout`.
pub fn fail_fast(config: CoordinatorConfig, timeout: Duration) -> CoordinatorConfig {
    let locks = config
        .locks
        .with_mode(AcquireMode::FailFast)
        .with_acquire_timeout(
            LockTimeoutMs::try_new(millis(timeout)).expect("fixture timeout is in range"),
        );
    config.with_locks(locks)
}

/// `config` with a reservation TTL of `ttl`.
pub fn with_reservation_ttl(config: CoordinatorConfig, ttl: Duration) -> CoordinatorConfig {
    config.with_reservation_ttl(
        ReservationTtlMs::try_new(millis(ttl)).expect("fixture reservation TTL is in range"),
    )
}

/// `config` with an in-progress grace period of `grace`.
pub fn with_in_progress_grace(config: CoordinatorConfig, grace: Duration) -> CoordinatorConfig {
    let idempotency = config.idempotency.with_in_progress_grace(
        InProgressGraceMs::try_new(millis(grace)).expect("fixture grace is in range"),
    );
    config.with_idempotency(idempotency)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
