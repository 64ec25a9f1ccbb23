//! Fault injection for store-backed tests.
//!
//! [`ChaosStore`] wraps any store implementing the three `StockGuard` ports
//! and injects failures into inventory commits. Faults come from two sources:
//! scripted faults queued with [`ChaosStore::inject`], consumed one per
//! commit in order, and random faults drawn with the configured
//! probabilities from a (optionally seeded) RNG.
//!
//! Delays keep requests in flight: a commit delay holds every inventory
//! commit, and a lock latency holds the reply to every granted lease, long
//! enough for a short lease to lapse before its holder learns of it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nutype::nutype;
use rand::{random, rngs::StdRng, Rng, SeedableRng};
use stockguard::errors::{StoreError, StoreResult};
use stockguard::idempotency::{IdempotencyRecord, ScopedKey};
use stockguard::order::{Order, OrderStatus};
use stockguard::stock::StockRecord;
use stockguard::store::{
    CommitReceipt, IdempotencyStore, InventoryStore, LockLease, LockStore, Transaction,
};
use stockguard::types::{OrderId, OwnerToken, ResourceKey, SkuId, Timestamp, Version};
use tracing::debug;

/// Probability of injecting a fault, in `[0.0, 1.0]`.
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f64);

/// A fault applied to one inventory commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The commit fails and nothing is written.
    FailBeforeCommit,
    /// The commit is applied but the caller sees a failure.
    FailAfterCommit,
    /// The commit is rejected as a version conflict and nothing is written.
    Conflict,
}

/// Random fault settings.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    ambiguous_failure_probability: Probability,
    version_conflict_probability: Probability,
    commit_delay: Duration,
    lock_latency: Duration,
}

impl ChaosConfig {
    /// No random faults, RNG seeded with 0.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Seeds the RNG.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.deterministic_seed = Some(seed);
        self
    }

    /// Chance a commit fails without writing.
    #[must_use]
    pub fn with_failure_probability(mut self, probability: f64) -> Self {
        self.failure_probability = clamped(probability);
        self
    }

    /// Chance a commit is applied and then reported as failed.
    #[must_use]
    pub fn with_ambiguous_failure_probability(mut self, probability: f64) -> Self {
        self.ambiguous_failure_probability = clamped(probability);
        self
    }

    /// Chance a commit is rejected as a version conflict.
    #[must_use]
    pub fn with_version_conflict_probability(mut self, probability: f64) -> Self {
        self.version_conflict_probability = clamped(probability);
        self
    }

    /// Delay before every commit, to keep requests in flight.
    #[must_use]
    pub const fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = delay;
        self
    }

    /// Delay between a lease being granted and the caller hearing of it.
    #[must_use]
    pub const fn with_lock_latency(mut self, latency: Duration) -> Self {
        self.lock_latency = latency;
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: clamped(0.0),
            ambiguous_failure_probability: clamped(0.0),
            version_conflict_probability: clamped(0.0),
            commit_delay: Duration::ZERO,
            lock_latency: Duration::ZERO,
        }
    }
}

fn clamped(probability: f64) -> Probability {
    Probability::try_new(probability.clamp(0.0, 1.0)).expect("clamped value is always valid")
}

/// A store wrapper that injects faults into inventory commits.
///
/// Idempotency calls pass straight through, as do lock calls apart from the
/// configured latency. Clones share the wrapped store, the RNG and the fault
/// queue.
#[derive(Debug, Clone)]
pub struct ChaosStore<S> {
    store: S,
    config: Arc<ChaosConfig>,
    rng: Arc<Mutex<StdRng>>,
    scripted: Arc<Mutex<VecDeque<Fault>>>,
}

impl<S> ChaosStore<S> {
    /// Wraps `store`.
    pub fn new(store: S, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            store,
            config: Arc::new(config),
            rng: Arc::new(Mutex::new(rng)),
            scripted: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Queues `fault` for an upcoming commit. Queued faults apply in order,
    /// one per commit, before any random fault.
    pub fn inject(&self, fault: Fault) {
        self.scripted
            .lock()
            .expect("chaos fault queue mutex should not be poisoned")
            .push_back(fault);
    }

    /// The wrapped store.
    pub const fn inner(&self) -> &S {
        &self.store
    }

    fn should_inject(&self, probability: Probability) -> bool {
        let probability: f64 = probability.into();

        if probability <= 0.0 {
            return false;
        }

        if probability >= 1.0 {
            return true;
        }

        let mut rng = self
            .rng
            .lock()
            .expect("chaos RNG mutex should not be poisoned");

        rng.random_bool(probability)
    }

    fn next_fault(&self) -> Option<Fault> {
        let scripted = self
            .scripted
            .lock()
            .expect("chaos fault queue mutex should not be poisoned")
            .pop_front();
        if scripted.is_some() {
            return scripted;
        }

        if self.should_inject(self.config.version_conflict_probability) {
            Some(Fault::Conflict)
        } else if self.should_inject(self.config.failure_probability) {
            Some(Fault::FailBeforeCommit)
        } else if self.should_inject(self.config.ambiguous_failure_probability) {
            Some(Fault::FailAfterCommit)
        } else {
            None
        }
    }
}

/// Wraps a store in a [`ChaosStore`].
pub trait ChaosStoreExt: Sized {
    /// Wraps `self` with the given fault settings.
    fn with_chaos(self, config: ChaosConfig) -> ChaosStore<Self>;
}

impl<S> ChaosStoreExt for S
where
    S: InventoryStore,
{
    fn with_chaos(self, config: ChaosConfig) -> ChaosStore<Self> {
        ChaosStore::new(self, config)
    }
}

#[async_trait]
impl<S> InventoryStore for ChaosStore<S>
where
    S: InventoryStore,
{
    async fn stock(&self, sku: &SkuId) -> StoreResult<Option<StockRecord>> {
        self.store.stock(sku).await
    }

    async fn order(&self, id: &OrderId) -> StoreResult<Option<Order>> {
        self.store.order(id).await
    }

    async fn orders_with_status(&self, status: OrderStatus) -> StoreResult<Vec<Order>> {
        self.store.orders_with_status(status).await
    }

    async fn commit(&self, transaction: Transaction) -> StoreResult<CommitReceipt> {
        if !self.config.commit_delay.is_zero() {
            tokio::time::sleep(self.config.commit_delay).await;
        }

        match self.next_fault() {
            None => self.store.commit(transaction).await,
            Some(Fault::Conflict) => {
                debug!("injecting version conflict");
                Err(StoreError::VersionConflict {
                    record: "chaos".to_string(),
                    expected: None,
                    current: None,
                })
            }
            Some(Fault::FailBeforeCommit) => {
                debug!("injecting commit failure");
                Err(StoreError::Unavailable("injected failure before commit".to_string()))
            }
            Some(Fault::FailAfterCommit) => {
                debug!("injecting ambiguous commit failure");
                self.store.commit(transaction).await?;
                Err(StoreError::Unavailable("injected failure after commit".to_string()))
            }
        }
    }
}

#[async_trait]
impl<S> LockStore for ChaosStore<S>
where
    S: LockStore,
{
    async fn try_acquire(
        &self,
        key: &ResourceKey,
        owner: OwnerToken,
        expires_at: Timestamp,
        now: Timestamp,
    ) -> StoreResult<bool> {
        let granted = self.store.try_acquire(key, owner, expires_at, now).await?;
        if granted && !self.config.lock_latency.is_zero() {
            debug!(%key, "delaying lease grant");
            tokio::time::sleep(self.config.lock_latency).await;
        }
        Ok(granted)
    }

    async fn renew(
        &self,
        key: &ResourceKey,
        owner: OwnerToken,
        expires_at: Timestamp,
        now: Timestamp,
    ) -> StoreResult<bool> {
        self.store.renew(key, owner, expires_at, now).await
    }

    async fn release(&self, key: &ResourceKey, owner: OwnerToken) -> StoreResult<()> {
        self.store.release(key, owner).await
    }

    async fn lease(&self, key: &ResourceKey) -> StoreResult<Option<LockLease>> {
        self.store.lease(key).await
    }
}

#[async_trait]
impl<S> IdempotencyStore for ChaosStore<S>
where
    S: IdempotencyStore,
{
    async fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        self.store.insert_if_absent(record).await
    }

    async fn replace(&self, record: IdempotencyRecord, expected: Version) -> StoreResult<()> {
        self.store.replace(record, expected).await
    }

    async fn remove(&self, key: &ScopedKey, expected: Version) -> StoreResult<()> {
        self.store.remove(key, expected).await
    }

    async fn get(&self, key: &ScopedKey) -> StoreResult<Option<IdempotencyRecord>> {
        self.store.get(key).await
    }

    async fn purge_expired(&self, now: Timestamp) -> StoreResult<usize> {
        self.store.purge_expired(now).await
    }
}
