//! In-memory store for `StockGuard`
//!
//! This crate provides an in-memory implementation of every `StockGuard`
//! store port: inventory, lock leases and idempotency records. It is useful
//! for tests, demos and single-process deployments where persistence is not
//! required. Clones share the same storage, so one store can back any number
//! of coordinators and tasks.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod recovery;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use stockguard::errors::{StoreError, StoreResult};
use stockguard::idempotency::{IdempotencyRecord, ScopedKey};
use stockguard::order::{Order, OrderStatus};
use stockguard::stock::StockRecord;
use stockguard::store::{
    CommitReceipt, IdempotencyStore, InventoryStore, LockLease, LockStore, Transaction,
};
use stockguard::types::{OrderId, OwnerToken, ResourceKey, SkuId, Timestamp, Version};
use tracing::trace;

use crate::recovery::RwLockRecovery;

/// Stock and orders live behind one lock so a commit touching both is atomic.
#[derive(Debug, Default)]
struct Inventory {
    stock: HashMap<SkuId, StockRecord>,
    orders: HashMap<OrderId, Order>,
}

/// Thread-safe in-memory store implementing every `StockGuard` port.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inventory: Arc<RwLock<Inventory>>,
    leases: Arc<RwLock<HashMap<ResourceKey, LockLease>>>,
    idempotency: Arc<RwLock<HashMap<ScopedKey, IdempotencyRecord>>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored orders in any status.
    pub fn order_count(&self) -> usize {
        self.inventory.read_recover().orders.len()
    }

    /// Number of stored idempotency records.
    pub fn idempotency_record_count(&self) -> usize {
        self.idempotency.read_recover().len()
    }
}

fn conflict(record: String, expected: Option<Version>, current: Option<Version>) -> StoreError {
    StoreError::VersionConflict {
        record,
        expected,
        current,
    }
}

#[async_trait]
impl InventoryStore for InMemoryStore {
    async fn stock(&self, sku: &SkuId) -> StoreResult<Option<StockRecord>> {
        Ok(self.inventory.read_recover().stock.get(sku).cloned())
    }

    async fn order(&self, id: &OrderId) -> StoreResult<Option<Order>> {
        Ok(self.inventory.read_recover().orders.get(id).cloned())
    }

    async fn orders_with_status(&self, status: OrderStatus) -> StoreResult<Vec<Order>> {
        let inventory = self.inventory.read_recover();
        let mut orders: Vec<Order> = inventory
            .orders
            .values()
            .filter(|order| order.status == status)
            .cloned()
            .collect();
        orders.sort_by_key(|order| (order.created_at, order.id));
        Ok(orders)
    }

    async fn commit(&self, transaction: Transaction) -> StoreResult<CommitReceipt> {
        let mut inventory = self.inventory.write_recover();

        // First, verify every expectation
        for write in &transaction.stock {
            let current = inventory
                .stock
                .get(&write.record.sku)
                .map(|record| record.version);
            if !write.expected.is_met_by(current) {
                trace!(sku = %write.record.sku, "stock write rejected");
                return Err(conflict(
                    format!("stock/{}", write.record.sku),
                    write.expected.version(),
                    current,
                ));
            }
        }
        for write in &transaction.orders {
            let current = inventory
                .orders
                .get(&write.order.id)
                .map(|order| order.version);
            if !write.expected.is_met_by(current) {
                trace!(order = %write.order.id, "order write rejected");
                return Err(conflict(
                    format!("order/{}", write.order.id),
                    write.expected.version(),
                    current,
                ));
            }
        }

        // All expectations hold, apply the writes
        let mut receipt = CommitReceipt::default();
        for write in transaction.stock {
            let version = write.expected.resulting_version();
            let record = StockRecord {
                version,
                ..write.record
            };
            receipt.stock.insert(record.sku.clone(), version);
            inventory.stock.insert(record.sku.clone(), record);
        }
        for write in transaction.orders {
            let version = write.expected.resulting_version();
            let order = Order {
                version,
                ..write.order
            };
            receipt.orders.insert(order.id, version);
            inventory.orders.insert(order.id, order);
        }
        Ok(receipt)
    }
}

#[async_trait]
impl LockStore for InMemoryStore {
    async fn try_acquire(
        &self,
        key: &ResourceKey,
        owner: OwnerToken,
        expires_at: Timestamp,
        now: Timestamp,
    ) -> StoreResult<bool> {
        let mut leases = self.leases.write_recover();
        let free = match leases.get(key) {
            Some(lease) => lease.owner == owner || !lease.is_valid_at(now),
            None => true,
        };
        if free {
            leases.insert(
                key.clone(),
                LockLease {
                    key: key.clone(),
                    owner,
                    expires_at,
                },
            );
        }
        Ok(free)
    }

    async fn renew(
        &self,
        key: &ResourceKey,
        owner: OwnerToken,
        expires_at: Timestamp,
        now: Timestamp,
    ) -> StoreResult<bool> {
        let mut leases = self.leases.write_recover();
        match leases.get_mut(key) {
            Some(lease) if lease.owner == owner && lease.is_valid_at(now) => {
                lease.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &ResourceKey, owner: OwnerToken) -> StoreResult<()> {
        let mut leases = self.leases.write_recover();
        if leases.get(key).is_some_and(|lease| lease.owner == owner) {
            leases.remove(key);
        }
        Ok(())
    }

    async fn lease(&self, key: &ResourceKey) -> StoreResult<Option<LockLease>> {
        Ok(self.leases.read_recover().get(key).cloned())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        let mut records = self.idempotency.write_recover();
        if let Some(existing) = records.get(&record.key) {
            return Ok(Some(existing.clone()));
        }
        let record = IdempotencyRecord {
            version: Version::initial(),
            ..record
        };
        records.insert(record.key.clone(), record);
        Ok(None)
    }

    async fn replace(&self, record: IdempotencyRecord, expected: Version) -> StoreResult<()> {
        let mut records = self.idempotency.write_recover();
        let current = records.get(&record.key).map(|stored| stored.version);
        if current != Some(expected) {
            return Err(conflict(
                format!("idempotency/{}", record.key),
                Some(expected),
                current,
            ));
        }
        let record = IdempotencyRecord {
            version: expected.next(),
            ..record
        };
        records.insert(record.key.clone(), record);
        Ok(())
    }

    async fn remove(&self, key: &ScopedKey, expected: Version) -> StoreResult<()> {
        let mut records = self.idempotency.write_recover();
        let current = records.get(key).map(|stored| stored.version);
        if current != Some(expected) {
            return Err(conflict(format!("idempotency/{key}"), Some(expected), current));
        }
        records.remove(key);
        Ok(())
    }

    async fn get(&self, key: &ScopedKey) -> StoreResult<Option<IdempotencyRecord>> {
        Ok(self.idempotency.read_recover().get(key).cloned())
    }

    async fn purge_expired(&self, now: Timestamp) -> StoreResult<usize> {
        let mut records = self.idempotency.write_recover();
        let before = records.len();
        records.retain(|_, record| !record.is_expired_at(now));
        Ok(before - records.len())
    }
}
