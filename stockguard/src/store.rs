//! Store ports.
//!
//! `StockGuard` does not own a storage engine. It defines the contracts a
//! document, relational or key-value store must satisfy to host the protocol:
//!
//! - [`InventoryStore`]: stock records and orders, with an all-or-nothing
//!   multi-record [`commit`](InventoryStore::commit) conditioned on versions.
//! - [`LockStore`]: leased, owner-tagged locks with atomic
//!   create-if-absent-or-expired acquisition.
//! - [`IdempotencyStore`]: idempotency records with insert-if-absent and
//!   version-conditioned replace/remove.
//!
//! All state that must be consistent across nodes lives behind these traits;
//! nothing in the protocol relies on process-local memory for correctness.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::StoreResult;
use crate::idempotency::{IdempotencyRecord, ScopedKey};
use crate::order::{Order, OrderStatus};
use crate::stock::StockRecord;
use crate::types::{OrderId, OwnerToken, ResourceKey, SkuId, Timestamp, Version};

/// The expectation a conditional write places on the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expected {
    /// The record must not exist yet.
    Absent,
    /// The record must exist at exactly this version.
    Exact(Version),
}

impl Expected {
    /// The version a record gets when this expectation is met.
    pub fn resulting_version(self) -> Version {
        match self {
            Self::Absent => Version::initial(),
            Self::Exact(version) => version.next(),
        }
    }

    /// Whether a record currently at `current` satisfies this expectation.
    pub fn is_met_by(self, current: Option<Version>) -> bool {
        match (self, current) {
            (Self::Absent, None) => true,
            (Self::Exact(expected), Some(actual)) => expected == actual,
            _ => false,
        }
    }

    /// The expected version, if any, for error reporting.
    pub const fn version(self) -> Option<Version> {
        match self {
            Self::Absent => None,
            Self::Exact(version) => Some(version),
        }
    }
}

/// A conditional write of a stock record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockWrite {
    /// Expectation on the stored record
    pub expected: Expected,
    /// The new state; its `version` field is ignored and assigned by the store
    pub record: StockRecord,
}

/// A conditional write of an order record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderWrite {
    /// Expectation on the stored record
    pub expected: Expected,
    /// The new state; its `version` field is ignored and assigned by the store
    pub order: Order,
}

/// A set of writes that commit together or not at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    /// Stock writes
    pub stock: Vec<StockWrite>,
    /// Order writes
    pub orders: Vec<OrderWrite>,
}

impl Transaction {
    /// An empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stock write.
    #[must_use]
    pub fn put_stock(mut self, expected: Expected, record: StockRecord) -> Self {
        self.stock.push(StockWrite { expected, record });
        self
    }

    /// Adds an order write.
    #[must_use]
    pub fn put_order(mut self, expected: Expected, order: Order) -> Self {
        self.orders.push(OrderWrite { expected, order });
        self
    }

    /// Whether the transaction writes nothing.
    pub fn is_empty(&self) -> bool {
        self.stock.is_empty() && self.orders.is_empty()
    }
}

/// Versions assigned by a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// New version of each written stock record
    pub stock: HashMap<SkuId, Version>,
    /// New version of each written order
    pub orders: HashMap<OrderId, Version>,
}

/// Storage for stock records and orders.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Reads the stock record for a SKU.
    async fn stock(&self, sku: &SkuId) -> StoreResult<Option<StockRecord>>;

    /// Reads an order.
    async fn order(&self, id: &OrderId) -> StoreResult<Option<Order>>;

    /// Lists orders currently in `status`.
    async fn orders_with_status(&self, status: OrderStatus) -> StoreResult<Vec<Order>>;

    /// Applies every write in `transaction` atomically.
    ///
    /// If any expectation is not met nothing is written and
    /// [`StoreError::VersionConflict`](crate::errors::StoreError::VersionConflict)
    /// is returned. On success every written record is stored with the version
    /// given by [`Expected::resulting_version`].
    async fn commit(&self, transaction: Transaction) -> StoreResult<CommitReceipt>;
}

/// A lock lease as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    /// The locked resource
    pub key: ResourceKey,
    /// The current holder
    pub owner: OwnerToken,
    /// When the lease lapses
    pub expires_at: Timestamp,
}

impl LockLease {
    /// Whether the lease is still in force at `now`.
    pub fn is_valid_at(&self, now: Timestamp) -> bool {
        self.expires_at > now
    }
}

/// Storage for lock leases.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically takes the lease on `key` for `owner` if it is free, expired,
    /// or already held by `owner`. Returns whether `owner` now holds it.
    async fn try_acquire(
        &self,
        key: &ResourceKey,
        owner: OwnerToken,
        expires_at: Timestamp,
        now: Timestamp,
    ) -> StoreResult<bool>;

    /// Extends a lease still validly held by `owner`. Returns `false` if the
    /// lease is gone, expired, or held by someone else.
    async fn renew(
        &self,
        key: &ResourceKey,
        owner: OwnerToken,
        expires_at: Timestamp,
        now: Timestamp,
    ) -> StoreResult<bool>;

    /// Drops the lease if `owner` holds it. Otherwise does nothing.
    async fn release(&self, key: &ResourceKey, owner: OwnerToken) -> StoreResult<()>;

    /// Reads the current lease, expired or not.
    async fn lease(&self, key: &ResourceKey) -> StoreResult<Option<LockLease>>;
}

/// Storage for idempotency records.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Inserts `record` unless one exists for its key. Returns the existing
    /// record when the insert did not happen.
    async fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> StoreResult<Option<IdempotencyRecord>>;

    /// Replaces the record if it is still at `expected`; the stored record
    /// gets version `expected + 1`.
    async fn replace(&self, record: IdempotencyRecord, expected: Version) -> StoreResult<()>;

    /// Deletes the record if it is still at `expected`.
    async fn remove(&self, key: &ScopedKey, expected: Version) -> StoreResult<()>;

    /// Reads a record.
    async fn get(&self, key: &ScopedKey) -> StoreResult<Option<IdempotencyRecord>>;

    /// Deletes every record whose TTL lapsed before `now`. Returns how many.
    async fn purge_expired(&self, now: Timestamp) -> StoreResult<usize>;
}
