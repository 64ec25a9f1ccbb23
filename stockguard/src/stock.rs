//! Atomic stock manager.
//!
//! Per (SKU, order) pair stock moves through `NONE → RESERVED → COMMITTED` or
//! `RESERVED → RELEASED`:
//!
//! - **reserve** moves units from `available` to `reserved`; all or nothing.
//! - **commit** consumes reserved units; `available` is untouched.
//! - **release** moves reserved units back to `available`, the exact inverse
//!   of reserve.
//!
//! `available + reserved` only changes through [`restock`](AtomicStockManager::restock).
//! Every mutation goes through the [`VersionController`], so a writer that
//! bypasses the lock path (a batch correction job, say) can never interleave
//! with a reservation. Order-level operations write the order record and all
//! of its stock records in one store transaction.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::errors::{StockError, StoreResult};
use crate::order::{Order, OrderStatus};
use crate::store::{Expected, InventoryStore, Transaction};
use crate::types::{OrderId, Quantity, SkuId, Version};
use crate::version::{VersionController, VersionedTarget};

/// Stock counters for one SKU.
///
/// Invariant: `available + reserved` equals the physical stock, and both are
/// non-negative by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    /// The SKU
    pub sku: SkuId,
    /// Units free to reserve
    pub available: u64,
    /// Units held for in-flight orders
    pub reserved: u64,
    /// Store-assigned version, bumped on every write
    pub version: Version,
}

impl StockRecord {
    /// A fresh record with `units` available.
    pub fn new(sku: SkuId, units: u64) -> Self {
        Self {
            sku,
            available: units,
            reserved: 0,
            version: Version::initial(),
        }
    }

    /// Physical units on hand.
    pub const fn total(&self) -> u64 {
        self.available.saturating_add(self.reserved)
    }

    /// Moves `units` from available to reserved.
    pub fn reserve(&self, units: u64) -> Result<Self, StockError> {
        let available = self
            .available
            .checked_sub(units)
            .ok_or_else(|| StockError::InsufficientStock {
                sku: self.sku.clone(),
                requested: units,
                available: self.available,
            })?;
        let reserved = self
            .reserved
            .checked_add(units)
            .ok_or_else(|| StockError::CounterOverflow {
                sku: self.sku.clone(),
            })?;
        Ok(Self {
            available,
            reserved,
            ..self.clone()
        })
    }

    /// Consumes `units` of reserved stock.
    pub fn commit(&self, units: u64) -> Result<Self, StockError> {
        let reserved = self.take_reserved(units)?;
        Ok(Self {
            reserved,
            ..self.clone()
        })
    }

    /// Returns `units` of reserved stock to available.
    pub fn release(&self, units: u64) -> Result<Self, StockError> {
        let reserved = self.take_reserved(units)?;
        let available = self
            .available
            .checked_add(units)
            .ok_or_else(|| StockError::CounterOverflow {
                sku: self.sku.clone(),
            })?;
        Ok(Self {
            available,
            reserved,
            ..self.clone()
        })
    }

    /// Adds `units` of new physical stock.
    pub fn restock(&self, units: u64) -> Result<Self, StockError> {
        let available = self
            .available
            .checked_add(units)
            .filter(|available| available.checked_add(self.reserved).is_some())
            .ok_or_else(|| StockError::CounterOverflow {
                sku: self.sku.clone(),
            })?;
        Ok(Self {
            available,
            ..self.clone()
        })
    }

    fn take_reserved(&self, units: u64) -> Result<u64, StockError> {
        self.reserved
            .checked_sub(units)
            .ok_or_else(|| StockError::InsufficientReserved {
                sku: self.sku.clone(),
                requested: units,
                reserved: self.reserved,
            })
    }
}

/// Read-only view of a SKU for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockStats {
    /// Units free to reserve
    pub available: u64,
    /// Units held for in-flight orders
    pub reserved: u64,
    /// Current version
    pub version: Version,
}

impl From<&StockRecord> for StockStats {
    fn from(record: &StockRecord) -> Self {
        Self {
            available: record.available,
            reserved: record.reserved,
            version: record.version,
        }
    }
}

/// Why a reserved order gives its units back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseReason {
    /// The buyer or an operator cancelled it.
    Cancelled,
    /// The reservation outlived its TTL.
    Expired,
    /// Compensation after a failed placement commit.
    Aborted,
}

impl From<ReleaseReason> for OrderStatus {
    fn from(reason: ReleaseReason) -> Self {
        match reason {
            ReleaseReason::Cancelled => Self::Cancelled,
            ReleaseReason::Expired => Self::Expired,
            ReleaseReason::Aborted => Self::Aborted,
        }
    }
}

/// The records an inventory mutation reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryState {
    /// Stock records that exist, by SKU
    pub stock: BTreeMap<SkuId, StockRecord>,
    /// The order involved, if it exists
    pub order: Option<Order>,
}

impl InventoryState {
    fn record(&self, sku: &SkuId) -> Result<&StockRecord, StockError> {
        self.stock
            .get(sku)
            .ok_or_else(|| StockError::UnknownSku(sku.clone()))
    }

    fn update_each<F>(&mut self, demand: &BTreeMap<SkuId, u64>, mut op: F) -> Result<(), StockError>
    where
        F: FnMut(&StockRecord, u64) -> Result<StockRecord, StockError>,
    {
        for (sku, units) in demand {
            let updated = op(self.record(sku)?, *units)?;
            self.stock.insert(sku.clone(), updated);
        }
        Ok(())
    }
}

/// A set of stock records, and optionally one order, mutated as a unit.
struct InventoryTarget<'a, S: ?Sized> {
    store: &'a S,
    skus: Vec<SkuId>,
    order: Option<OrderId>,
}

#[async_trait]
impl<S> VersionedTarget for InventoryTarget<'_, S>
where
    S: InventoryStore + ?Sized,
{
    type State = InventoryState;
    type Committed = InventoryState;

    fn record_id(&self) -> String {
        let skus: Vec<String> = self.skus.iter().map(ToString::to_string).collect();
        match self.order {
            Some(order) => format!("order/{order}+stock/{}", skus.join(",")),
            None => format!("stock/{}", skus.join(",")),
        }
    }

    async fn read(&self) -> StoreResult<InventoryState> {
        let mut stock = BTreeMap::new();
        for sku in &self.skus {
            if let Some(record) = self.store.stock(sku).await? {
                stock.insert(sku.clone(), record);
            }
        }
        let order = match &self.order {
            Some(id) => self.store.order(id).await?,
            None => None,
        };
        Ok(InventoryState { stock, order })
    }

    async fn write_if_unchanged(
        &self,
        current: &InventoryState,
        mut next: InventoryState,
    ) -> StoreResult<InventoryState> {
        let mut transaction = Transaction::new();
        for (sku, record) in &next.stock {
            match current.stock.get(sku) {
                Some(before) if before == record => {}
                Some(before) => {
                    transaction =
                        transaction.put_stock(Expected::Exact(before.version), record.clone());
                }
                None => transaction = transaction.put_stock(Expected::Absent, record.clone()),
            }
        }
        match (&current.order, &next.order) {
            (None, Some(order)) => {
                transaction = transaction.put_order(Expected::Absent, order.clone());
            }
            (Some(before), Some(order)) if before != order => {
                transaction = transaction.put_order(Expected::Exact(before.version), order.clone());
            }
            _ => {}
        }

        if transaction.is_empty() {
            return Ok(next);
        }

        let receipt = self.store.commit(transaction).await?;
        for (sku, version) in receipt.stock {
            if let Some(record) = next.stock.get_mut(&sku) {
                record.version = version;
            }
        }
        if let Some(order) = next.order.as_mut() {
            if let Some(version) = receipt.orders.get(&order.id) {
                order.version = *version;
            }
        }
        Ok(next)
    }
}

/// Reserves, commits and releases stock through optimistic versioning.
#[derive(Debug, Clone)]
pub struct AtomicStockManager<S> {
    store: S,
    versions: VersionController,
}

impl<S> AtomicStockManager<S>
where
    S: InventoryStore,
{
    /// Creates a manager over `store`.
    pub const fn new(store: S, versions: VersionController) -> Self {
        Self { store, versions }
    }

    /// Creates the stock record for a newly published SKU.
    #[instrument(skip(self))]
    pub async fn register_sku(
        &self,
        sku: &SkuId,
        units: u64,
    ) -> Result<StockRecord, StockError> {
        let state = self
            .mutate(vec![sku.clone()], None, |state| {
                if state.stock.contains_key(sku) {
                    return Err(StockError::SkuExists(sku.clone()));
                }
                let mut next = state.clone();
                next.stock.insert(sku.clone(), StockRecord::new(sku.clone(), units));
                Ok(next)
            })
            .await?;
        info!(units, "SKU registered");
        Self::single(state, sku)
    }

    /// Adds physical units to a SKU.
    #[instrument(skip(self))]
    pub async fn restock(
        &self,
        sku: &SkuId,
        quantity: Quantity,
    ) -> Result<StockRecord, StockError> {
        self.mutate_one(sku, |record| record.restock(quantity.units()))
            .await
    }

    /// Reserves `quantity` units of `sku`.
    ///
    /// The caller is expected to hold the lock for `sku`; the version check
    /// still protects against writers that do not take it.
    #[instrument(skip(self))]
    pub async fn reserve(
        &self,
        sku: &SkuId,
        quantity: Quantity,
    ) -> Result<StockRecord, StockError> {
        self.mutate_one(sku, |record| record.reserve(quantity.units()))
            .await
    }

    /// Consumes `quantity` reserved units of `sku`.
    #[instrument(skip(self))]
    pub async fn commit(
        &self,
        sku: &SkuId,
        quantity: Quantity,
    ) -> Result<StockRecord, StockError> {
        self.mutate_one(sku, |record| record.commit(quantity.units()))
            .await
    }

    /// Returns `quantity` reserved units of `sku` to available.
    #[instrument(skip(self))]
    pub async fn release(
        &self,
        sku: &SkuId,
        quantity: Quantity,
    ) -> Result<StockRecord, StockError> {
        self.mutate_one(sku, |record| record.release(quantity.units()))
            .await
    }

    /// Current counters of a SKU.
    pub async fn stats(&self, sku: &SkuId) -> Result<StockStats, StockError> {
        self.store
            .stock(sku)
            .await
            .map_err(StockError::Store)?
            .map(|record| StockStats::from(&record))
            .ok_or_else(|| StockError::UnknownSku(sku.clone()))
    }

    /// Reserves every line of `order` and stores the order, atomically.
    ///
    /// Either every SKU is reserved and the order exists, or nothing changed.
    #[instrument(skip(self, order), fields(order = %order.id))]
    pub async fn reserve_order(&self, order: Order) -> Result<Order, StockError> {
        let demand = order.demand()?;
        let skus: Vec<SkuId> = demand.keys().cloned().collect();
        let state = self
            .mutate(skus, Some(order.id), |state| {
                if let Some(existing) = &state.order {
                    return Err(StockError::OrderNotPending {
                        order: existing.id,
                        status: existing.status,
                    });
                }
                let mut next = state.clone();
                next.update_each(&demand, StockRecord::reserve)?;
                next.order = Some(order.clone());
                Ok(next)
            })
            .await?;
        info!(lines = order.lines.len(), "order reserved");
        Self::stored_order(state, order.id)
    }

    /// Moves a reserved order to `Committed`, consuming its units.
    #[instrument(skip(self), fields(order = %id))]
    pub async fn commit_order(&self, id: OrderId) -> Result<Order, StockError> {
        let committed = self
            .transition(id, OrderStatus::Committed, StockRecord::commit)
            .await?;
        info!("order committed");
        Ok(committed)
    }

    /// Moves a reserved order to a released status, returning its units.
    #[instrument(skip(self), fields(order = %id))]
    pub async fn release_order(
        &self,
        id: OrderId,
        reason: ReleaseReason,
    ) -> Result<Order, StockError> {
        let released = self
            .transition(id, reason.into(), StockRecord::release)
            .await?;
        info!(status = %released.status, "order released");
        Ok(released)
    }

    /// Reads an order.
    pub async fn order(&self, id: OrderId) -> Result<Order, StockError> {
        self.store
            .order(&id)
            .await
            .map_err(StockError::Store)?
            .ok_or(StockError::OrderNotFound(id))
    }

    /// Orders currently in `status`.
    pub async fn orders_with_status(&self, status: OrderStatus) -> Result<Vec<Order>, StockError> {
        self.store
            .orders_with_status(status)
            .await
            .map_err(StockError::Store)
    }

    async fn transition(
        &self,
        id: OrderId,
        status: OrderStatus,
        op: fn(&StockRecord, u64) -> Result<StockRecord, StockError>,
    ) -> Result<Order, StockError> {
        // An order's lines never change, so its SKUs can be read up front.
        let skus = self.order(id).await?.skus();
        let state = self
            .mutate(skus, Some(id), |state| {
                let order = state.order.as_ref().ok_or(StockError::OrderNotFound(id))?;
                if order.status != OrderStatus::Reserved {
                    return Err(StockError::OrderNotPending {
                        order: id,
                        status: order.status,
                    });
                }
                let demand = order.demand()?;
                let mut next = state.clone();
                next.update_each(&demand, op)?;
                next.order = Some(order.clone().with_status(status));
                Ok(next)
            })
            .await?;
        Self::stored_order(state, id)
    }

    async fn mutate_one<F>(&self, sku: &SkuId, op: F) -> Result<StockRecord, StockError>
    where
        F: Fn(&StockRecord) -> Result<StockRecord, StockError> + Send + Sync,
    {
        let state = self
            .mutate(vec![sku.clone()], None, |state| {
                let updated = op(state.record(sku)?)?;
                let mut next = state.clone();
                next.stock.insert(sku.clone(), updated);
                Ok(next)
            })
            .await?;
        Self::single(state, sku)
    }

    async fn mutate<F>(
        &self,
        skus: Vec<SkuId>,
        order: Option<OrderId>,
        apply: F,
    ) -> Result<InventoryState, StockError>
    where
        F: FnMut(&InventoryState) -> Result<InventoryState, StockError> + Send,
    {
        let target = InventoryTarget {
            store: &self.store,
            skus,
            order,
        };
        Ok(self.versions.mutate(&target, apply).await?)
    }

    fn single(state: InventoryState, sku: &SkuId) -> Result<StockRecord, StockError> {
        state
            .stock
            .get(sku)
            .cloned()
            .ok_or_else(|| StockError::UnknownSku(sku.clone()))
    }

    fn stored_order(state: InventoryState, id: OrderId) -> Result<Order, StockError> {
        state.order.ok_or(StockError::OrderNotFound(id))
    }
}
