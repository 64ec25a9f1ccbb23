//! Order coordinator.
//!
//! The public entry point. It composes the other components for each request:
//!
//! 1. validate the request and claim its idempotency key;
//! 2. lock every SKU the order touches, in sorted order;
//! 3. inside the locks, reserve stock and store the order in one atomic
//!    commit through the version controller;
//! 4. release the locks and record the outcome against the key.
//!
//! Step 4 also runs when the caller drops a placement midway: the unfinished
//! placement hands its cleanup to a background task, so a timed-out request
//! neither holds its locks until they lapse nor pins its key as in progress.
//!
//! Raw store failures never reach the caller: they surface as
//! [`OrderError::TransactionAbort`] or [`OrderError::Internal`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::CoordinatorConfig;
use crate::errors::{ConfigError, GuardError, OrderError, OrderResult, StockError};
use crate::idempotency::{Begin, IdempotencyGuard, Outcome, ScopedKey, Ticket};
use crate::lock::{LockScope, LockSet, ResourceKeys, ResourceLockManager};
use crate::order::{Order, OrderLine, OrderLineRequest, OrderStatus, PlacedOrder};
use crate::stock::{AtomicStockManager, ReleaseReason, StockStats};
use crate::store::{IdempotencyStore, InventoryStore, LockStore};
use crate::types::{IdempotencyKey, OrderId, PrincipalId, Quantity, SkuId, Timestamp};
use crate::version::VersionController;

/// The canonical form of a placement request, used to detect a key reused
/// for a different request.
#[derive(Serialize)]
struct Fingerprint<'a> {
    buyer: &'a PrincipalId,
    lines: &'a [OrderLine],
}

/// Where a settlement should take a reserved order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Commit,
    Release(ReleaseReason),
}

impl Settlement {
    fn target(self) -> OrderStatus {
        match self {
            Self::Commit => OrderStatus::Committed,
            Self::Release(reason) => reason.into(),
        }
    }

    /// Whether an order already in `status` satisfies this settlement.
    fn is_satisfied_by(self, status: OrderStatus) -> bool {
        match self {
            Self::Commit => status == OrderStatus::Committed,
            Self::Release(_) => status.is_released(),
        }
    }
}

/// Result of a settlement: the order's status and whether this call moved it.
struct Settled {
    status: OrderStatus,
    changed: bool,
}

/// A claimed idempotency key and the leases taken on its behalf.
///
/// [`close`](Self::close) settles it in line. Dropping a placement that was
/// never closed spawns the same cleanup: release whatever may have been
/// reserved, give the leases back and free the key.
struct Placement<S>
where
    S: InventoryStore + LockStore + IdempotencyStore + Clone + 'static,
{
    guard: IdempotencyGuard<S>,
    stock: AtomicStockManager<S>,
    ticket: Option<Ticket>,
    order: OrderId,
    locks: Option<LockScope<S>>,
    outcome: Option<OrderResult<PlacedOrder>>,
    detached: bool,
}

impl<S> Placement<S>
where
    S: InventoryStore + LockStore + IdempotencyStore + Clone + 'static,
{
    async fn close(&mut self) {
        if self.outcome.is_none() {
            // The commit may have landed before the caller gave up.
            compensate(&self.stock, self.order).await;
        }
        if let Some(locks) = self.locks.take() {
            locks.release().await;
        }
        if let Some(ticket) = &self.ticket {
            record(&self.guard, ticket, self.outcome.as_ref()).await;
        }
        self.ticket = None;
    }
}

impl<S> Drop for Placement<S>
where
    S: InventoryStore + LockStore + IdempotencyStore + Clone + 'static,
{
    fn drop(&mut self) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        if self.detached {
            warn!(key = %ticket.key(), "placement cleanup never ran, key frees after the grace");
            return;
        }
        let mut orphan = Self {
            guard: self.guard.clone(),
            stock: self.stock.clone(),
            ticket: Some(ticket),
            order: self.order,
            locks: self.locks.take(),
            outcome: self.outcome.take(),
            detached: true,
        };
        if let Ok(runtime) = Handle::try_current() {
            warn!(order = %self.order, "placement dropped midway, cleaning up in the background");
            runtime.spawn(async move { orphan.close().await });
        }
    }
}

/// Places, confirms, cancels and expires orders without overselling.
///
/// Works against any store implementing all three ports; every piece of state
/// that must agree across nodes lives in that store.
#[derive(Debug, Clone)]
pub struct OrderCoordinator<S> {
    guard: IdempotencyGuard<S>,
    locks: ResourceLockManager<S>,
    stock: AtomicStockManager<S>,
    reservation_ttl: Duration,
}

impl<S> OrderCoordinator<S>
where
    S: InventoryStore + LockStore + IdempotencyStore + Clone + 'static,
{
    /// Creates a coordinator over `store`.
    ///
    /// A config that fails [`CoordinatorConfig::validate`] is accepted with a
    /// warning; use [`try_new`](Self::try_new) to reject it instead.
    pub fn new(store: S, config: CoordinatorConfig) -> Self {
        if let Err(error) = config.validate() {
            warn!(%error, "coordinator config lets duplicates reclaim live keys");
        }
        let versions = VersionController::new(config.retries);
        Self {
            guard: IdempotencyGuard::new(store.clone(), config.idempotency),
            locks: ResourceLockManager::new(store.clone(), config.locks),
            stock: AtomicStockManager::new(store, versions),
            reservation_ttl: config.reservation_ttl.as_duration(),
        }
    }

    /// Creates a coordinator over `store` if `config` is consistent.
    pub fn try_new(store: S, config: CoordinatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(store, config))
    }

    /// The stock manager, for callers that need single-SKU operations.
    pub const fn stock(&self) -> &AtomicStockManager<S> {
        &self.stock
    }

    /// Places an order, reserving stock for every line.
    ///
    /// `idempotency_key` is mandatory. Repeating a call with the same key,
    /// buyer and lines returns the first call's result without touching stock
    /// again; a repeat that arrives while the first is still running gets
    /// [`OrderError::IdempotencyConflict`].
    #[instrument(skip_all, fields(buyer = %buyer, lines = lines.len()))]
    pub async fn place_order(
        &self,
        idempotency_key: Option<&str>,
        buyer: &str,
        lines: &[OrderLineRequest],
    ) -> OrderResult<PlacedOrder> {
        let key = idempotency_key
            .and_then(|key| IdempotencyKey::try_new(key).ok())
            .ok_or(OrderError::MissingIdempotencyKey)?;
        let buyer =
            PrincipalId::try_new(buyer).map_err(|_| OrderError::InvalidBuyer(buyer.to_string()))?;
        let lines = validate_lines(lines)?;

        let scope = ScopedKey::new(buyer.clone(), key);
        let fingerprint = serde_json::to_string(&Fingerprint {
            buyer: &buyer,
            lines: &lines,
        })
        .map_err(|error| OrderError::Internal(error.to_string()))?;

        let ticket = match self.guard.begin(&scope, &fingerprint).await {
            Ok(Begin::Proceed(ticket)) => ticket,
            Ok(Begin::Replay(outcome)) => {
                debug!(key = %scope, "replaying stored placement");
                return outcome
                    .restore::<PlacedOrder, OrderError>()
                    .map_err(|error| OrderError::Internal(error.to_string()))?;
            }
            Ok(Begin::Conflict) => {
                return Err(OrderError::IdempotencyConflict {
                    key: scope.to_string(),
                })
            }
            Err(error) => return Err(guard_error(error)),
        };

        let order = Order::reserved(buyer, lines);
        let mut placement = Placement {
            guard: self.guard.clone(),
            stock: self.stock.clone(),
            ticket: Some(ticket),
            order: order.id,
            locks: None,
            outcome: None,
            detached: false,
        };
        let result = self.reserve(&mut placement, order).await;
        placement.outcome = Some(result.clone());
        placement.close().await;
        result
    }

    async fn reserve(
        &self,
        placement: &mut Placement<S>,
        order: Order,
    ) -> OrderResult<PlacedOrder> {
        let keys = ResourceKeys::for_skus(&order.skus());
        let locks = placement
            .locks
            .insert(self.locks.acquire_scoped(&keys).await?);
        self.reserve_locked(locks.set_mut(), order).await
    }

    async fn reserve_locked(&self, locks: &mut LockSet, order: Order) -> OrderResult<PlacedOrder> {
        // Never commit on a lease that may already belong to someone else.
        self.locks.renew(locks).await?;

        let id = order.id;
        match self.stock.reserve_order(order).await {
            Ok(stored) => {
                info!(order = %stored.id, total_cents = stored.total_cents(), "order placed");
                Ok(PlacedOrder {
                    order_id: stored.id,
                    status: stored.status,
                })
            }
            Err(StockError::Store(cause)) => {
                compensate(&self.stock, id).await;
                Err(OrderError::TransactionAbort {
                    order: id,
                    reason: cause.to_string(),
                })
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Cancels a reserved order, returning its units to `available`.
    ///
    /// Cancelling an order that was already released returns its status.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: OrderId) -> OrderResult<OrderStatus> {
        let settled = self
            .settle(order_id, Settlement::Release(ReleaseReason::Cancelled))
            .await?;
        Ok(settled.status)
    }

    /// Confirms payment for a reserved order, consuming its units.
    ///
    /// Confirming an order that is already committed returns its status.
    #[instrument(skip(self))]
    pub async fn confirm_order(&self, order_id: OrderId) -> OrderResult<OrderStatus> {
        let settled = self.settle(order_id, Settlement::Commit).await?;
        Ok(settled.status)
    }

    /// Releases every reservation older than the reservation TTL.
    ///
    /// Returns how many orders this call expired. Orders that could not be
    /// settled now are left for the next sweep.
    #[instrument(skip(self))]
    pub async fn expire_reservations(&self) -> OrderResult<usize> {
        let cutoff = Timestamp::now().saturating_sub(self.reservation_ttl);
        let stale: Vec<Order> = self
            .stock
            .orders_with_status(OrderStatus::Reserved)
            .await?
            .into_iter()
            .filter(|order| order.created_at <= cutoff)
            .collect();

        let mut expired = 0;
        for order in stale {
            match self
                .settle(order.id, Settlement::Release(ReleaseReason::Expired))
                .await
            {
                Ok(Settled { changed: true, .. }) => expired += 1,
                Ok(_) => {}
                Err(error) => warn!(order = %order.id, %error, "could not expire reservation"),
            }
        }
        if expired > 0 {
            info!(expired, "expired stale reservations");
        }
        Ok(expired)
    }

    async fn settle(&self, id: OrderId, settlement: Settlement) -> OrderResult<Settled> {
        let order = self.stock.order(id).await?;
        if let Some(settled) = Self::already_settled(&order, settlement)? {
            return Ok(settled);
        }

        let keys = ResourceKeys::for_skus(&order.skus());
        let locks = self.locks.acquire_scoped(&keys).await?;
        let result = match settlement {
            Settlement::Commit => self.stock.commit_order(id).await,
            Settlement::Release(reason) => self.stock.release_order(id, reason).await,
        };
        locks.release().await;

        match result {
            Ok(order) => Ok(Settled {
                status: order.status,
                changed: true,
            }),
            // Someone else settled it between our read and our write.
            Err(StockError::OrderNotPending { order, status }) => {
                let current = self.stock.order(order).await?;
                Self::already_settled(&current, settlement)?.ok_or(OrderError::InvalidOrderState {
                    order,
                    status,
                })
            }
            Err(error) => Err(error.into()),
        }
    }

    /// `Some` when `order` has left `Reserved`: success if it is already where
    /// `settlement` would take it, otherwise the state error.
    fn already_settled(order: &Order, settlement: Settlement) -> OrderResult<Option<Settled>> {
        if order.status == OrderStatus::Reserved {
            return Ok(None);
        }
        if settlement.is_satisfied_by(order.status) {
            debug!(
                order = %order.id,
                status = %order.status,
                wanted = %settlement.target(),
                "order already settled"
            );
            return Ok(Some(Settled {
                status: order.status,
                changed: false,
            }));
        }
        Err(OrderError::InvalidOrderState {
            order: order.id,
            status: order.status,
        })
    }

    /// Reads an order.
    pub async fn get_order(&self, order_id: OrderId) -> OrderResult<Order> {
        Ok(self.stock.order(order_id).await?)
    }

    /// Current counters of a SKU.
    pub async fn get_stock_stats(&self, sku: &str) -> OrderResult<StockStats> {
        let sku = SkuId::try_new(sku).map_err(|_| OrderError::InvalidSku(sku.to_string()))?;
        Ok(self.stock.stats(&sku).await?)
    }

    /// Publishes a SKU with `units` available.
    pub async fn register_sku(&self, sku: &SkuId, units: u64) -> Result<StockStats, StockError> {
        let record = self.stock.register_sku(sku, units).await?;
        Ok(StockStats::from(&record))
    }

    /// Adds physical units to a SKU.
    pub async fn restock(&self, sku: &SkuId, quantity: Quantity) -> Result<StockStats, StockError> {
        let record = self.stock.restock(sku, quantity).await?;
        Ok(StockStats::from(&record))
    }

    /// Deletes idempotency records past their TTL.
    pub async fn purge_idempotency_records(&self) -> Result<usize, GuardError> {
        self.guard.purge_expired().await
    }
}

/// Stores the outcome against the key, or forgets the key when there is no
/// outcome or the failure is worth retrying.
async fn record<S>(
    guard: &IdempotencyGuard<S>,
    ticket: &Ticket,
    outcome: Option<&OrderResult<PlacedOrder>>,
) where
    S: IdempotencyStore,
{
    let recorded = match outcome {
        Some(Err(error)) if error.is_retryable() => {
            debug!(code = error.code(), "retryable failure, abandoning key");
            guard.abandon(ticket).await
        }
        Some(result) => match Outcome::capture(result) {
            Ok(outcome) => guard.finish(ticket, outcome).await,
            Err(error) => Err(error),
        },
        None => {
            debug!("abandoning key of an unfinished placement");
            guard.abandon(ticket).await
        }
    };
    if let Err(error) = recorded {
        // The in-progress record lapses after the grace period.
        warn!(key = %ticket.key(), %error, "could not record idempotent outcome");
    }
}

/// Releases whatever a failed placement may have committed.
///
/// A store error from the commit is ambiguous: the write may have landed.
/// If compensation fails as well the order stays `Reserved` and the expiry
/// sweep releases it later.
async fn compensate<S>(stock: &AtomicStockManager<S>, id: OrderId)
where
    S: InventoryStore,
{
    match stock.release_order(id, ReleaseReason::Aborted).await {
        Ok(_) => warn!(order = %id, "placement commit landed before failing; stock released"),
        Err(StockError::OrderNotFound(_)) => {
            debug!(order = %id, "placement commit did not land; nothing to release");
        }
        Err(error) => {
            error!(order = %id, %error, "compensation failed; reservation left to expire");
        }
    }
}

fn validate_lines(lines: &[OrderLineRequest]) -> OrderResult<Vec<OrderLine>> {
    if lines.is_empty() {
        return Err(OrderError::EmptyOrder);
    }
    let mut demand: BTreeMap<SkuId, u64> = BTreeMap::new();
    lines
        .iter()
        .map(|line| {
            let invalid_quantity = || OrderError::InvalidQuantity {
                sku: line.sku.clone(),
                quantity: line.quantity,
            };
            let sku = SkuId::try_new(line.sku.as_str())
                .map_err(|_| OrderError::InvalidSku(line.sku.clone()))?;
            let quantity = Quantity::from_signed(line.quantity).ok_or_else(invalid_quantity)?;
            // Lines for the same SKU add up; the sum must stay countable.
            let total = demand.entry(sku.clone()).or_default();
            *total = total
                .checked_add(quantity.units())
                .ok_or_else(invalid_quantity)?;
            Ok(OrderLine {
                sku,
                quantity,
                unit_price_cents: line.unit_price_cents,
            })
        })
        .collect()
}

fn guard_error(error: GuardError) -> OrderError {
    match error {
        GuardError::KeyReuse { key } => OrderError::IdempotencyKeyReuse { key },
        GuardError::Superseded { key } => OrderError::IdempotencyConflict { key },
        other => OrderError::Internal(other.to_string()),
    }
}
