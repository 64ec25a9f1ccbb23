//! `StockGuard` - oversell-proof, retry-safe order placement
//!
//! A concurrency-safety layer for order placement and inventory mutation.
//! Four cooperating primitives, composed by the [`OrderCoordinator`]:
//!
//! - [`IdempotencyGuard`]: at-most-once execution per client-supplied key
//! - [`ResourceLockManager`]: leased locks over SKUs, always taken in sorted order
//! - [`VersionController`]: read / compare-and-swap / retry on versioned records
//! - [`AtomicStockManager`]: the reserve / commit / release state machine
//!
//! The crate owns no storage. Hosts plug in a store implementing
//! [`InventoryStore`], [`LockStore`] and [`IdempotencyStore`]; an in-memory
//! implementation lives in `stockguard-memory`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod idempotency;
pub mod lock;
pub mod order;
pub mod retry;
pub mod stock;
pub mod store;
pub mod types;
pub mod version;

pub use config::{
    AcquireMode, BackoffConfig, ConflictRetryConfig, CoordinatorConfig, IdempotencyConfig,
    LockConfig,
};
pub use coordinator::OrderCoordinator;
pub use errors::{
    ConfigError, GuardError, LockError, MutationError, OrderError, OrderResult, StockError,
    StoreError, StoreResult,
};
pub use idempotency::{
    Begin, IdempotencyGuard, IdempotencyRecord, IdempotencyStatus, Outcome, ScopedKey, Ticket,
};
pub use lock::{LockHandle, LockScope, LockSet, ResourceKeys, ResourceLockManager};
pub use order::{Order, OrderLine, OrderLineRequest, OrderStatus, PlacedOrder};
pub use retry::BackoffPolicy;
pub use stock::{AtomicStockManager, ReleaseReason, StockRecord, StockStats};
pub use store::{
    CommitReceipt, Expected, IdempotencyStore, InventoryStore, LockLease, LockStore, Transaction,
};
pub use types::{
    IdempotencyKey, OrderId, OwnerToken, PrincipalId, Quantity, ResourceKey, SkuId, Timestamp,
    Version,
};
pub use version::{VersionController, VersionedTarget};
