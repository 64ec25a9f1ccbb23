//! Error types for `StockGuard`.
//!
//! Each subsystem has its own error enum so that callers deep in the stack can
//! react precisely (a version conflict is retried, a lost lease aborts the
//! critical section). They all converge into [`OrderError`], the only error the
//! public order operations return. `OrderError` is a finite taxonomy with a
//! stable [`code`](OrderError::code) and a human readable message; raw store
//! failures are never surfaced through it.
//!
//! # Error Categories
//!
//! - **StoreError**: persistence layer failures and conditional-write conflicts
//! - **LockError**: lock acquisition timeouts and lost leases
//! - **MutationError**: optimistic retry loop outcomes
//! - **StockError**: stock arithmetic and order state machine rejections
//! - **GuardError**: idempotency record bookkeeping failures
//! - **ConfigError**: settings that are valid alone but unsafe together
//! - **OrderError**: what callers of the coordinator see

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::order::OrderStatus;
use crate::types::{OrderId, ResourceKey, SkuId, Version};

/// Errors raised by store implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A conditional write found a different version than expected.
    #[error("version conflict on '{record}': expected {expected:?}, found {current:?}")]
    VersionConflict {
        /// The record whose expectation failed
        record: String,
        /// The version the writer expected (`None` = expected absent)
        expected: Option<Version>,
        /// The version actually stored (`None` = absent)
        current: Option<Version>,
    },

    /// The requested record does not exist.
    #[error("record '{0}' not found")]
    NotFound(String),

    /// The transaction was rolled back by the store.
    #[error("transaction rolled back: {0}")]
    TransactionRollback(String),

    /// The store is temporarily unavailable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An unexpected internal error occurred.
    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether this error is an optimistic concurrency conflict.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the resource lock manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// Not every requested lock could be acquired in time.
    #[error("timed out after {waited:?} waiting for lock on '{key}'")]
    Timeout {
        /// The key that was still held by someone else
        key: ResourceKey,
        /// How long the caller waited in total
        waited: Duration,
    },

    /// A lease expired and may have been reassigned; the critical section is
    /// no longer protected.
    #[error("lock on '{key}' was lost")]
    Lost {
        /// The key whose lease is gone
        key: ResourceKey,
    },

    /// The lock store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the optimistic version controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError<E> {
    /// The mutation function rejected the current state. Never retried.
    #[error("mutation rejected: {0}")]
    Rejected(E),

    /// Every attempt lost the race to another writer.
    #[error("gave up on '{record}' after {attempts} conflicting attempts")]
    ConflictExhausted {
        /// The record being mutated
        record: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// The store failed for a reason other than a version conflict.
    #[error(transparent)]
    Store(StoreError),
}

/// Rejections from the atomic stock manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StockError {
    /// Fewer units are available than requested.
    #[error("insufficient stock for '{sku}': requested {requested}, available {available}")]
    InsufficientStock {
        /// The SKU that ran short
        sku: SkuId,
        /// Units requested
        requested: u64,
        /// Units available at the time of the check
        available: u64,
    },

    /// Fewer units are reserved than a commit or release needs.
    #[error("'{sku}' has only {reserved} reserved units, cannot settle {requested}")]
    InsufficientReserved {
        /// The SKU involved
        sku: SkuId,
        /// Units the operation needed
        requested: u64,
        /// Units currently reserved
        reserved: u64,
    },

    /// A restock or a summed demand would overflow the counters.
    #[error("units for '{sku}' overflow its counters")]
    CounterOverflow {
        /// The SKU involved
        sku: SkuId,
    },

    /// No stock record exists for the SKU.
    #[error("unknown SKU '{0}'")]
    UnknownSku(SkuId),

    /// A stock record already exists for the SKU.
    #[error("SKU '{0}' is already registered")]
    SkuExists(SkuId),

    /// The order does not exist.
    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    /// The order has left the `Reserved` state.
    #[error("order {order} is {status}, not reserved")]
    OrderNotPending {
        /// The order involved
        order: OrderId,
        /// Its current status
        status: OrderStatus,
    },

    /// Optimistic retries were exhausted.
    #[error("gave up on '{record}' after {attempts} conflicting attempts")]
    ConflictExhausted {
        /// The record being mutated
        record: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// The store failed.
    #[error(transparent)]
    Store(StoreError),
}

impl From<MutationError<Self>> for StockError {
    fn from(error: MutationError<Self>) -> Self {
        match error {
            MutationError::Rejected(inner) => inner,
            MutationError::ConflictExhausted { record, attempts } => {
                Self::ConflictExhausted { record, attempts }
            }
            MutationError::Store(store) => Self::Store(store),
        }
    }
}

/// Errors from the idempotency guard.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    /// The key was reused with a different request body.
    #[error("idempotency key '{key}' was already used for a different request")]
    KeyReuse {
        /// The scoped key
        key: String,
    },

    /// The in-flight record was taken over by another attempt.
    #[error("idempotency record '{key}' was superseded by another attempt")]
    Superseded {
        /// The scoped key
        key: String,
    },

    /// The outcome could not be serialized into a snapshot.
    #[error("could not snapshot outcome: {0}")]
    Snapshot(String),

    /// The idempotency store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Settings that are each in range but unsafe in combination.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The in-progress grace does not outlast a placement's critical section.
    #[error("in-progress grace {grace:?} must exceed lock timeout plus lease ({minimum:?})")]
    GraceTooShort {
        /// The configured grace
        grace: Duration,
        /// Lock acquire timeout plus one lease
        minimum: Duration,
    },
}

/// The errors returned by the public order operations.
///
/// Every variant maps to a stable [`code`](Self::code). Variants are
/// serializable so a failed outcome can be stored in an idempotency record and
/// replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum OrderError {
    /// Business rule: not enough stock. Not retried automatically.
    #[error("insufficient stock for '{sku}': requested {requested}, available {available}")]
    InsufficientStock {
        /// The SKU that ran short
        sku: SkuId,
        /// Units requested
        requested: u64,
        /// Units available
        available: u64,
    },

    /// A line asked for zero or a negative number of units.
    #[error("invalid quantity {quantity} for SKU '{sku}'")]
    InvalidQuantity {
        /// The SKU on the offending line
        sku: String,
        /// The rejected quantity
        quantity: i64,
    },

    /// A line named a malformed SKU.
    #[error("invalid SKU '{0}'")]
    InvalidSku(String),

    /// A line named a SKU with no stock record.
    #[error("unknown SKU '{0}'")]
    UnknownSku(SkuId),

    /// The order had no lines.
    #[error("an order needs at least one line")]
    EmptyOrder,

    /// The request carried no idempotency key.
    #[error("an Idempotency-Key is required")]
    MissingIdempotencyKey,

    /// The request carried a malformed buyer id.
    #[error("invalid buyer '{0}'")]
    InvalidBuyer(String),

    /// A request with the same key is still being processed.
    #[error("request with idempotency key '{key}' is already processing")]
    IdempotencyConflict {
        /// The scoped key
        key: String,
    },

    /// The key was already used for a different request.
    #[error("idempotency key '{key}' was already used for a different request")]
    IdempotencyKeyReuse {
        /// The scoped key
        key: String,
    },

    /// Locks could not be acquired in time.
    #[error("resource '{key}' is busy, try again")]
    LockTimeout {
        /// The contended resource
        key: String,
    },

    /// A lock lease expired mid-operation; nothing was committed.
    #[error("lost the lock on '{key}', try again")]
    LockLost {
        /// The resource whose lease expired
        key: String,
    },

    /// Optimistic retries were exhausted.
    #[error("'{record}' is under heavy contention, try again")]
    ConflictExhausted {
        /// The contended record
        record: String,
    },

    /// The order commit failed after reservation; stock was released.
    #[error("order {order} could not be committed: {reason}")]
    TransactionAbort {
        /// The order that was aborted
        order: OrderId,
        /// Human readable cause
        reason: String,
    },

    /// No such order.
    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    /// The order's status does not allow the operation.
    #[error("order {order} is {status}")]
    InvalidOrderState {
        /// The order involved
        order: OrderId,
        /// Its current status
        status: OrderStatus,
    },

    /// Anything else; details are logged, not surfaced.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrderError {
    /// A stable machine-readable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            Self::InvalidQuantity { .. } => "INVALID_QUANTITY",
            Self::InvalidSku(_) => "INVALID_SKU",
            Self::UnknownSku(_) => "UNKNOWN_SKU",
            Self::EmptyOrder => "EMPTY_ORDER",
            Self::MissingIdempotencyKey => "MISSING_IDEMPOTENCY_KEY",
            Self::InvalidBuyer(_) => "INVALID_BUYER",
            Self::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            Self::IdempotencyKeyReuse { .. } => "IDEMPOTENCY_KEY_REUSE",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::LockLost { .. } => "LOCK_LOST",
            Self::ConflictExhausted { .. } => "CONFLICT_EXHAUSTED",
            Self::TransactionAbort { .. } => "TRANSACTION_ABORT",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::InvalidOrderState { .. } => "INVALID_ORDER_STATE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the caller may retry the same request later.
    ///
    /// Contention and infrastructure failures are retryable; business rules
    /// and validation failures are not.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IdempotencyConflict { .. }
                | Self::LockTimeout { .. }
                | Self::LockLost { .. }
                | Self::ConflictExhausted { .. }
                | Self::TransactionAbort { .. }
                | Self::Internal(_)
        )
    }
}

impl From<LockError> for OrderError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Timeout { key, .. } => Self::LockTimeout {
                key: key.to_string(),
            },
            LockError::Lost { key } => Self::LockLost {
                key: key.to_string(),
            },
            LockError::Store(store) => Self::Internal(store.to_string()),
        }
    }
}

impl From<StockError> for OrderError {
    fn from(error: StockError) -> Self {
        match error {
            StockError::InsufficientStock {
                sku,
                requested,
                available,
            } => Self::InsufficientStock {
                sku,
                requested,
                available,
            },
            StockError::UnknownSku(sku) => Self::UnknownSku(sku),
            StockError::OrderNotFound(order) => Self::OrderNotFound(order),
            StockError::OrderNotPending { order, status } => {
                Self::InvalidOrderState { order, status }
            }
            StockError::ConflictExhausted { record, .. } => Self::ConflictExhausted { record },
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Result type for the public order operations.
pub type OrderResult<T> = Result<T, OrderError>;
