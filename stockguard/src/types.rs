//! Core types for the `StockGuard` order-placement protocol.
//!
//! This module defines the identifiers and scalar values used throughout the
//! library. All types use smart constructors to ensure validity at construction
//! time, following the "parse, don't validate" principle: once a `SkuId` or a
//! `Quantity` exists it never needs to be checked again.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a stock-keeping unit.
///
/// `SkuId` values are trimmed, non-empty and at most 128 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct SkuId(String);

/// A positive number of stock units.
///
/// Zero and negative quantities cannot be represented, so every stock
/// operation that accepts a `Quantity` is free of that edge case.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct Quantity(u64);

impl Quantity {
    /// Parses a quantity from an untrusted signed integer.
    ///
    /// Returns `None` for zero and negative values.
    pub fn from_signed(value: i64) -> Option<Self> {
        u64::try_from(value)
            .ok()
            .and_then(|v| Self::try_new(v).ok())
    }

    /// Returns the number of units.
    pub fn units(self) -> u64 {
        self.into_inner()
    }
}

/// Monotonic version of a stored record.
///
/// Versions start at 0 when a record is created and are incremented by the
/// store on every successful conditional write.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    From,
    Into,
    Serialize,
    Deserialize
))]
pub struct Version(u64);

impl Version {
    /// The version of a freshly created record.
    pub fn initial() -> Self {
        Self::new(0)
    }

    /// Returns the version a successful write produces from this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }
}

/// A client-supplied token identifying one logical request.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct IdempotencyKey(String);

/// The acting user or session. Idempotency keys are scoped by it and orders
/// record it as the buyer.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct PrincipalId(String);

/// Name of a lockable resource, typically a SKU.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ResourceKey(String);

impl From<&SkuId> for ResourceKey {
    fn from(sku: &SkuId) -> Self {
        Self::try_new(sku.as_ref().to_string()).expect("a SkuId is always a valid ResourceKey")
    }
}

/// Globally unique order identifier (UUIDv7, so ids sort by creation time).
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    AsRef,
    Display,
    Serialize,
    Deserialize
))]
pub struct OrderId(Uuid);

impl OrderId {
    /// Generates a fresh order id.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// Identifies the holder of a lock lease.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    AsRef,
    Display,
    Serialize,
    Deserialize
))]
pub struct OwnerToken(Uuid);

impl OwnerToken {
    /// Generates a fresh owner token.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// A point in time, shared by every node touching the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Returns this timestamp moved `duration` into the future, saturating at
    /// the largest representable instant.
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        let delta = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
        Self(
            self.0
                .checked_add_signed(delta)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    /// Returns this timestamp moved `duration` into the past, saturating at
    /// the smallest representable instant.
    #[must_use]
    pub fn saturating_sub(self, duration: Duration) -> Self {
        let delta = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
        Self(
            self.0
                .checked_sub_signed(delta)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        )
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
