//! Orders and their lines.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::StockError;
use crate::types::{OrderId, PrincipalId, Quantity, SkuId, Timestamp, Version};

/// Lifecycle of an order and of the stock it holds.
///
/// `Reserved` is the only non-terminal status. `Committed` consumes the
/// reserved units; every other terminal status returns them to `available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Stock is held for the order, awaiting payment.
    Reserved,
    /// Payment confirmed; the reserved units are consumed.
    Committed,
    /// Cancelled by the buyer or an operator.
    Cancelled,
    /// The reservation outlived its time-to-live.
    Expired,
    /// The placement failed after its commit; released by compensation.
    Aborted,
}

impl OrderStatus {
    /// Whether the order's units went back to `available`.
    pub const fn is_released(self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired | Self::Aborted)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reserved => "reserved",
            Self::Committed => "committed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// One validated line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    /// The SKU ordered
    pub sku: SkuId,
    /// Units ordered
    pub quantity: Quantity,
    /// Unit price in minor currency units
    pub unit_price_cents: u64,
}

/// A line as submitted by a client, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineRequest {
    /// Raw SKU identifier
    pub sku: String,
    /// Raw quantity; must be positive
    pub quantity: i64,
    /// Unit price in minor currency units
    pub unit_price_cents: u64,
}

impl OrderLineRequest {
    /// Convenience constructor.
    pub fn new(sku: impl Into<String>, quantity: i64, unit_price_cents: u64) -> Self {
        Self {
            sku: sku.into(),
            quantity,
            unit_price_cents,
        }
    }
}

/// An order record as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier
    pub id: OrderId,
    /// Who placed it
    pub buyer: PrincipalId,
    /// Current status
    pub status: OrderStatus,
    /// Validated lines
    pub lines: Vec<OrderLine>,
    /// When it was placed
    pub created_at: Timestamp,
    /// When its status last changed
    pub updated_at: Timestamp,
    /// Store-assigned version
    pub version: Version,
}

impl Order {
    /// Creates a new order in the `Reserved` status.
    pub fn reserved(buyer: PrincipalId, lines: Vec<OrderLine>) -> Self {
        let now = Timestamp::now();
        Self {
            id: OrderId::generate(),
            buyer,
            status: OrderStatus::Reserved,
            lines,
            created_at: now,
            updated_at: now,
            version: Version::initial(),
        }
    }

    /// Units per SKU, with repeated SKUs summed. Ordered by SKU.
    ///
    /// Fails with [`StockError::CounterOverflow`] if a SKU's sum does not
    /// fit a counter.
    pub fn demand(&self) -> Result<BTreeMap<SkuId, u64>, StockError> {
        let mut demand = BTreeMap::new();
        for line in &self.lines {
            let units = demand.entry(line.sku.clone()).or_insert(0_u64);
            *units = units
                .checked_add(line.quantity.units())
                .ok_or_else(|| StockError::CounterOverflow {
                    sku: line.sku.clone(),
                })?;
        }
        Ok(demand)
    }

    /// The distinct SKUs this order touches, sorted.
    pub fn skus(&self) -> Vec<SkuId> {
        let skus: BTreeSet<&SkuId> = self.lines.iter().map(|line| &line.sku).collect();
        skus.into_iter().cloned().collect()
    }

    /// Order total in minor currency units.
    pub fn total_cents(&self) -> u64 {
        self.lines
            .iter()
            .map(|line| line.unit_price_cents.saturating_mul(line.quantity.units()))
            .fold(0, u64::saturating_add)
    }

    /// Returns the order moved to `status`.
    #[must_use]
    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = status;
        self.updated_at = Timestamp::now();
        self
    }
}

/// What `place_order` returns, and what an idempotent replay returns again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedOrder {
    /// The new order
    pub order_id: OrderId,
    /// Its status right after placement
    pub status: OrderStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(sku: &str, quantity: u64, price: u64) -> OrderLine {
        OrderLine {
            sku: SkuId::try_new(sku).unwrap(),
            quantity: Quantity::try_new(quantity).unwrap(),
            unit_price_cents: price,
        }
    }

    #[test]
    fn demand_sums_repeated_skus_in_sorted_order() {
        let order = Order::reserved(
            PrincipalId::try_new("buyer-1").unwrap(),
            vec![line("B", 1, 100), line("A", 2, 50), line("B", 3, 100)],
        );

        let demand: Vec<(String, u64)> = order
            .demand()
            .unwrap()
            .into_iter()
            .map(|(sku, units)| (sku.to_string(), units))
            .collect();
        assert_eq!(demand, vec![("A".to_string(), 2), ("B".to_string(), 4)]);
    }

    #[test]
    fn demand_that_overflows_a_counter_is_an_error() {
        let order = Order::reserved(
            PrincipalId::try_new("buyer-1").unwrap(),
            vec![line("A", 1, 0), line("B", u64::MAX, 0), line("B", 1, 0)],
        );
        assert_eq!(
            order.demand(),
            Err(StockError::CounterOverflow {
                sku: SkuId::try_new("B").unwrap(),
            })
        );
        assert_eq!(order.skus().len(), 2);
    }

    #[test]
    fn total_multiplies_price_by_quantity() {
        let order = Order::reserved(
            PrincipalId::try_new("buyer-1").unwrap(),
            vec![line("A", 2, 250), line("B", 1, 1000)],
        );
        assert_eq!(order.total_cents(), 1500);
    }

    #[test]
    fn released_statuses() {
        assert!(OrderStatus::Cancelled.is_released());
        assert!(OrderStatus::Expired.is_released());
        assert!(OrderStatus::Aborted.is_released());
        assert!(!OrderStatus::Reserved.is_released());
        assert!(!OrderStatus::Committed.is_released());
    }
}
