//! Inventory types
//!
//! A product's counters only ever grow. Unlimited stock is an explicit
//! [`Stock::Unlimited`] variant rather than a value stolen from the
//! numeric range; on the wire it is written as `-1`, which is what
//! storefronts send.

use super::{Amount, Timestamp};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Total units ever stocked for a product
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stock {
    Unlimited,
    Units(u64),
}

impl Stock {
    /// Whether `self` is at least `other`, treating unlimited as the top
    pub fn covers(&self, other: &Stock) -> bool {
        match (self, other) {
            (Stock::Unlimited, _) => true,
            (Stock::Units(_), Stock::Unlimited) => false,
            (Stock::Units(a), Stock::Units(b)) => a >= b,
        }
    }
}

impl Serialize for Stock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Stock::Unlimited => serializer.serialize_i64(-1),
            Stock::Units(n) => serializer.serialize_u64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for Stock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match i64::deserialize(deserializer)? {
            -1 => Ok(Stock::Unlimited),
            n if n >= 0 => Ok(Stock::Units(n as u64)),
            n => Err(serde::de::Error::custom(format!("invalid stock count {}", n))),
        }
    }
}

/// Counter named in a regression conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockField {
    TotalStocked,
    TotalSold,
    TotalLost,
}

impl fmt::Display for StockField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StockField::TotalStocked => "total_stocked",
            StockField::TotalSold => "total_sold",
            StockField::TotalLost => "total_lost",
        };
        f.write_str(name)
    }
}

/// A named tax included in a price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tax {
    pub name: String,
    pub tax: Amount,
}

/// Everything a merchant states about a product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDetails {
    pub description: String,
    #[serde(default)]
    pub description_i18n: BTreeMap<String, String>,
    pub unit: String,
    pub price: Amount,
    #[serde(default)]
    pub taxes: Vec<Tax>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub address: serde_json::Value,
    pub total_stocked: Stock,
    #[serde(default)]
    pub total_sold: u64,
    #[serde(default)]
    pub total_lost: u64,
    #[serde(default)]
    pub next_restock: Option<Timestamp>,
}

impl ProductDetails {
    /// Units neither sold nor lost, `None` when unlimited
    pub fn remaining(&self) -> Option<u64> {
        match self.total_stocked {
            Stock::Unlimited => None,
            Stock::Units(n) => Some(n.saturating_sub(self.total_sold.saturating_add(self.total_lost))),
        }
    }

    /// First counter that `update` would move backwards
    pub fn regressed_field(&self, update: &ProductDetails) -> Option<StockField> {
        if !update.total_stocked.covers(&self.total_stocked) {
            return Some(StockField::TotalStocked);
        }
        if update.total_sold < self.total_sold {
            return Some(StockField::TotalSold);
        }
        if update.total_lost < self.total_lost {
            return Some(StockField::TotalLost);
        }
        None
    }

    /// Whether `sold + lost` fits within `stocked`
    pub fn counters_consistent(&self) -> bool {
        match self.total_stocked {
            Stock::Unlimited => true,
            Stock::Units(n) => self
                .total_sold
                .checked_add(self.total_lost)
                .is_some_and(|used| used <= n),
        }
    }
}

/// Units held under a caller-chosen UUID until `expiration`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryLock {
    pub uuid: Uuid,
    pub quantity: u64,
    pub expiration: Timestamp,
}

/// Units held on behalf of an unpaid order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLock {
    pub order_id: String,
    pub quantity: u64,
}

/// Product as listed to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductRecord {
    pub product_id: String,
    #[serde(flatten)]
    pub details: ProductDetails,
    /// Units currently held by inventory and order locks
    pub total_locked: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn details(stocked: Stock, sold: u64, lost: u64) -> ProductDetails {
        ProductDetails {
            description: "widget".to_string(),
            description_i18n: BTreeMap::new(),
            unit: "piece".to_string(),
            price: "EUR:5".parse().unwrap(),
            taxes: vec![],
            image: String::new(),
            address: serde_json::Value::Null,
            total_stocked: stocked,
            total_sold: sold,
            total_lost: lost,
            next_restock: None,
        }
    }

    #[rstest]
    #[case::unchanged(details(Stock::Units(10), 2, 1), None)]
    #[case::more_stock(details(Stock::Units(12), 2, 1), None)]
    #[case::unlimited(details(Stock::Unlimited, 2, 1), None)]
    #[case::less_stock(details(Stock::Units(9), 2, 1), Some(StockField::TotalStocked))]
    #[case::less_sold(details(Stock::Units(10), 1, 1), Some(StockField::TotalSold))]
    #[case::less_lost(details(Stock::Units(10), 2, 0), Some(StockField::TotalLost))]
    fn test_regressed_field(#[case] update: ProductDetails, #[case] expected: Option<StockField>) {
        let current = details(Stock::Units(10), 2, 1);
        assert_eq!(current.regressed_field(&update), expected);
    }

    #[test]
    fn test_unlimited_cannot_become_limited() {
        let current = details(Stock::Unlimited, 0, 0);
        let update = details(Stock::Units(1000), 0, 0);
        assert_eq!(
            current.regressed_field(&update),
            Some(StockField::TotalStocked)
        );
    }

    #[test]
    fn test_stock_wire_form() {
        assert_eq!(serde_json::to_string(&Stock::Unlimited).unwrap(), "-1");
        assert_eq!(serde_json::from_str::<Stock>("7").unwrap(), Stock::Units(7));
        assert!(serde_json::from_str::<Stock>("-2").is_err());
    }

    #[test]
    fn test_counters_consistent() {
        assert!(details(Stock::Units(3), 2, 1).counters_consistent());
        assert!(!details(Stock::Units(3), 2, 2).counters_consistent());
        assert!(!details(Stock::Units(10), u64::MAX, 1).counters_consistent());
    }

    #[rstest]
    #[case::some_left(details(Stock::Units(10), 2, 1), Some(7))]
    #[case::all_used(details(Stock::Units(3), 2, 2), Some(0))]
    #[case::counters_overflow(details(Stock::Units(10), u64::MAX, 1), Some(0))]
    #[case::unlimited(details(Stock::Unlimited, 2, 1), None)]
    fn test_remaining(#[case] product: ProductDetails, #[case] expected: Option<u64>) {
        assert_eq!(product.remaining(), expected);
    }
}
