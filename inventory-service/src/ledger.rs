//! Strategy-agnostic ledger arithmetic. These functions compute the next
//! counter values for a product inside a critical section owned by the
//! configured concurrency strategy; they never touch storage themselves.

use serde::{Deserialize, Serialize};

use crate::error::InventoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevels {
    pub available: i32,
    pub reserved: i32,
    pub total: i32,
}

impl StockLevels {
    pub fn empty() -> Self {
        Self {
            available: 0,
            reserved: 0,
            total: 0,
        }
    }

    /// Conservation invariant: every mutation preserves this.
    pub fn balanced(&self) -> bool {
        self.available + self.reserved == self.total
    }

    pub fn can_reserve(&self, quantity: i32) -> bool {
        quantity > 0 && self.available >= quantity
    }

    /// Move stock from available to reserved. Fails without side effects
    /// when the request exceeds what is available.
    pub fn reserve(self, product_id: &str, quantity: i32) -> Result<Self, InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidState(format!(
                "reservation quantity must be positive, got {quantity}"
            )));
        }
        if !self.can_reserve(quantity) {
            return Err(InventoryError::InsufficientStock {
                product_id: product_id.to_string(),
                requested: quantity,
                available: self.available,
            });
        }
        let next = Self {
            available: self.available - quantity,
            reserved: self.reserved + quantity,
            total: self.total,
        };
        debug_assert!(next.balanced());
        Ok(next)
    }

    /// Credit reserved stock back to available.
    pub fn release(self, quantity: i32) -> Result<Self, InventoryError> {
        if quantity > self.reserved {
            return Err(InventoryError::InvalidState(format!(
                "cannot release {quantity} units, only {} reserved",
                self.reserved
            )));
        }
        let next = Self {
            available: self.available + quantity,
            reserved: self.reserved - quantity,
            total: self.total,
        };
        debug_assert!(next.balanced());
        Ok(next)
    }

    /// Permanently remove reserved stock after fulfillment. Nothing is
    /// credited back to available.
    pub fn commit(self, quantity: i32) -> Result<Self, InventoryError> {
        if quantity > self.reserved {
            return Err(InventoryError::InvalidState(format!(
                "cannot commit {quantity} units, only {} reserved",
                self.reserved
            )));
        }
        let next = Self {
            available: self.available,
            reserved: self.reserved - quantity,
            total: self.total - quantity,
        };
        debug_assert!(next.balanced());
        Ok(next)
    }

    pub fn add_stock(self, quantity: i32) -> Result<Self, InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidState(format!(
                "added quantity must be positive, got {quantity}"
            )));
        }
        let next = Self {
            available: self.available + quantity,
            reserved: self.reserved,
            total: self.total + quantity,
        };
        debug_assert!(next.balanced());
        Ok(next)
    }

    pub fn is_low(&self, threshold: i32) -> bool {
        self.available < threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(available: i32, reserved: i32) -> StockLevels {
        StockLevels {
            available,
            reserved,
            total: available + reserved,
        }
    }

    #[test]
    fn reserve_moves_stock_between_counters() {
        let next = levels(100, 0).reserve("LAPTOP-001", 30).unwrap();
        assert_eq!(next, levels(70, 30));
    }

    #[test]
    fn reserve_beyond_available_fails_without_change() {
        let before = levels(70, 30);
        let err = before.reserve("LAPTOP-001", 80).unwrap_err();
        match err {
            InventoryError::InsufficientStock {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, 80);
                assert_eq!(available, 70);
            }
            other => panic!("unexpected error: {other}"),
        }
        // value semantics: the original is untouched
        assert_eq!(before, levels(70, 30));
    }

    #[test]
    fn reserve_rejects_non_positive_quantity() {
        assert!(levels(10, 0).reserve("SKU-X", 0).is_err());
        assert!(levels(10, 0).reserve("SKU-X", -3).is_err());
    }

    #[test]
    fn can_reserve_matches_reserve_outcomes() {
        let current = levels(10, 5);
        assert!(current.can_reserve(10));
        assert!(!current.can_reserve(11));
        assert!(!current.can_reserve(0));
        for quantity in [1, 10, 11] {
            assert_eq!(
                current.can_reserve(quantity),
                current.reserve("SKU-X", quantity).is_ok()
            );
        }
    }

    #[test]
    fn release_credits_back() {
        let next = levels(70, 30).release(30).unwrap();
        assert_eq!(next, levels(100, 0));
    }

    #[test]
    fn release_beyond_reserved_fails() {
        assert!(levels(70, 30).release(31).is_err());
    }

    #[test]
    fn commit_removes_stock_permanently() {
        let next = levels(70, 30).commit(30).unwrap();
        assert_eq!(next.available, 70);
        assert_eq!(next.reserved, 0);
        assert_eq!(next.total, 70);
        assert!(next.balanced());
    }

    #[test]
    fn commit_beyond_reserved_fails() {
        assert!(levels(70, 10).commit(11).is_err());
    }

    #[test]
    fn add_stock_grows_available_and_total() {
        let next = levels(5, 5).add_stock(20).unwrap();
        assert_eq!(next, levels(25, 5));
    }

    #[test]
    fn invariant_holds_across_operation_sequences() {
        let mut current = StockLevels::empty().add_stock(100).unwrap();
        current = current.reserve("SKU-X", 40).unwrap();
        current = current.release(10).unwrap();
        current = current.commit(30).unwrap();
        current = current.add_stock(15).unwrap();
        assert!(current.balanced());
        assert_eq!(current.total, 85);
    }

    #[test]
    fn low_stock_threshold_is_exclusive() {
        assert!(levels(9, 0).is_low(10));
        assert!(!levels(10, 0).is_low(10));
    }
}
