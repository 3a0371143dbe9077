use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy of the reservation engine. Errors on the synchronous
/// surface (reserve/release/commit) propagate to the caller; errors inside
/// the expiry sweeper and outbox processor are logged and the batch moves on.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("insufficient stock for {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: String,
        requested: i32,
        available: i32,
    },

    #[error("reservation already exists for product {product_id} and order {order_id}")]
    DuplicateReservation {
        product_id: String,
        order_id: String,
    },

    #[error("concurrent update conflict on product {product_id}")]
    ConcurrencyConflict { product_id: String },

    #[error("timed out acquiring lock {key}")]
    LockAcquisitionTimeout { key: String },

    #[error("lock service unavailable: {reason}")]
    LockServiceUnavailable { reason: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("reservation {0} not found")]
    ReservationNotFound(Uuid),

    #[error("product {0} not found")]
    ProductNotFound(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl InventoryError {
    /// Transient failures that are safe for the caller to retry verbatim.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InventoryError::ConcurrencyConflict { .. }
                | InventoryError::LockAcquisitionTimeout { .. }
                | InventoryError::LockServiceUnavailable { .. }
        )
    }
}
