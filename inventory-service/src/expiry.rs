//! Expiry reclamation: a periodic sweep that returns stock held by
//! reservations whose deadline passed. Safe to run from several instances
//! at once — the conditional ACTIVE→EXPIRED transition picks one winner
//! per reservation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time;
use tracing::{debug, error, info};

use crate::error::InventoryError;
use crate::service::InventoryService;
use crate::store::InventoryStore;

pub struct ExpirySweeper<S: InventoryStore> {
    service: Arc<InventoryService<S>>,
    sweep_interval: Duration,
    batch_size: i64,
}

impl<S: InventoryStore> ExpirySweeper<S> {
    pub fn new(
        service: Arc<InventoryService<S>>,
        sweep_interval: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            service,
            sweep_interval,
            batch_size,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.sweep_interval);
        loop {
            interval.tick().await;
            match self.sweep_once(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => info!("expired {n} overdue reservations"),
                Err(e) => error!("error sweeping expired reservations: {e}"),
            }
        }
    }

    /// One sweep pass. A single bad row is logged and skipped; the sweep
    /// continues with the remaining candidates.
    pub async fn sweep_once(&self, as_of: DateTime<Utc>) -> Result<usize, InventoryError> {
        let due = self
            .service
            .store()
            .expired_reservations(as_of, self.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut expired = 0;
        for reservation in due {
            match self.service.expire(&reservation).await {
                Ok(true) => {
                    expired += 1;
                    info!(
                        "reservation {} for product {} expired, {} units credited back",
                        reservation.id, reservation.product_id, reservation.quantity
                    );
                }
                Ok(false) => {
                    debug!(
                        "reservation {} already handled by a concurrent caller",
                        reservation.id
                    );
                }
                Err(e) => {
                    error!("failed to expire reservation {}: {e}", reservation.id);
                }
            }
        }
        Ok(expired)
    }
}
