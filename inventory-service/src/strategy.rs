//! Concurrency control strategies. All four expose the same contract: run
//! a read-modify-write for one product such that no interleaving of
//! concurrent callers can oversell. They differ in how contention shows up
//! (retries, queuing, fail-fast), never in the success/failure contract.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::InventoryError;
use crate::lock::LockService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LockingStrategy {
    /// Version-checked writes with bounded, jittered retries.
    Optimistic,
    /// Exclusive row lock on the item for the span of one read-plan-write
    /// transaction; contenders queue on the row instead of conflicting.
    Pessimistic,
    /// Named lock from an external coordination service; required when
    /// several instances mutate the same ledger.
    Distributed,
    /// Single conditional attempt; duplicate submissions are stopped by the
    /// (product_id, order_id) unique key, conflicts surface to the caller.
    Constraint,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub strategy: LockingStrategy,
    /// Retry bound for the optimistic strategy.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub lock_wait_timeout: Duration,
    pub lock_lease_timeout: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            strategy: LockingStrategy::Optimistic,
            max_retries: 3,
            retry_backoff: Duration::from_millis(20),
            lock_wait_timeout: Duration::from_secs(5),
            lock_lease_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of one guarded attempt: either the operation finished, or its
/// conditional write lost a race and the strategy decides what happens next.
pub enum Attempt<T> {
    Done(T),
    Conflict,
}

pub struct ConcurrencyControl {
    config: ConcurrencyConfig,
    lock_service: Option<Arc<dyn LockService>>,
}

impl ConcurrencyControl {
    pub fn new(config: ConcurrencyConfig, lock_service: Option<Arc<dyn LockService>>) -> Self {
        Self {
            config,
            lock_service,
        }
    }

    pub fn strategy(&self) -> LockingStrategy {
        self.config.strategy
    }

    /// Run `attempt` under the configured guard until it completes or the
    /// strategy gives up. `attempt` must be safe to re-run from scratch: it
    /// re-reads state and re-plans the write each time.
    pub async fn run<T, F, Fut>(
        &self,
        product_id: &str,
        attempt: F,
    ) -> Result<T, InventoryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Attempt<T>, InventoryError>>,
    {
        match self.config.strategy {
            LockingStrategy::Optimistic => {
                let mut retries = 0;
                loop {
                    match attempt().await? {
                        Attempt::Done(value) => return Ok(value),
                        Attempt::Conflict => {
                            retries += 1;
                            if retries > self.config.max_retries {
                                return Err(InventoryError::ConcurrencyConflict {
                                    product_id: product_id.to_string(),
                                });
                            }
                            let backoff = self.backoff_with_jitter(retries);
                            warn!(
                                "version conflict on {product_id}, retry {retries} in {:?}",
                                backoff
                            );
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
            // The attempt itself runs its read and write under the store's
            // exclusive row lock, so a single attempt suffices.
            LockingStrategy::Pessimistic => self.single_attempt(product_id, attempt).await,
            LockingStrategy::Distributed => {
                let service = self.lock_service.as_ref().ok_or_else(|| {
                    InventoryError::LockServiceUnavailable {
                        reason: "no lock service configured".to_string(),
                    }
                })?;
                let key = format!("inventory:{product_id}");
                let lease = service
                    .acquire(
                        &key,
                        self.config.lock_wait_timeout,
                        self.config.lock_lease_timeout,
                    )
                    .await?;
                let result = self.single_attempt(product_id, attempt).await;
                if let Err(e) = service.release(&lease).await {
                    // The lease expires on its own; losing the release is not fatal.
                    warn!("failed to release lock {key}: {e}");
                }
                result
            }
            LockingStrategy::Constraint => self.single_attempt(product_id, attempt).await,
        }
    }

    async fn single_attempt<T, F, Fut>(
        &self,
        product_id: &str,
        attempt: F,
    ) -> Result<T, InventoryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Attempt<T>, InventoryError>>,
    {
        match attempt().await? {
            Attempt::Done(value) => Ok(value),
            Attempt::Conflict => Err(InventoryError::ConcurrencyConflict {
                product_id: product_id.to_string(),
            }),
        }
    }

    fn backoff_with_jitter(&self, retries: u32) -> Duration {
        let base = self.config.retry_backoff * retries;
        let jitter_ms = {
            let mut rng = rand::thread_rng();
            rng.gen_range(0..=self.config.retry_backoff.as_millis() as u64)
        };
        base + Duration::from_millis(jitter_ms)
    }
}
