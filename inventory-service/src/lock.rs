//! Distributed locking seam. `LockService` hands out named, auto-expiring
//! leases from an external coordination service so that several service
//! instances can serialize writers for the same product.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::redis::{cmd, Script};
use tracing::warn;
use uuid::Uuid;

use crate::error::InventoryError;

/// A held lease on a named lock. The token proves ownership on release so
/// a holder cannot free a lock that has already expired and been re-granted.
#[derive(Debug, Clone)]
pub struct LockLease {
    pub key: String,
    pub token: String,
}

/// External coordination service behind a replaceable interface. Leases
/// auto-expire so a crashed holder cannot deadlock the product.
#[async_trait]
pub trait LockService: Send + Sync {
    async fn acquire(
        &self,
        key: &str,
        wait_timeout: Duration,
        lease_timeout: Duration,
    ) -> Result<LockLease, InventoryError>;

    async fn release(&self, lease: &LockLease) -> Result<(), InventoryError>;
}

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Single-process stand-in for the coordination service, used in tests and
/// single-node deployments.
#[derive(Default)]
pub struct InProcessLockService {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl InProcessLockService {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self, key: &str, lease_timeout: Duration) -> Option<LockLease> {
        let mut held = self.held.lock().unwrap();
        let now = Instant::now();
        match held.get(key) {
            Some((_, expires_at)) if *expires_at > now => None,
            _ => {
                let token = Uuid::new_v4().to_string();
                held.insert(key.to_string(), (token.clone(), now + lease_timeout));
                Some(LockLease {
                    key: key.to_string(),
                    token,
                })
            }
        }
    }
}

#[async_trait]
impl LockService for InProcessLockService {
    async fn acquire(
        &self,
        key: &str,
        wait_timeout: Duration,
        lease_timeout: Duration,
    ) -> Result<LockLease, InventoryError> {
        let deadline = Instant::now() + wait_timeout;
        loop {
            if let Some(lease) = self.try_acquire(key, lease_timeout) {
                return Ok(lease);
            }
            if Instant::now() >= deadline {
                return Err(InventoryError::LockAcquisitionTimeout {
                    key: key.to_string(),
                });
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<(), InventoryError> {
        let mut held = self.held.lock().unwrap();
        if let Some((token, _)) = held.get(&lease.key) {
            if *token == lease.token {
                held.remove(&lease.key);
            }
        }
        Ok(())
    }
}

/// Redis-backed lock: `SET key token NX PX lease` to acquire, a
/// compare-and-delete script to release. Redis being unreachable surfaces
/// as `LockServiceUnavailable`, never as silently bypassed exclusivity.
pub struct RedisLockService {
    pool: deadpool_redis::Pool,
    release_script: Script,
}

impl RedisLockService {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        let release_script = Script::new(
            r"if redis.call('get', KEYS[1]) == ARGV[1] then
                  return redis.call('del', KEYS[1])
              else
                  return 0
              end",
        );
        Self {
            pool,
            release_script,
        }
    }

    fn unavailable(reason: impl ToString) -> InventoryError {
        InventoryError::LockServiceUnavailable {
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn acquire(
        &self,
        key: &str,
        wait_timeout: Duration,
        lease_timeout: Duration,
    ) -> Result<LockLease, InventoryError> {
        let token = Uuid::new_v4().to_string();
        let lease_ms = lease_timeout.as_millis() as u64;
        let deadline = Instant::now() + wait_timeout;
        loop {
            let mut conn = self.pool.get().await.map_err(Self::unavailable)?;
            let acquired: Option<String> = cmd("SET")
                .arg(key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(lease_ms)
                .query_async(&mut conn)
                .await
                .map_err(Self::unavailable)?;
            if acquired.is_some() {
                return Ok(LockLease {
                    key: key.to_string(),
                    token,
                });
            }
            if Instant::now() >= deadline {
                return Err(InventoryError::LockAcquisitionTimeout {
                    key: key.to_string(),
                });
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<(), InventoryError> {
        let mut conn = self.pool.get().await.map_err(Self::unavailable)?;
        let released: i32 = self
            .release_script
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::unavailable)?;
        if released == 0 {
            // Lease already expired and possibly re-granted elsewhere.
            warn!("lock {} released after lease expiry", lease.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_process_lease_expires_for_crashed_holder() {
        let service = InProcessLockService::new();
        let _lease = service
            .acquire("inventory:SKU-X", Duration::from_millis(50), Duration::from_millis(30))
            .await
            .unwrap();

        // Never released; the second caller waits out the lease.
        service
            .acquire("inventory:SKU-X", Duration::from_millis(500), Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let service = InProcessLockService::new();
        let _a = service
            .acquire("inventory:SKU-A", Duration::from_millis(50), Duration::from_secs(1))
            .await
            .unwrap();
        service
            .acquire("inventory:SKU-B", Duration::from_millis(50), Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_token_cannot_release_regranted_lock() {
        let service = InProcessLockService::new();
        let stale = service
            .acquire("inventory:SKU-X", Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let current = service
            .acquire("inventory:SKU-X", Duration::from_millis(50), Duration::from_secs(1))
            .await
            .unwrap();

        service.release(&stale).await.unwrap();
        // The regranted lock is still held.
        let err = service
            .acquire("inventory:SKU-X", Duration::from_millis(40), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InventoryError::LockAcquisitionTimeout { .. }
        ));

        service.release(&current).await.unwrap();
    }
}
