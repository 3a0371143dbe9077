use std::sync::Arc;
use std::time::Duration;

use inventory_service::lock::{InProcessLockService, LockService};
use inventory_service::service::InventoryService;
use inventory_service::store::MemoryStore;
use inventory_service::strategy::{ConcurrencyConfig, ConcurrencyControl, LockingStrategy};

pub const TTL: Duration = Duration::from_secs(900);

pub fn service_with(
    strategy: LockingStrategy,
) -> (Arc<InventoryService<MemoryStore>>, MemoryStore) {
    let store = MemoryStore::new();
    let config = ConcurrencyConfig {
        strategy,
        retry_backoff: Duration::from_millis(1),
        ..ConcurrencyConfig::default()
    };
    let lock_service: Option<Arc<dyn LockService>> = match strategy {
        LockingStrategy::Distributed => {
            Some(Arc::new(InProcessLockService::new()) as Arc<dyn LockService>)
        }
        _ => None,
    };
    let concurrency = ConcurrencyControl::new(config, lock_service);
    let service = Arc::new(InventoryService::new(store.clone(), concurrency));
    (service, store)
}

pub fn optimistic_service() -> (Arc<InventoryService<MemoryStore>>, MemoryStore) {
    service_with(LockingStrategy::Optimistic)
}
