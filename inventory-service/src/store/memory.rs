//! In-memory backend with the same compare-and-swap semantics as the
//! Postgres store. Used by the test suite and single-node deployments.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::InventoryError;
use crate::models::{
    InventoryItem, NewOutboxEvent, OutboxEvent, OutboxStatus, ReservationStatus, StockReservation,
};
use crate::store::{ApplyOutcome, InventoryStore, LedgerPlan, LedgerWrite, ReservationWrite};

#[derive(Default)]
struct State {
    items: HashMap<String, InventoryItem>,
    reservations: HashMap<Uuid, StockReservation>,
    // unique (product_id, order_id), mirroring the database constraint
    reservation_keys: HashSet<(String, String)>,
    events: Vec<OutboxEvent>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every outbox row, regardless of status.
    pub fn all_events(&self) -> Vec<OutboxEvent> {
        self.state.lock().unwrap().events.clone()
    }
}

fn apply_write(state: &mut State, write: LedgerWrite) -> Result<ApplyOutcome, InventoryError> {
    let now = Utc::now();

    // Conditional transition guard first; nothing is written when the
    // reservation already left the expected state.
    if let Some(ReservationWrite::Transition {
        reservation_id,
        from,
        ..
    }) = &write.reservation
    {
        match state.reservations.get(reservation_id) {
            Some(r) if r.status == *from => {}
            Some(_) => return Ok(ApplyOutcome::AlreadyTransitioned),
            None => return Err(InventoryError::ReservationNotFound(*reservation_id)),
        }
    }

    if let Some(ReservationWrite::Insert(r)) = &write.reservation {
        let key = (r.product_id.clone(), r.order_id.clone());
        if state.reservation_keys.contains(&key) {
            return Ok(ApplyOutcome::DuplicateReservation);
        }
    }

    if write.create_item {
        if state.items.contains_key(&write.product_id) {
            return Ok(ApplyOutcome::VersionConflict);
        }
        state.items.insert(
            write.product_id.clone(),
            InventoryItem {
                product_id: write.product_id.clone(),
                available_quantity: write.levels.available,
                reserved_quantity: write.levels.reserved,
                total_quantity: write.levels.total,
                version: 1,
                low_stock_threshold: write.low_stock_threshold,
                created_at: now,
                updated_at: now,
            },
        );
    } else {
        let item = state
            .items
            .get_mut(&write.product_id)
            .ok_or_else(|| InventoryError::ProductNotFound(write.product_id.clone()))?;
        if item.version != write.expected_version {
            return Ok(ApplyOutcome::VersionConflict);
        }
        item.available_quantity = write.levels.available;
        item.reserved_quantity = write.levels.reserved;
        item.total_quantity = write.levels.total;
        item.version += 1;
        item.updated_at = now;
    }

    match write.reservation {
        Some(ReservationWrite::Insert(r)) => {
            state
                .reservation_keys
                .insert((r.product_id.clone(), r.order_id.clone()));
            state.reservations.insert(r.id, r);
        }
        Some(ReservationWrite::Transition {
            reservation_id,
            to,
            released_at,
            ..
        }) => {
            // Presence checked above while holding the same lock.
            let r = state.reservations.get_mut(&reservation_id).unwrap();
            r.status = to;
            if released_at.is_some() {
                r.released_at = released_at;
            }
        }
        None => {}
    }

    state.events.push(OutboxEvent {
        id: Uuid::new_v4(),
        aggregate_id: write.event.aggregate_id,
        aggregate_type: write.event.aggregate_type,
        event_type: write.event.event_type,
        payload: write.event.payload,
        topic: write.event.topic,
        status: OutboxStatus::Pending,
        retry_count: 0,
        error_message: None,
        created_at: now,
        published_at: None,
        claimed_at: None,
    });

    Ok(ApplyOutcome::Applied)
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn get_item(&self, product_id: &str) -> Result<Option<InventoryItem>, InventoryError> {
        Ok(self.state.lock().unwrap().items.get(product_id).cloned())
    }

    async fn get_reservation(&self, id: Uuid) -> Result<Option<StockReservation>, InventoryError> {
        Ok(self.state.lock().unwrap().reservations.get(&id).cloned())
    }

    async fn find_reservation(
        &self,
        product_id: &str,
        order_id: &str,
    ) -> Result<Option<StockReservation>, InventoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .reservations
            .values()
            .find(|r| r.product_id == product_id && r.order_id == order_id)
            .cloned())
    }

    async fn expired_reservations(
        &self,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StockReservation>, InventoryError> {
        let state = self.state.lock().unwrap();
        let mut due: Vec<StockReservation> = state
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Active && r.expires_at < as_of)
            .cloned()
            .collect();
        due.sort_by_key(|r| r.expires_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn apply(&self, write: LedgerWrite) -> Result<ApplyOutcome, InventoryError> {
        let mut state = self.state.lock().unwrap();
        apply_write(&mut state, write)
    }

    async fn apply_under_lock(
        &self,
        product_id: &str,
        plan: LedgerPlan,
    ) -> Result<ApplyOutcome, InventoryError> {
        // The state mutex is the row lock here: the plan runs against the
        // same snapshot the write is applied to.
        let mut state = self.state.lock().unwrap();
        let item = state.items.get(product_id).cloned();
        let write = plan(item)?;
        apply_write(&mut state, write)
    }

    async fn append_event(&self, event: NewOutboxEvent) -> Result<Uuid, InventoryError> {
        let mut state = self.state.lock().unwrap();
        let id = Uuid::new_v4();
        state.events.push(OutboxEvent {
            id,
            aggregate_id: event.aggregate_id,
            aggregate_type: event.aggregate_type,
            event_type: event.event_type,
            payload: event.payload,
            topic: event.topic,
            status: OutboxStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            published_at: None,
            claimed_at: None,
        });
        Ok(id)
    }

    async fn claim_events(
        &self,
        max_retries: i32,
        limit: i64,
        as_of: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<Vec<OutboxEvent>, InventoryError> {
        let mut state = self.state.lock().unwrap();
        let stale_before = as_of - stale_after;
        let limit = limit as usize;
        let mut claimed = Vec::new();
        // events is append-only, so index order is created_at order
        for event in state.events.iter_mut() {
            if claimed.len() == limit {
                break;
            }
            let claimable = match event.status {
                OutboxStatus::Pending => true,
                OutboxStatus::Failed => event.retry_count < max_retries,
                OutboxStatus::Processing => {
                    event.claimed_at.map_or(true, |at| at < stale_before)
                }
                OutboxStatus::Published => false,
            };
            if claimable {
                event.status = OutboxStatus::Processing;
                event.claimed_at = Some(as_of);
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_event_published(
        &self,
        id: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<bool, InventoryError> {
        let mut state = self.state.lock().unwrap();
        match state.events.iter_mut().find(|e| e.id == id) {
            Some(e) if e.status != OutboxStatus::Published => {
                e.status = OutboxStatus::Published;
                e.published_at = Some(published_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_event_failed(&self, id: Uuid, error: &str) -> Result<(), InventoryError> {
        let mut state = self.state.lock().unwrap();
        if let Some(e) = state.events.iter_mut().find(|e| e.id == id) {
            e.status = OutboxStatus::Failed;
            e.retry_count += 1;
            e.error_message = Some(error.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::StockLevels;

    fn create_write(product_id: &str, quantity: i32) -> LedgerWrite {
        LedgerWrite {
            product_id: product_id.to_string(),
            expected_version: 0,
            create_item: true,
            low_stock_threshold: 10,
            levels: StockLevels {
                available: quantity,
                reserved: 0,
                total: quantity,
            },
            reservation: None,
            event: NewOutboxEvent {
                aggregate_id: product_id.to_string(),
                aggregate_type: "InventoryItem".to_string(),
                event_type: "StockAdded".to_string(),
                payload: serde_json::json!({}),
                topic: shared::INVENTORY_EVENTS_TOPIC.to_string(),
            },
        }
    }

    fn reserve_write(item: &InventoryItem, order_id: &str, quantity: i32) -> LedgerWrite {
        let levels = item.levels().reserve(&item.product_id, quantity).unwrap();
        let reservation = StockReservation {
            id: Uuid::new_v4(),
            product_id: item.product_id.clone(),
            order_id: order_id.to_string(),
            quantity,
            status: ReservationStatus::Active,
            expires_at: Utc::now() + chrono::Duration::minutes(15),
            created_at: Utc::now(),
            released_at: None,
        };
        LedgerWrite {
            product_id: item.product_id.clone(),
            expected_version: item.version,
            create_item: false,
            low_stock_threshold: item.low_stock_threshold,
            levels,
            reservation: Some(ReservationWrite::Insert(reservation)),
            event: NewOutboxEvent {
                aggregate_id: item.product_id.clone(),
                aggregate_type: "StockReservation".to_string(),
                event_type: "StockReserved".to_string(),
                payload: serde_json::json!({}),
                topic: shared::INVENTORY_EVENTS_TOPIC.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn stale_version_write_is_rejected() {
        let store = MemoryStore::new();
        store.apply(create_write("SKU-X", 100)).await.unwrap();
        let item = store.get_item("SKU-X").await.unwrap().unwrap();

        // Two writers computed from the same snapshot.
        let first = reserve_write(&item, "order-A", 60);
        let second = reserve_write(&item, "order-B", 60);

        assert_eq!(store.apply(first).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(
            store.apply(second).await.unwrap(),
            ApplyOutcome::VersionConflict
        );

        let item = store.get_item("SKU-X").await.unwrap().unwrap();
        assert_eq!(item.available_quantity, 40);
        assert_eq!(item.reserved_quantity, 60);
    }

    #[tokio::test]
    async fn locked_write_plans_against_current_state() {
        let store = MemoryStore::new();
        store.apply(create_write("SKU-X", 100)).await.unwrap();
        // A competing writer bumps the version first.
        let item = store.get_item("SKU-X").await.unwrap().unwrap();
        store
            .apply(reserve_write(&item, "order-A", 10))
            .await
            .unwrap();

        // The locked path plans from the fresh row, so no version conflict.
        let outcome = store
            .apply_under_lock(
                "SKU-X",
                Box::new(|item| {
                    let item = item.unwrap();
                    Ok(reserve_write(&item, "order-B", 10))
                }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let item = store.get_item("SKU-X").await.unwrap().unwrap();
        assert_eq!(item.reserved_quantity, 20);
    }

    #[tokio::test]
    async fn duplicate_order_line_is_rejected_before_counters_move() {
        let store = MemoryStore::new();
        store.apply(create_write("SKU-X", 100)).await.unwrap();
        let item = store.get_item("SKU-X").await.unwrap().unwrap();
        store
            .apply(reserve_write(&item, "order-A", 10))
            .await
            .unwrap();

        let item = store.get_item("SKU-X").await.unwrap().unwrap();
        assert_eq!(
            store
                .apply(reserve_write(&item, "order-A", 10))
                .await
                .unwrap(),
            ApplyOutcome::DuplicateReservation
        );
        // No counter movement and no second outbox event.
        let after = store.get_item("SKU-X").await.unwrap().unwrap();
        assert_eq!(after.version, item.version);
        assert_eq!(store.all_events().len(), 2);
    }

    #[tokio::test]
    async fn create_loses_to_existing_row() {
        let store = MemoryStore::new();
        store.apply(create_write("SKU-X", 100)).await.unwrap();
        assert_eq!(
            store.apply(create_write("SKU-X", 5)).await.unwrap(),
            ApplyOutcome::VersionConflict
        );
    }

    #[tokio::test]
    async fn transition_guard_skips_already_moved_reservation() {
        let store = MemoryStore::new();
        store.apply(create_write("SKU-X", 100)).await.unwrap();
        let item = store.get_item("SKU-X").await.unwrap().unwrap();
        let write = reserve_write(&item, "order-A", 10);
        let reservation_id = match &write.reservation {
            Some(ReservationWrite::Insert(r)) => r.id,
            _ => unreachable!(),
        };
        store.apply(write).await.unwrap();

        let item = store.get_item("SKU-X").await.unwrap().unwrap();
        let transition = |to| LedgerWrite {
            product_id: item.product_id.clone(),
            expected_version: item.version,
            create_item: false,
            low_stock_threshold: item.low_stock_threshold,
            levels: item.levels().release(10).unwrap(),
            reservation: Some(ReservationWrite::Transition {
                reservation_id,
                from: ReservationStatus::Active,
                to,
                released_at: Some(Utc::now()),
            }),
            event: NewOutboxEvent {
                aggregate_id: reservation_id.to_string(),
                aggregate_type: "StockReservation".to_string(),
                event_type: "StockReleased".to_string(),
                payload: serde_json::json!({}),
                topic: shared::INVENTORY_EVENTS_TOPIC.to_string(),
            },
        };

        assert_eq!(
            store.apply(transition(ReservationStatus::Released)).await.unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(
            store.apply(transition(ReservationStatus::Expired)).await.unwrap(),
            ApplyOutcome::AlreadyTransitioned
        );
    }
}
