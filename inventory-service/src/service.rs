//! The reservation engine's synchronous operation surface. Every mutation
//! runs under the configured concurrency strategy and lands together with
//! its outbox event in one atomic store write.

use std::time::Duration;

use chrono::Utc;
use serde_json::to_value;
use tracing::{info, warn};
use uuid::Uuid;

use shared::{
    InsufficientStockEvent, ReleaseReason, ReservationExpiredEvent, StockAddedEvent,
    StockCommittedEvent, StockReleasedEvent, StockReservedEvent, INVENTORY_EVENTS_TOPIC,
};

use crate::error::InventoryError;
use crate::ledger::StockLevels;
use crate::models::{InventoryItem, NewOutboxEvent, ReservationStatus, StockReservation};
use crate::store::{ApplyOutcome, InventoryStore, LedgerWrite, ReservationWrite};
use crate::strategy::{Attempt, ConcurrencyControl, LockingStrategy};

const AGGREGATE_ITEM: &str = "InventoryItem";
const AGGREGATE_RESERVATION: &str = "StockReservation";

pub struct InventoryService<S: InventoryStore> {
    store: S,
    concurrency: ConcurrencyControl,
    low_stock_threshold: i32,
}

impl<S: InventoryStore> InventoryService<S> {
    pub fn new(store: S, concurrency: ConcurrencyControl) -> Self {
        Self {
            store,
            concurrency,
            low_stock_threshold: 10,
        }
    }

    pub fn with_low_stock_threshold(mut self, threshold: i32) -> Self {
        self.low_stock_threshold = threshold;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one planned write under the configured strategy. The plan maps
    /// the item state observed inside the guard to the write to apply, so
    /// retries and locked reads always work from fresh data.
    async fn run_write<P>(
        &self,
        product_id: &str,
        plan: P,
    ) -> Result<ApplyOutcome, InventoryError>
    where
        P: Fn(Option<InventoryItem>) -> Result<LedgerWrite, InventoryError>
            + Clone
            + Send
            + Sync
            + 'static,
    {
        match self.concurrency.strategy() {
            // Read, plan and write all happen under the store's exclusive
            // row lock, so contenders queue instead of conflicting.
            LockingStrategy::Pessimistic => {
                self.concurrency
                    .run(product_id, || {
                        let plan = plan.clone();
                        async move {
                            match self
                                .store
                                .apply_under_lock(product_id, Box::new(plan))
                                .await?
                            {
                                ApplyOutcome::VersionConflict => Ok(Attempt::Conflict),
                                outcome => Ok(Attempt::Done(outcome)),
                            }
                        }
                    })
                    .await
            }
            _ => {
                self.concurrency
                    .run(product_id, || async {
                        let item = self.store.get_item(product_id).await?;
                        let write = plan(item)?;
                        match self.store.apply(write).await? {
                            ApplyOutcome::VersionConflict => Ok(Attempt::Conflict),
                            outcome => Ok(Attempt::Done(outcome)),
                        }
                    })
                    .await
            }
        }
    }

    /// Place a time-bounded hold of `quantity` units for one order line.
    /// The (product_id, order_id) pair is the idempotency key: a repeated
    /// submission fails with `DuplicateReservation` and moves no stock.
    pub async fn reserve(
        &self,
        product_id: &str,
        order_id: &str,
        quantity: i32,
        ttl: Duration,
    ) -> Result<Uuid, InventoryError> {
        if let Some(existing) = self.store.find_reservation(product_id, order_id).await? {
            info!(
                "reservation {} already exists for ({product_id}, {order_id})",
                existing.id
            );
            return Err(InventoryError::DuplicateReservation {
                product_id: product_id.to_string(),
                order_id: order_id.to_string(),
            });
        }

        let reservation_id = Uuid::new_v4();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| InventoryError::Internal(anyhow::anyhow!("ttl out of range: {e}")))?;

        let plan = {
            let product_id = product_id.to_string();
            let order_id = order_id.to_string();
            move |item: Option<InventoryItem>| -> Result<LedgerWrite, InventoryError> {
                let item = item
                    .ok_or_else(|| InventoryError::ProductNotFound(product_id.clone()))?;
                let levels = item.levels().reserve(&product_id, quantity)?;

                let now = Utc::now();
                let expires_at = now + ttl;
                let reservation = StockReservation {
                    id: reservation_id,
                    product_id: product_id.clone(),
                    order_id: order_id.clone(),
                    quantity,
                    status: ReservationStatus::Active,
                    expires_at,
                    created_at: now,
                    released_at: None,
                };
                let event = NewOutboxEvent {
                    aggregate_id: reservation_id.to_string(),
                    aggregate_type: AGGREGATE_RESERVATION.to_string(),
                    event_type: "StockReserved".to_string(),
                    payload: to_value(StockReservedEvent {
                        reservation_id,
                        product_id: product_id.clone(),
                        order_id: order_id.clone(),
                        quantity,
                        expires_at,
                    })
                    .map_err(|e| InventoryError::Internal(e.into()))?,
                    topic: INVENTORY_EVENTS_TOPIC.to_string(),
                };

                Ok(LedgerWrite {
                    product_id: product_id.clone(),
                    expected_version: item.version,
                    create_item: false,
                    low_stock_threshold: item.low_stock_threshold,
                    levels,
                    reservation: Some(ReservationWrite::Insert(reservation)),
                    event,
                })
            }
        };

        match self.run_write(product_id, plan).await? {
            ApplyOutcome::Applied => {
                if let Ok(Some(item)) = self.store.get_item(product_id).await {
                    if item.is_low_stock() {
                        warn!(
                            "product {product_id} below low-stock threshold: {} < {}",
                            item.available_quantity, item.low_stock_threshold
                        );
                    }
                }
                Ok(reservation_id)
            }
            ApplyOutcome::DuplicateReservation => Err(InventoryError::DuplicateReservation {
                product_id: product_id.to_string(),
                order_id: order_id.to_string(),
            }),
            outcome => Err(InventoryError::InvalidState(format!(
                "unexpected apply outcome {outcome:?} on reserve"
            ))),
        }
    }

    /// Caller-initiated unreserve. Idempotent: releasing a reservation that
    /// already reached a terminal state succeeds without moving stock.
    pub async fn release(&self, reservation_id: Uuid) -> Result<(), InventoryError> {
        let reservation = self
            .store
            .get_reservation(reservation_id)
            .await?
            .ok_or(InventoryError::ReservationNotFound(reservation_id))?;
        if reservation.status.is_terminal() {
            return Ok(());
        }
        self.transition(&reservation, ReservationStatus::Released)
            .await?;
        Ok(())
    }

    /// Permanent removal after fulfillment: reserved stock leaves the ledger
    /// without being credited back. Idempotent on terminal reservations.
    pub async fn commit(&self, reservation_id: Uuid) -> Result<(), InventoryError> {
        let reservation = self
            .store
            .get_reservation(reservation_id)
            .await?
            .ok_or(InventoryError::ReservationNotFound(reservation_id))?;
        if reservation.status.is_terminal() {
            return Ok(());
        }
        self.transition(&reservation, ReservationStatus::Committed)
            .await?;
        Ok(())
    }

    /// Sweep-side expiry. Returns whether this call performed the
    /// transition; `false` means a concurrent release or sweep won the race.
    pub async fn expire(&self, reservation: &StockReservation) -> Result<bool, InventoryError> {
        if reservation.status.is_terminal() {
            return Ok(false);
        }
        self.transition(reservation, ReservationStatus::Expired)
            .await
    }

    pub async fn add_stock(&self, product_id: &str, quantity: i32) -> Result<(), InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidState(format!(
                "added quantity must be positive, got {quantity}"
            )));
        }

        let default_threshold = self.low_stock_threshold;
        let plan = {
            let product_id = product_id.to_string();
            move |item: Option<InventoryItem>| -> Result<LedgerWrite, InventoryError> {
                let (expected_version, create_item, threshold, levels) = match &item {
                    Some(item) => (
                        item.version,
                        false,
                        item.low_stock_threshold,
                        item.levels().add_stock(quantity)?,
                    ),
                    None => (
                        0,
                        true,
                        default_threshold,
                        StockLevels::empty().add_stock(quantity)?,
                    ),
                };
                let event = NewOutboxEvent {
                    aggregate_id: product_id.clone(),
                    aggregate_type: AGGREGATE_ITEM.to_string(),
                    event_type: "StockAdded".to_string(),
                    payload: to_value(StockAddedEvent {
                        product_id: product_id.clone(),
                        quantity,
                        total_quantity: levels.total,
                    })
                    .map_err(|e| InventoryError::Internal(e.into()))?,
                    topic: INVENTORY_EVENTS_TOPIC.to_string(),
                };
                Ok(LedgerWrite {
                    product_id: product_id.clone(),
                    expected_version,
                    create_item,
                    low_stock_threshold: threshold,
                    levels,
                    reservation: None,
                    event,
                })
            }
        };

        match self.run_write(product_id, plan).await? {
            ApplyOutcome::Applied => Ok(()),
            outcome => Err(InventoryError::InvalidState(format!(
                "unexpected apply outcome {outcome:?} on add_stock"
            ))),
        }
    }

    pub async fn get_stock(&self, product_id: &str) -> Result<StockLevels, InventoryError> {
        let item = self
            .store
            .get_item(product_id)
            .await?
            .ok_or_else(|| InventoryError::ProductNotFound(product_id.to_string()))?;
        Ok(item.levels())
    }

    pub async fn is_low_stock(&self, product_id: &str) -> Result<bool, InventoryError> {
        let item = self
            .store
            .get_item(product_id)
            .await?
            .ok_or_else(|| InventoryError::ProductNotFound(product_id.to_string()))?;
        Ok(item.is_low_stock())
    }

    /// Record an insufficient-stock fact for downstream consumers. No
    /// ledger state changed, so this is a bare outbox append.
    pub async fn record_insufficient_stock(
        &self,
        product_id: &str,
        order_id: &str,
        requested: i32,
        available: i32,
    ) -> Result<(), InventoryError> {
        let event = NewOutboxEvent {
            aggregate_id: product_id.to_string(),
            aggregate_type: AGGREGATE_ITEM.to_string(),
            event_type: "InsufficientStock".to_string(),
            payload: to_value(InsufficientStockEvent {
                product_id: product_id.to_string(),
                order_id: order_id.to_string(),
                requested_quantity: requested,
                available_quantity: available,
            })
            .map_err(|e| InventoryError::Internal(e.into()))?,
            topic: INVENTORY_EVENTS_TOPIC.to_string(),
        };
        self.store.append_event(event).await?;
        Ok(())
    }

    /// Move an ACTIVE reservation to a terminal state, adjusting the ledger
    /// accordingly. The conditional transition makes concurrent callers
    /// race-safe: exactly one performs the ledger mutation.
    async fn transition(
        &self,
        reservation: &StockReservation,
        to: ReservationStatus,
    ) -> Result<bool, InventoryError> {
        let plan = {
            let reservation = reservation.clone();
            move |item: Option<InventoryItem>| -> Result<LedgerWrite, InventoryError> {
                let item = item.ok_or_else(|| {
                    InventoryError::ProductNotFound(reservation.product_id.clone())
                })?;

                let levels = match to {
                    ReservationStatus::Released | ReservationStatus::Expired => {
                        item.levels().release(reservation.quantity)?
                    }
                    ReservationStatus::Committed => {
                        item.levels().commit(reservation.quantity)?
                    }
                    ReservationStatus::Active => {
                        return Err(InventoryError::InvalidState(
                            "cannot transition back to ACTIVE".to_string(),
                        ))
                    }
                };

                let now = Utc::now();
                let (event_type, payload, released_at) = match to {
                    ReservationStatus::Released => (
                        "StockReleased",
                        to_value(StockReleasedEvent {
                            reservation_id: reservation.id,
                            product_id: reservation.product_id.clone(),
                            order_id: reservation.order_id.clone(),
                            quantity: reservation.quantity,
                            reason: ReleaseReason::Manual,
                        }),
                        Some(now),
                    ),
                    ReservationStatus::Expired => (
                        "ReservationExpired",
                        to_value(ReservationExpiredEvent {
                            reservation_id: reservation.id,
                            product_id: reservation.product_id.clone(),
                            order_id: reservation.order_id.clone(),
                            quantity: reservation.quantity,
                        }),
                        Some(now),
                    ),
                    ReservationStatus::Committed => (
                        "StockCommitted",
                        to_value(StockCommittedEvent {
                            reservation_id: reservation.id,
                            product_id: reservation.product_id.clone(),
                            order_id: reservation.order_id.clone(),
                            quantity: reservation.quantity,
                        }),
                        None,
                    ),
                    ReservationStatus::Active => unreachable!(),
                };
                let payload = payload.map_err(|e| InventoryError::Internal(e.into()))?;

                Ok(LedgerWrite {
                    product_id: reservation.product_id.clone(),
                    expected_version: item.version,
                    create_item: false,
                    low_stock_threshold: item.low_stock_threshold,
                    levels,
                    reservation: Some(ReservationWrite::Transition {
                        reservation_id: reservation.id,
                        from: ReservationStatus::Active,
                        to,
                        released_at,
                    }),
                    event: NewOutboxEvent {
                        aggregate_id: reservation.id.to_string(),
                        aggregate_type: AGGREGATE_RESERVATION.to_string(),
                        event_type: event_type.to_string(),
                        payload,
                        topic: INVENTORY_EVENTS_TOPIC.to_string(),
                    },
                })
            }
        };

        match self.run_write(&reservation.product_id, plan).await? {
            ApplyOutcome::Applied => Ok(true),
            // Another caller already moved the reservation; the ledger was
            // left untouched.
            ApplyOutcome::AlreadyTransitioned => Ok(false),
            outcome => Err(InventoryError::InvalidState(format!(
                "unexpected apply outcome {outcome:?} on transition"
            ))),
        }
    }
}
