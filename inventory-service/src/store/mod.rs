//! Storage seam for the reservation engine. Both backends expose the same
//! conditional-write primitives, so the concurrency strategies behave
//! identically over Postgres and the in-memory store.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::InventoryError;
use crate::ledger::StockLevels;
use crate::models::{InventoryItem, NewOutboxEvent, OutboxEvent, ReservationStatus, StockReservation};

/// Plans one atomic write from the item state observed inside the store's
/// critical section. Used by the row-locked write path.
pub type LedgerPlan =
    Box<dyn FnOnce(Option<InventoryItem>) -> Result<LedgerWrite, InventoryError> + Send>;

/// Reservation side of an atomic ledger write.
#[derive(Debug, Clone)]
pub enum ReservationWrite {
    /// Insert a fresh ACTIVE reservation; the unique (product_id, order_id)
    /// key rejects duplicate submissions for the same order line.
    Insert(StockReservation),
    /// Conditional status transition (`WHERE status = from`). Zero rows
    /// affected means another caller already moved the reservation.
    Transition {
        reservation_id: Uuid,
        from: ReservationStatus,
        to: ReservationStatus,
        released_at: Option<DateTime<Utc>>,
    },
}

/// One atomic unit: item counters (version-checked), an optional
/// reservation write, and exactly one outbox event. Either everything in
/// here lands or nothing does.
#[derive(Debug, Clone)]
pub struct LedgerWrite {
    pub product_id: String,
    /// Version observed when the caller read the item; the write only
    /// applies if the row still carries it.
    pub expected_version: i64,
    /// Create the item row instead of updating it (first stock add).
    pub create_item: bool,
    pub low_stock_threshold: i32,
    pub levels: StockLevels,
    pub reservation: Option<ReservationWrite>,
    pub event: NewOutboxEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The version check (or create) lost a race; the caller re-reads and
    /// retries per its strategy.
    VersionConflict,
    /// The (product_id, order_id) unique key already has a reservation.
    DuplicateReservation,
    /// The conditional transition found the reservation already moved.
    AlreadyTransitioned,
}

#[async_trait]
pub trait InventoryStore: Send + Sync + 'static {
    async fn get_item(&self, product_id: &str) -> Result<Option<InventoryItem>, InventoryError>;

    async fn get_reservation(&self, id: Uuid) -> Result<Option<StockReservation>, InventoryError>;

    async fn find_reservation(
        &self,
        product_id: &str,
        order_id: &str,
    ) -> Result<Option<StockReservation>, InventoryError>;

    /// ACTIVE reservations past their deadline, oldest deadline first,
    /// bounded so one sweep never claims an unbounded batch.
    async fn expired_reservations(
        &self,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StockReservation>, InventoryError>;

    /// Apply one atomic ledger write. Conditional failures come back as
    /// outcomes, not errors, so strategies can retry without string-matching.
    async fn apply(&self, write: LedgerWrite) -> Result<ApplyOutcome, InventoryError>;

    /// Read the item row under an exclusive lock, plan the write against
    /// what was read, and apply it in the same transaction. The lock spans
    /// the whole read-plan-write, so the version check cannot lose a race
    /// on an existing item.
    async fn apply_under_lock(
        &self,
        product_id: &str,
        plan: LedgerPlan,
    ) -> Result<ApplyOutcome, InventoryError>;

    /// Append an outbox event with no accompanying ledger mutation
    /// (e.g. an insufficient-stock fact).
    async fn append_event(&self, event: NewOutboxEvent) -> Result<Uuid, InventoryError>;

    /// Atomically claim a publishable batch, oldest first: PENDING rows,
    /// FAILED rows still under the retry bound, and claims abandoned by a
    /// crashed processor (older than `stale_after`). A claimed row is
    /// invisible to other processors until it is published, failed, or its
    /// claim goes stale.
    async fn claim_events(
        &self,
        max_retries: i32,
        limit: i64,
        as_of: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<Vec<OutboxEvent>, InventoryError>;

    /// Conditional mark (`WHERE status <> 'PUBLISHED'`); returns false if
    /// another processor instance already marked it.
    async fn mark_event_published(
        &self,
        id: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<bool, InventoryError>;

    async fn mark_event_failed(&self, id: Uuid, error: &str) -> Result<(), InventoryError>;
}
