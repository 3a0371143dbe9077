use anyhow::anyhow;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::StockLevels;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Active,
    Released,
    Expired,
    Committed,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Released => "RELEASED",
            ReservationStatus::Expired => "EXPIRED",
            ReservationStatus::Committed => "COMMITTED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(ReservationStatus::Active),
            "RELEASED" => Some(ReservationStatus::Released),
            "EXPIRED" => Some(ReservationStatus::Expired),
            "COMMITTED" => Some(ReservationStatus::Committed),
            _ => None,
        }
    }

    /// Terminal states are immutable; repeated transitions out of them are
    /// idempotent no-ops.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    /// Claimed by a processor instance; other processors skip the row
    /// until the claim goes stale.
    Processing,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OutboxStatus::Pending),
            "PROCESSING" => Some(OutboxStatus::Processing),
            "PUBLISHED" => Some(OutboxStatus::Published),
            "FAILED" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// One row per product. `available + reserved == total` holds after every
/// mutation; `version` backs the optimistic strategy's conditional writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryItem {
    pub product_id: String,
    pub available_quantity: i32,
    pub reserved_quantity: i32,
    pub total_quantity: i32,
    pub version: i64,
    pub low_stock_threshold: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InventoryItem {
    pub fn levels(&self) -> StockLevels {
        StockLevels {
            available: self.available_quantity,
            reserved: self.reserved_quantity,
            total: self.total_quantity,
        }
    }

    pub fn is_low_stock(&self) -> bool {
        self.available_quantity < self.low_stock_threshold
    }
}

/// A time-bounded hold against the ledger. The reservation id doubles as
/// the idempotency key referenced by peer services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockReservation {
    pub id: Uuid,
    pub product_id: String,
    pub order_id: String,
    pub quantity: i32,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub topic: String,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Outbox record before it is persisted; the store assigns id, status and
/// timestamps when it writes the row.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub topic: String,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::inventory_items)]
pub struct InventoryItemRow {
    pub product_id: String,
    pub available_quantity: i32,
    pub reserved_quantity: i32,
    pub total_quantity: i32,
    pub version: i64,
    pub low_stock_threshold: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<InventoryItemRow> for InventoryItem {
    fn from(row: InventoryItemRow) -> Self {
        Self {
            product_id: row.product_id,
            available_quantity: row.available_quantity,
            reserved_quantity: row.reserved_quantity,
            total_quantity: row.total_quantity,
            version: row.version,
            low_stock_threshold: row.low_stock_threshold,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::stock_reservations)]
pub struct ReservationRow {
    pub id: Uuid,
    pub product_id: String,
    pub order_id: String,
    pub quantity: i32,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl From<StockReservation> for ReservationRow {
    fn from(r: StockReservation) -> Self {
        Self {
            id: r.id,
            product_id: r.product_id,
            order_id: r.order_id,
            quantity: r.quantity,
            status: r.status.as_str().to_string(),
            expires_at: r.expires_at,
            created_at: r.created_at,
            released_at: r.released_at,
        }
    }
}

impl TryFrom<ReservationRow> for StockReservation {
    type Error = anyhow::Error;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        let status = ReservationStatus::from_str(&row.status)
            .ok_or_else(|| anyhow!("unknown reservation status: {}", row.status))?;
        Ok(Self {
            id: row.id,
            product_id: row.product_id,
            order_id: row.order_id,
            quantity: row.quantity,
            status,
            expires_at: row.expires_at,
            created_at: row.created_at,
            released_at: row.released_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct OutboxEventRow {
    pub id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub topic: String,
    pub status: String,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl OutboxEventRow {
    pub fn pending(event: &NewOutboxEvent, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id: event.aggregate_id.clone(),
            aggregate_type: event.aggregate_type.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            topic: event.topic.clone(),
            status: OutboxStatus::Pending.as_str().to_string(),
            retry_count: 0,
            error_message: None,
            created_at: now,
            published_at: None,
            claimed_at: None,
        }
    }
}

impl TryFrom<OutboxEventRow> for OutboxEvent {
    type Error = anyhow::Error;

    fn try_from(row: OutboxEventRow) -> Result<Self, Self::Error> {
        let status = OutboxStatus::from_str(&row.status)
            .ok_or_else(|| anyhow!("unknown outbox status: {}", row.status))?;
        Ok(Self {
            id: row.id,
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            event_type: row.event_type,
            payload: row.payload,
            topic: row.topic,
            status,
            retry_count: row.retry_count,
            error_message: row.error_message,
            created_at: row.created_at,
            published_at: row.published_at,
            claimed_at: row.claimed_at,
        })
    }
}
