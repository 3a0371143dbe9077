use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic carrying inbound order-creation facts.
pub const ORDER_EVENTS_TOPIC: &str = "order-events";
/// Topic carrying outbound stock facts published from the outbox.
pub const INVENTORY_EVENTS_TOPIC: &str = "inventory-events";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLineItem {
    pub product_id: String,
    pub quantity: i32,
}

/// Inbound fact consumed by the inventory service. One reservation attempt
/// is issued per line item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    pub order_id: String,
    pub user_id: String,
    pub items: Vec<OrderLineItem>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseReason {
    Manual,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockReservedEvent {
    pub reservation_id: Uuid,
    pub product_id: String,
    pub order_id: String,
    pub quantity: i32,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockReleasedEvent {
    pub reservation_id: Uuid,
    pub product_id: String,
    pub order_id: String,
    pub quantity: i32,
    pub reason: ReleaseReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationExpiredEvent {
    pub reservation_id: Uuid,
    pub product_id: String,
    pub order_id: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockCommittedEvent {
    pub reservation_id: Uuid,
    pub product_id: String,
    pub order_id: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsufficientStockEvent {
    pub product_id: String,
    pub order_id: String,
    pub requested_quantity: i32,
    pub available_quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockAddedEvent {
    pub product_id: String,
    pub quantity: i32,
    pub total_quantity: i32,
}
