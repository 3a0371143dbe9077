//! Inbound order-event consumer. One reservation attempt per line item;
//! line items are independent by design — a stock-out on one line never
//! rolls back siblings. Compensation is the upstream orchestrator's call.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message;
use tracing::{error, info, warn};
use uuid::Uuid;

use shared::OrderCreatedEvent;

use crate::error::InventoryError;
use crate::service::InventoryService;
use crate::store::InventoryStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Reserved {
        product_id: String,
        reservation_id: Uuid,
    },
    /// A reservation for this (product, order) already exists — a
    /// redelivered event, treated as success.
    AlreadyReserved { product_id: String },
    InsufficientStock {
        product_id: String,
        requested: i32,
        available: i32,
    },
    Failed {
        product_id: String,
        error: String,
    },
}

pub struct OrderEventConsumer<S: InventoryStore> {
    service: Arc<InventoryService<S>>,
    reservation_ttl: Duration,
}

impl<S: InventoryStore> OrderEventConsumer<S> {
    pub fn new(service: Arc<InventoryService<S>>, reservation_ttl: Duration) -> Self {
        Self {
            service,
            reservation_ttl,
        }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    if let Some(payload) = m.payload_view::<str>() {
                        match payload {
                            Ok(json_str) => {
                                match serde_json::from_str::<OrderCreatedEvent>(json_str) {
                                    Ok(event) => {
                                        self.handle_order_created(&event).await;
                                    }
                                    Err(e) => error!("error parsing order event: {e}"),
                                }
                            }
                            Err(e) => error!("error parsing payload: {}", e),
                        }
                    }
                    if let Err(e) =
                        consumer.commit_message(&m, rdkafka::consumer::CommitMode::Async)
                    {
                        error!("error committing message: {}", e);
                    }
                }
                Err(e) => error!("error receiving message: {}", e),
            }
        }
    }

    /// Reserve stock for every line item of an order, recording a distinct
    /// outcome per line.
    pub async fn handle_order_created(&self, event: &OrderCreatedEvent) -> Vec<LineOutcome> {
        let mut outcomes = Vec::with_capacity(event.items.len());
        for item in &event.items {
            let outcome = self
                .reserve_line(&event.order_id, &item.product_id, item.quantity)
                .await;
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn reserve_line(
        &self,
        order_id: &str,
        product_id: &str,
        quantity: i32,
    ) -> LineOutcome {
        match self
            .service
            .reserve(product_id, order_id, quantity, self.reservation_ttl)
            .await
        {
            Ok(reservation_id) => {
                info!(
                    "reserved {quantity} x {product_id} for order {order_id} ({reservation_id})"
                );
                LineOutcome::Reserved {
                    product_id: product_id.to_string(),
                    reservation_id,
                }
            }
            Err(InventoryError::DuplicateReservation { .. }) => {
                info!("order {order_id} line {product_id} already reserved, skipping");
                LineOutcome::AlreadyReserved {
                    product_id: product_id.to_string(),
                }
            }
            Err(InventoryError::InsufficientStock {
                requested,
                available,
                ..
            }) => {
                warn!(
                    "insufficient stock for order {order_id} line {product_id}: requested {requested}, available {available}"
                );
                self.record_shortage(product_id, order_id, requested, available)
                    .await;
                LineOutcome::InsufficientStock {
                    product_id: product_id.to_string(),
                    requested,
                    available,
                }
            }
            Err(InventoryError::ProductNotFound(_)) => {
                warn!("order {order_id} references unknown product {product_id}");
                self.record_shortage(product_id, order_id, quantity, 0).await;
                LineOutcome::InsufficientStock {
                    product_id: product_id.to_string(),
                    requested: quantity,
                    available: 0,
                }
            }
            Err(e) => {
                error!("failed to reserve {product_id} for order {order_id}: {e}");
                LineOutcome::Failed {
                    product_id: product_id.to_string(),
                    error: e.to_string(),
                }
            }
        }
    }

    async fn record_shortage(
        &self,
        product_id: &str,
        order_id: &str,
        requested: i32,
        available: i32,
    ) {
        if let Err(e) = self
            .service
            .record_insufficient_stock(product_id, order_id, requested, available)
            .await
        {
            error!("failed to record insufficient-stock event for {product_id}: {e}");
        }
    }
}
