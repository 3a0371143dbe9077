//! Publishing seam between the outbox processor and the broker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};

use crate::error::InventoryError;

#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    async fn publish(&self, topic: &str, key: &str, payload: &str)
        -> Result<(), InventoryError>;
}

pub struct KafkaBus {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaBus {
    pub fn new(producer: FutureProducer, send_timeout: Duration) -> Self {
        Self {
            producer,
            send_timeout,
        }
    }
}

#[async_trait]
impl EventBus for KafkaBus {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &str,
    ) -> Result<(), InventoryError> {
        let record = FutureRecord::to(topic).payload(payload).key(key);
        self.producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| InventoryError::Publish(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: String,
    pub payload: String,
}

#[derive(Default)]
struct MemoryBusState {
    published: Vec<PublishedMessage>,
    fail_remaining: u32,
}

/// In-memory bus for tests and local runs; `fail_next` injects publish
/// failures to exercise the processor's retry path.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<MemoryBusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.state.lock().unwrap().fail_remaining = count;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().unwrap().published.clone()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &str,
    ) -> Result<(), InventoryError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(InventoryError::Publish(
                "injected publish failure".to_string(),
            ));
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}
