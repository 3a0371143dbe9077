//! Outbox processor: periodically claims pending events and pushes them to
//! the bus. The claim keeps concurrent processor instances off each other's
//! rows; delivery is still at-least-once, because a crash between a
//! successful publish and the status update leaves a claim that goes stale
//! and gets replayed. Downstream consumers dedupe by event id.

use std::time::Duration;

use chrono::Utc;
use tokio::time;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::error::InventoryError;
use crate::store::InventoryStore;

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// Publish attempts before an event is left FAILED for dead-letter
    /// handling.
    pub max_publish_retries: i32,
    pub publish_timeout: Duration,
    /// Age after which another processor instance may steal a claim left
    /// behind by a crashed holder.
    pub claim_timeout: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            max_publish_retries: 5,
            publish_timeout: Duration::from_secs(5),
            claim_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutboxStats {
    pub published: usize,
    pub failed: usize,
}

pub struct OutboxProcessor<S, B> {
    store: S,
    bus: B,
    config: OutboxConfig,
}

impl<S: InventoryStore, B: EventBus> OutboxProcessor<S, B> {
    pub fn new(store: S, bus: B, config: OutboxConfig) -> Self {
        Self { store, bus, config }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.config.poll_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.process_once().await {
                error!("error processing outbox events: {e}");
            }
        }
    }

    /// One processor cycle. A failing event is marked and skipped; it never
    /// halts the rest of the batch.
    pub async fn process_once(&self) -> Result<OutboxStats, InventoryError> {
        let stale_after = chrono::Duration::from_std(self.config.claim_timeout)
            .map_err(|e| InventoryError::Internal(anyhow::anyhow!("claim timeout out of range: {e}")))?;
        let events = self
            .store
            .claim_events(
                self.config.max_publish_retries,
                self.config.batch_size,
                Utc::now(),
                stale_after,
            )
            .await?;

        let mut stats = OutboxStats::default();
        for event in events {
            let payload = match serde_json::to_string(&event.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("outbox event {} has unserializable payload: {e}", event.id);
                    self.mark_failed(&event, &format!("unserializable payload: {e}"))
                        .await;
                    stats.failed += 1;
                    continue;
                }
            };

            let publish = time::timeout(
                self.config.publish_timeout,
                self.bus.publish(&event.topic, &event.aggregate_id, &payload),
            )
            .await;

            match publish {
                Ok(Ok(())) => {
                    // The event went out; a failure to record that must not
                    // take the rest of the batch down with it. The stale
                    // claim replays the event later, which at-least-once
                    // delivery already allows for.
                    match self.store.mark_event_published(event.id, Utc::now()).await {
                        Ok(true) => {
                            info!("published outbox event {} ({})", event.id, event.event_type);
                        }
                        Ok(false) => {}
                        Err(e) => {
                            error!(
                                "published outbox event {} but failed to mark it: {e}",
                                event.id
                            );
                        }
                    }
                    stats.published += 1;
                }
                Ok(Err(e)) => {
                    warn!("failed to publish outbox event {}: {e}", event.id);
                    self.mark_failed(&event, &e.to_string()).await;
                    stats.failed += 1;
                }
                Err(_) => {
                    warn!("publish of outbox event {} timed out", event.id);
                    self.mark_failed(&event, "publish timed out").await;
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn mark_failed(&self, event: &crate::models::OutboxEvent, reason: &str) {
        if let Err(e) = self.store.mark_event_failed(event.id, reason).await {
            error!("failed to mark outbox event {} as failed: {e}", event.id);
            return;
        }
        if event.retry_count + 1 >= self.config.max_publish_retries {
            error!(
                "outbox event {} exhausted {} publish attempts, leaving for dead-letter handling",
                event.id, self.config.max_publish_retries
            );
        }
    }
}
