//! The Event Bus: in-process pub/sub for dispatch pipeline activity and
//! per-batch logs, exposed over HTTP as Server-Sent Events (§4.8).
//!
//! Grounded in the teacher's `InMemoryRequestManager`, which backs its
//! `get_status_updates` stream with a single `tokio::sync::broadcast`
//! channel and converts it to a `Stream` with `async_stream::stream!`. This
//! bus generalizes that to two channel families: one global pipeline
//! channel, and a registry of per-batch channels created lazily on first
//! publish or subscribe.
//!
//! Delivery is best-effort and not persisted: a subscriber that connects
//! after an event fires has missed it, same as the teacher's broadcast
//! channel offers no backlog beyond its ring buffer. Postgres LISTEN/NOTIFY
//! (see `store::postgres::PostgresStore::create_listener`) is available as
//! a durable alternative backend but isn't wired in by default — the spec
//! calls for best-effort delivery, not replay.

use std::collections::HashMap;
use std::sync::Arc;

use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{BatchId, BatchLog};

const PIPELINE_CHANNEL_CAPACITY: usize = 4096;
const BATCH_CHANNEL_CAPACITY: usize = 256;

/// A pipeline-wide event: batch lifecycle transitions visible across the
/// whole system, not scoped to any one batch's viewer.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineEvent {
    pub kind: PipelineEventKind,
    pub batch_id: BatchId,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    BatchQueued,
    BatchDispatching,
    BatchDispatched,
    BatchCompleted,
    BatchFailed,
    BatchCallbackScheduled,
    UploadProgress,
}

/// A batch-scoped event, mirroring a `BatchLog` row as it's written.
pub type BatchEvent = BatchLog;

struct Registry {
    batch_channels: HashMap<BatchId, broadcast::Sender<BatchEvent>>,
}

/// Cloneable handle shared across the dispatcher, reconciler, scheduler,
/// upload coordinator, and HTTP layer.
#[derive(Clone)]
pub struct EventBus {
    pipeline: broadcast::Sender<PipelineEvent>,
    registry: Arc<RwLock<Registry>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (pipeline, _) = broadcast::channel(PIPELINE_CHANNEL_CAPACITY);
        Self {
            pipeline,
            registry: Arc::new(RwLock::new(Registry {
                batch_channels: HashMap::new(),
            })),
        }
    }

    /// Fire-and-forget publish to the global pipeline channel. A `SendError`
    /// (no subscribers) is expected and silently dropped — the bus makes no
    /// durability promise.
    pub fn publish_pipeline(&self, kind: PipelineEventKind, batch_id: BatchId, payload: serde_json::Value) {
        let _ = self.pipeline.send(PipelineEvent {
            kind,
            batch_id,
            payload,
            at: Utc::now(),
        });
    }

    /// Fire-and-forget publish to a batch's channel, creating it if this is
    /// the first publish or subscribe for that batch.
    pub fn publish_batch(&self, batch_id: BatchId, event: BatchEvent) {
        let sender = self.batch_sender(batch_id);
        let _ = sender.send(event);
    }

    fn batch_sender(&self, batch_id: BatchId) -> broadcast::Sender<BatchEvent> {
        if let Some(sender) = self.registry.read().batch_channels.get(&batch_id) {
            return sender.clone();
        }
        let mut registry = self.registry.write();
        registry
            .batch_channels
            .entry(batch_id)
            .or_insert_with(|| broadcast::channel(BATCH_CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn subscribe_pipeline(&self) -> impl Stream<Item = PipelineEvent> + Send + 'static {
        let mut rx = self.pipeline.subscribe();
        stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "pipeline event subscriber lagged, events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    pub fn subscribe_batch(&self, batch_id: BatchId) -> impl Stream<Item = BatchEvent> + Send + 'static {
        let mut rx = self.batch_sender(batch_id).subscribe();
        stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, batch_id = %batch_id, "batch event subscriber lagged, events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Drop channels for batches nobody is publishing or listening to
    /// anymore, so the registry doesn't grow without bound across a long
    /// process lifetime. Safe to call periodically from the callback
    /// scheduler's tick alongside its other housekeeping.
    pub fn prune_idle_batch_channels(&self) {
        self.registry
            .write()
            .batch_channels
            .retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use uuid::Uuid;

    #[tokio::test]
    async fn pipeline_subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut stream = Box::pin(bus.subscribe_pipeline());
        let batch_id = Uuid::new_v4();
        bus.publish_pipeline(PipelineEventKind::BatchQueued, batch_id, serde_json::json!({}));

        let event = stream.next().await.unwrap();
        assert_eq!(event.batch_id, batch_id);
        assert_eq!(event.kind, PipelineEventKind::BatchQueued);
    }

    #[tokio::test]
    async fn batch_subscriber_only_sees_its_own_batch() {
        let bus = EventBus::new();
        let batch_a = Uuid::new_v4();
        let batch_b = Uuid::new_v4();
        let mut stream_a = Box::pin(bus.subscribe_batch(batch_a));

        let log_b = BatchLog {
            id: Uuid::new_v4(),
            batch_id: batch_b,
            log_type: crate::model::BatchLogType::Log,
            level: crate::model::LogLevel::Info,
            message: "for b".into(),
            data: serde_json::json!({}),
            created_at: Utc::now(),
        };
        bus.publish_batch(batch_b, log_b);

        let log_a = BatchLog {
            id: Uuid::new_v4(),
            batch_id: batch_a,
            log_type: crate::model::BatchLogType::Log,
            level: crate::model::LogLevel::Info,
            message: "for a".into(),
            data: serde_json::json!({}),
            created_at: Utc::now(),
        };
        bus.publish_batch(batch_a, log_a);

        let received = stream_a.next().await.unwrap();
        assert_eq!(received.batch_id, batch_a);
        assert_eq!(received.message, "for a");
    }

    #[test]
    fn prune_removes_channels_with_no_subscribers() {
        let bus = EventBus::new();
        let batch_id = Uuid::new_v4();
        let _ = bus.batch_sender(batch_id);
        assert_eq!(bus.registry.read().batch_channels.len(), 1);
        bus.prune_idle_batch_channels();
        assert_eq!(bus.registry.read().batch_channels.len(), 0);
    }
}
