//! The Callback Scheduler: periodically moves due callbacks from the
//! callback structure back onto the primary queue (§4.8).

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::events::EventBus;
use crate::model::BatchStatus;
use crate::queue::QueueStore;
use crate::store::Store;

const DUE_CALLBACKS_BATCH_SIZE: usize = 100;

pub struct CallbackScheduler {
    store: Arc<dyn Store>,
    queue: Arc<dyn QueueStore>,
    events: EventBus,
}

impl CallbackScheduler {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn QueueStore>, events: EventBus) -> Self {
        Self { store, queue, events }
    }

    pub async fn run(self: Arc<Self>, poll_interval: Duration) {
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "callback scheduler tick failed");
            }
            self.events.prune_idle_batch_channels();
        }
    }

    /// No pipeline event is published here: `batch_retry` was already
    /// published when the callback was first requested (§4.8).
    #[tracing::instrument(skip(self))]
    async fn tick(&self) -> Result<()> {
        let due = self.queue.due_callbacks(chrono::Utc::now(), DUE_CALLBACKS_BATCH_SIZE).await?;
        for entry in due {
            match self.store.get_batch(entry.batch_id).await {
                Ok(batch) if batch.status == BatchStatus::Queued => {
                    self.queue.enqueue(batch.id, batch.priority_score()).await?;
                }
                Ok(batch) => {
                    tracing::debug!(batch_id = %batch.id, status = %batch.status, "due callback batch no longer queued, dropping");
                }
                Err(e) => {
                    tracing::warn!(batch_id = %entry.batch_id, error = %e, "due callback references missing batch, dropping");
                }
            }
        }
        Ok(())
    }
}
