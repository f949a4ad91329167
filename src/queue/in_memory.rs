//! In-memory `QueueStore`, used in dispatcher/scheduler unit tests so they
//! don't need a live Redis.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::Result;
use crate::model::BatchId;

use super::{QueueEntry, QueueStore};

#[derive(Default)]
struct State {
    primary: Vec<(BatchId, Decimal)>,
    callback: Vec<(BatchId, DateTime<Utc>)>,
    processing: HashSet<BatchId>,
    locked_suppliers: HashSet<Uuid>,
}

#[derive(Default)]
pub struct InMemoryQueueStore {
    state: Mutex<State>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, batch_id: BatchId, score: Decimal) -> Result<()> {
        let mut s = self.state.lock();
        s.primary.retain(|(id, _)| *id != batch_id);
        s.primary.push((batch_id, score));
        Ok(())
    }

    async fn pop_min(&self) -> Result<Option<QueueEntry>> {
        let mut s = self.state.lock();
        if s.primary.is_empty() {
            return Ok(None);
        }
        let (idx, _) = s
            .primary
            .iter()
            .enumerate()
            .min_by_key(|(_, (_, score))| *score)
            .map(|(idx, (id, score))| (idx, (*id, *score)))
            .expect("checked non-empty above");
        let (batch_id, _) = s.primary.remove(idx);
        s.processing.insert(batch_id);
        Ok(Some(QueueEntry { batch_id }))
    }

    async fn peek(&self, n: usize) -> Result<Vec<QueueEntry>> {
        let s = self.state.lock();
        let mut sorted = s.primary.clone();
        sorted.sort_by_key(|(_, score)| *score);
        Ok(sorted
            .into_iter()
            .take(n)
            .map(|(batch_id, _)| QueueEntry { batch_id })
            .collect())
    }

    async fn schedule_callback(&self, batch_id: BatchId, scheduled_for: DateTime<Utc>) -> Result<()> {
        let mut s = self.state.lock();
        s.callback.retain(|(id, _)| *id != batch_id);
        s.callback.push((batch_id, scheduled_for));
        Ok(())
    }

    async fn due_callbacks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueEntry>> {
        let mut s = self.state.lock();
        let mut due: Vec<(BatchId, DateTime<Utc>)> =
            s.callback.iter().filter(|(_, at)| *at <= now).cloned().collect();
        due.sort_by_key(|(_, at)| *at);
        due.truncate(limit);
        let due_ids: HashSet<BatchId> = due.iter().map(|(id, _)| *id).collect();
        s.callback.retain(|(id, _)| !due_ids.contains(id));
        Ok(due.into_iter().map(|(batch_id, _)| QueueEntry { batch_id }).collect())
    }

    async fn complete(&self, batch_id: BatchId) -> Result<()> {
        self.state.lock().processing.remove(&batch_id);
        Ok(())
    }

    async fn claim_supplier(&self, supplier_id: Uuid) -> Result<bool> {
        Ok(self.state.lock().locked_suppliers.insert(supplier_id))
    }

    async fn release_supplier(&self, supplier_id: Uuid) -> Result<()> {
        self.state.lock().locked_suppliers.remove(&supplier_id);
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        *self.state.lock() = State::default();
        Ok(())
    }
}

