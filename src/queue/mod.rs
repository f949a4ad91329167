//! The Queue Store: the priority queue, callback schedule, and supplier
//! exclusion set that sit in front of the Durable Store. Everything here is
//! ephemeral routing state — the Durable Store, not the queue, is the
//! source of truth for batch/PO content (§4.2).

pub mod in_memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::BatchId;

/// An entry popped off the primary or callback queue: just enough to look
/// the batch up in the Durable Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub batch_id: BatchId,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Add a batch to the primary priority queue with the given score
    /// (`-totalValue`, so `pop_min` returns the highest-value batch first).
    async fn enqueue(&self, batch_id: BatchId, score: rust_decimal::Decimal) -> Result<()>;

    /// Atomically pop the lowest-scored entry off the primary queue and
    /// move it to the processing set (stamped with the current time), so a
    /// crash between pop and dispatch doesn't silently drop the batch.
    async fn pop_min(&self) -> Result<Option<QueueEntry>>;

    /// Non-destructive look at the next `n` entries, lowest score first.
    async fn peek(&self, n: usize) -> Result<Vec<QueueEntry>>;

    /// Move a batch into the callback schedule, to be returned to the
    /// primary queue no earlier than `scheduled_for`.
    async fn schedule_callback(&self, batch_id: BatchId, scheduled_for: DateTime<Utc>) -> Result<()>;

    /// Entries from the callback schedule whose time has come, up to
    /// `limit`, removing them from the schedule as they're returned.
    async fn due_callbacks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueEntry>>;

    /// Remove a batch from the processing set once dispatch has fully
    /// concluded (success, terminal failure, or a callback reschedule).
    async fn complete(&self, batch_id: BatchId) -> Result<()>;

    /// Atomically add `supplier_id` to the exclusion set if absent.
    /// Returns `true` if the claim succeeded (no other batch is currently
    /// dispatching for this supplier).
    async fn claim_supplier(&self, supplier_id: uuid::Uuid) -> Result<bool>;

    /// Release a supplier claim. Idempotent: releasing an unclaimed
    /// supplier is a no-op, never an error (every dispatch exit path calls
    /// this unconditionally, see `dispatcher`).
    async fn release_supplier(&self, supplier_id: uuid::Uuid) -> Result<()>;

    /// Wipe all queue state. Used by `POST /reset`.
    async fn reset(&self) -> Result<()>;
}
