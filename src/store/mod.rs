//! The Durable Store: system of record for suppliers, POs, batches, agent
//! runs, logs, and activity. Enforces referential integrity and provides
//! transactional, optimistic-concurrency updates (§4.1).

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(test)]
mod tests;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    ActionType, ActivityLog, AgentRun, BatchId, BatchLog, BatchLogType, BatchStatus, Conflict,
    ConflictType, EntityType, LogLevel, Money, PoStatus, PurchaseOrder, PurchaseOrderId,
    Supplier, SupplierBatch, SupplierId,
};

/// A classified row ready for bulk insertion / re-upload reconciliation.
#[derive(Debug, Clone)]
pub struct PoUpsert {
    pub po_number: String,
    pub po_line: String,
    pub supplier_number: String,
    pub supplier_name: String,
    pub action_type: ActionType,
    pub due_date: NaiveDate,
    pub recommended_date: Option<NaiveDate>,
    pub calculated_total_value: Money,
}

impl PoUpsert {
    pub fn external_id(&self) -> String {
        PurchaseOrder::make_external_id(&self.po_number, &self.po_line)
    }
}

/// Outcome of upserting a single PO row: either it's brand new, or it
/// existed already (possibly with a recorded conflict).
#[derive(Debug, Clone)]
pub enum PoUpsertOutcome {
    Inserted(PurchaseOrder),
    Updated {
        po: PurchaseOrder,
        conflict: Option<Conflict>,
    },
}

impl PoUpsertOutcome {
    pub fn po(&self) -> &PurchaseOrder {
        match self {
            PoUpsertOutcome::Inserted(po) => po,
            PoUpsertOutcome::Updated { po, .. } => po,
        }
    }
}

/// A proposed batch from the Batch Builder, not yet created in the store.
#[derive(Debug, Clone)]
pub struct ProposedBatch {
    pub supplier_id: SupplierId,
    pub po_ids: Vec<PurchaseOrderId>,
    pub action_types: std::collections::BTreeSet<ActionType>,
    pub total_value: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSort {
    TotalValue,
    SupplierName,
    CreatedAt,
    Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplierSort {
    Name,
    CreatedAt,
    TotalValue,
    BatchCount,
}

/// Per-supplier roll-up figures for the suppliers list and detail endpoints
/// (spec §6 "suppliers with roll-ups").
#[derive(Debug, Clone, Copy, Default)]
pub struct SupplierRollup {
    pub batch_count: i64,
    pub po_count: i64,
    pub total_value: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct BatchFilter {
    pub status: Option<BatchStatus>,
    pub action_type: Option<ActionType>,
    pub search: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub by_batch_status: Vec<(BatchStatus, i64, Money)>,
    pub by_action_type: Vec<(ActionType, i64, Money)>,
    pub unique_suppliers: i64,
}

/// Transactional record store for the engine's durable state.
///
/// Implementations must make batch-state-affecting writes atomic: an
/// observer must never see a batch IN_PROGRESS while its linked POs are
/// still QUEUED, and `update_batch_status_if` must be a true compare-and-swap
/// (affected-row-count check) so the reconciler and dispatcher can race
/// safely without pessimistic locks.
#[async_trait]
pub trait Store: Send + Sync {
    // -- suppliers -----------------------------------------------------
    async fn upsert_supplier(
        &self,
        supplier_number: &str,
        name: &str,
    ) -> Result<Supplier>;

    async fn get_supplier(&self, id: SupplierId) -> Result<Supplier>;

    /// Returns each matching supplier paired with its roll-up (batch/PO
    /// counts and total linked value).
    async fn list_suppliers(
        &self,
        search: Option<&str>,
        sort: SupplierSort,
        order: SortOrder,
        page: u32,
        limit: u32,
    ) -> Result<Page<(Supplier, SupplierRollup)>>;

    /// All POs ever linked to a batch belonging to this supplier, for the
    /// supplier detail endpoint's PO list (spec §6 "supplier detail with
    /// batch list, PO list, stats").
    async fn list_purchase_orders_for_supplier(&self, supplier_id: SupplierId) -> Result<Vec<PurchaseOrder>>;

    // -- purchase orders -------------------------------------------------
    /// Insert or re-classify a batch of rows. Existing POs (matched on
    /// `external_id`) are updated in place and have `batch_id` cleared; a
    /// `Conflict` is recorded when due date, recommended date, or value
    /// differ from the stored copy (§4.5 re-upload semantics).
    async fn upsert_purchase_orders(&self, rows: Vec<PoUpsert>) -> Result<Vec<PoUpsertOutcome>>;

    async fn get_purchase_order(&self, id: PurchaseOrderId) -> Result<PurchaseOrder>;

    /// POs with `batch_id IS NULL`, grouped by the classifier's output so
    /// the Batch Builder can group-by-supplier and sort within each group.
    async fn unassigned_purchase_orders(&self) -> Result<Vec<PurchaseOrder>>;

    /// Conditionally advance a PO's status (compare-and-swap on `expected`).
    /// Returns `false` if the current status didn't match `expected`
    /// (someone else already moved it — a no-op, not an error, so
    /// reconciler re-delivery stays idempotent).
    async fn update_po_status_if(
        &self,
        id: PurchaseOrderId,
        expected: PoStatus,
        new_status: PoStatus,
    ) -> Result<bool>;

    /// Mark a PO completed, optionally copying `recommended_date` into
    /// `due_date` (preserving the old value in `original_due_date`). A
    /// conditional update: no-ops if the PO is already COMPLETED.
    async fn complete_purchase_order(
        &self,
        id: PurchaseOrderId,
        copy_recommended_into_due: bool,
    ) -> Result<bool>;

    async fn fail_purchase_order(&self, id: PurchaseOrderId) -> Result<bool>;

    /// `true` if no PO linked to `batch_id` is in `{QUEUED, IN_PROGRESS}`.
    async fn batch_has_no_active_pos(&self, batch_id: BatchId) -> Result<bool>;

    // -- batches ---------------------------------------------------------
    /// Atomically link the given unassigned POs (`batch_id IS NULL`) to a
    /// freshly created batch. If the link affects zero POs the batch is
    /// abandoned: returns `Ok(None)` and nothing is created.
    async fn create_batch_linking_pos(&self, proposed: ProposedBatch) -> Result<Option<SupplierBatch>>;

    async fn get_batch(&self, id: BatchId) -> Result<SupplierBatch>;

    async fn get_batch_purchase_orders(&self, id: BatchId) -> Result<Vec<PurchaseOrder>>;

    async fn list_batches(
        &self,
        filter: BatchFilter,
        sort: BatchSort,
        order: SortOrder,
        page: u32,
        limit: u32,
    ) -> Result<Page<SupplierBatch>>;

    async fn list_batches_for_supplier(&self, supplier_id: SupplierId) -> Result<Vec<SupplierBatch>>;

    /// Compare-and-swap on batch status.
    async fn update_batch_status_if(
        &self,
        id: BatchId,
        expected: BatchStatus,
        new_status: BatchStatus,
    ) -> Result<bool>;

    /// Transactionally: set the batch IN_PROGRESS, all its member POs
    /// (currently QUEUED or PENDING) to IN_PROGRESS, and increment
    /// `attempt_count`. No-ops (returns `false`) if the batch isn't QUEUED.
    async fn start_dispatch(&self, batch_id: BatchId) -> Result<bool>;

    /// Revert a failed dispatch attempt: batch and its POs back to QUEUED,
    /// `attempt_count` decremented (a failed trigger does not consume an
    /// attempt — see spec Open Question (b)).
    async fn revert_dispatch(&self, batch_id: BatchId) -> Result<()>;

    /// Record a successful trigger: store `external_id`/`external_url` on
    /// the batch.
    async fn record_dispatch_success(
        &self,
        batch_id: BatchId,
        external_id: &str,
        external_url: &str,
    ) -> Result<()>;

    /// Transition to a terminal status, set `completed_at`, and record
    /// `last_outcome`. A no-op if already terminal (idempotent re-delivery).
    async fn complete_batch(
        &self,
        batch_id: BatchId,
        new_status: BatchStatus,
        outcome: &str,
    ) -> Result<bool>;

    /// Move IN_PROGRESS -> QUEUED with a callback time and incremented
    /// `attempt_count`.
    async fn schedule_batch_callback(
        &self,
        batch_id: BatchId,
        scheduled_for: DateTime<Utc>,
    ) -> Result<bool>;

    async fn stats(&self) -> Result<BatchStats>;

    async fn reset(&self) -> Result<()>;

    // -- agent runs --------------------------------------------------------
    async fn create_agent_run(
        &self,
        batch_id: BatchId,
        external_id: &str,
        attempt: u32,
    ) -> Result<AgentRun>;

    async fn end_agent_run(
        &self,
        batch_id: BatchId,
        outcome: &str,
        duration_ms: Option<i64>,
    ) -> Result<()>;

    async fn list_agent_runs(&self, batch_id: BatchId) -> Result<Vec<AgentRun>>;

    // -- logs --------------------------------------------------------------
    async fn append_batch_log(
        &self,
        batch_id: BatchId,
        log_type: BatchLogType,
        level: LogLevel,
        message: &str,
        data: serde_json::Value,
    ) -> Result<BatchLog>;

    async fn list_batch_logs(&self, batch_id: BatchId, limit: u32) -> Result<Vec<BatchLog>>;

    async fn append_activity_log(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        action: &str,
        details: serde_json::Value,
    ) -> Result<ActivityLog>;

    // -- conflicts -----------------------------------------------------------
    async fn create_conflict(
        &self,
        purchase_order_id: PurchaseOrderId,
        conflict_type: ConflictType,
        details: serde_json::Value,
    ) -> Result<Conflict>;
}
