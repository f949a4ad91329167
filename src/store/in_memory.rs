//! In-memory `Store` backed by `parking_lot::RwLock<HashMap>`, mirroring the
//! teacher's `InMemoryStorage`. Used for unit tests and for running the
//! engine without Postgres during local development.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{
    ActivityLog, AgentRun, AgentRunStatus, BatchId, BatchLog, BatchLogType, BatchStatus, Conflict,
    ConflictType, EntityType, LogLevel, Money, PoStatus, PurchaseOrder, PurchaseOrderId, Supplier,
    SupplierBatch, SupplierId,
};

use super::{
    BatchFilter, BatchSort, BatchStats, Page, PoUpsert, PoUpsertOutcome, ProposedBatch, SortOrder,
    Store, SupplierRollup, SupplierSort,
};

#[derive(Default)]
struct Tables {
    suppliers: HashMap<SupplierId, Supplier>,
    suppliers_by_number: HashMap<String, SupplierId>,
    purchase_orders: HashMap<PurchaseOrderId, PurchaseOrder>,
    pos_by_external_id: HashMap<String, PurchaseOrderId>,
    batches: HashMap<BatchId, SupplierBatch>,
    batch_pos: HashMap<BatchId, Vec<PurchaseOrderId>>,
    agent_runs: HashMap<Uuid, AgentRun>,
    batch_logs: HashMap<Uuid, BatchLog>,
    activity_logs: HashMap<Uuid, ActivityLog>,
    conflicts: HashMap<Uuid, Conflict>,
}

/// In-memory stand-in for the Durable Store. Single-process only; every
/// method takes the write lock for its whole body, so callers get the same
/// linearizable semantics a single-row Postgres transaction would give,
/// just without the durability.
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    log_seq: AtomicI64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            log_seq: AtomicI64::new(0),
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_supplier(&self, supplier_number: &str, name: &str) -> Result<Supplier> {
        let mut t = self.tables.write();
        if let Some(id) = t.suppliers_by_number.get(supplier_number).copied() {
            let supplier = t.suppliers.get_mut(&id).expect("indexed supplier missing");
            supplier.name = name.to_string();
            return Ok(supplier.clone());
        }
        let supplier = Supplier {
            id: Uuid::new_v4(),
            supplier_number: supplier_number.to_string(),
            name: name.to_string(),
            phone: None,
            email: None,
            facility: None,
            created_at: Utc::now(),
        };
        t.suppliers_by_number
            .insert(supplier_number.to_string(), supplier.id);
        t.suppliers.insert(supplier.id, supplier.clone());
        Ok(supplier)
    }

    async fn get_supplier(&self, id: SupplierId) -> Result<Supplier> {
        self.tables
            .read()
            .suppliers
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("supplier", id))
    }

    async fn list_suppliers(
        &self,
        search: Option<&str>,
        sort: SupplierSort,
        order: SortOrder,
        page: u32,
        limit: u32,
    ) -> Result<Page<(Supplier, SupplierRollup)>> {
        let t = self.tables.read();
        let mut all: Vec<(Supplier, SupplierRollup)> = t
            .suppliers
            .values()
            .filter(|s| match search {
                Some(q) => {
                    let q = q.to_lowercase();
                    s.name.to_lowercase().contains(&q) || s.supplier_number.to_lowercase().contains(&q)
                }
                None => true,
            })
            .cloned()
            .map(|s| {
                let batches: Vec<&SupplierBatch> = t.batches.values().filter(|b| b.supplier_id == s.id).collect();
                let po_count = t.purchase_orders.values().filter(|po| po.supplier_id == s.id).count() as i64;
                let rollup = SupplierRollup {
                    batch_count: batches.len() as i64,
                    po_count,
                    total_value: batches.iter().map(|b| b.total_value).sum(),
                };
                (s, rollup)
            })
            .collect();

        match sort {
            SupplierSort::Name => all.sort_by(|a, b| a.0.name.cmp(&b.0.name)),
            SupplierSort::CreatedAt => all.sort_by(|a, b| a.0.created_at.cmp(&b.0.created_at)),
            SupplierSort::TotalValue => all.sort_by(|a, b| a.1.total_value.cmp(&b.1.total_value)),
            SupplierSort::BatchCount => all.sort_by(|a, b| a.1.batch_count.cmp(&b.1.batch_count)),
        }
        if order == SortOrder::Desc {
            all.reverse();
        }

        let total = all.len() as i64;
        let start = (page.saturating_sub(1) as usize) * limit as usize;
        let items = all.into_iter().skip(start).take(limit as usize).collect();
        Ok(Page { items, total })
    }

    async fn list_purchase_orders_for_supplier(&self, supplier_id: SupplierId) -> Result<Vec<PurchaseOrder>> {
        Ok(self
            .tables
            .read()
            .purchase_orders
            .values()
            .filter(|po| po.supplier_id == supplier_id)
            .cloned()
            .collect())
    }

    async fn upsert_purchase_orders(&self, rows: Vec<PoUpsert>) -> Result<Vec<PoUpsertOutcome>> {
        let mut t = self.tables.write();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let supplier_id = if let Some(id) = t.suppliers_by_number.get(&row.supplier_number).copied() {
                id
            } else {
                let supplier = Supplier {
                    id: Uuid::new_v4(),
                    supplier_number: row.supplier_number.clone(),
                    name: row.supplier_name.clone(),
                    phone: None,
                    email: None,
                    facility: None,
                    created_at: Utc::now(),
                };
                t.suppliers_by_number
                    .insert(row.supplier_number.clone(), supplier.id);
                let id = supplier.id;
                t.suppliers.insert(id, supplier);
                id
            };

            let external_id = row.external_id();
            let now = Utc::now();
            if let Some(existing_id) = t.pos_by_external_id.get(&external_id).copied() {
                let existing = t.purchase_orders.get(&existing_id).expect("indexed po missing").clone();
                let mut conflict_details = serde_json::Map::new();
                let mut conflict_type = None;
                if existing.due_date != row.due_date {
                    conflict_details.insert(
                        "due_date".into(),
                        serde_json::json!({"old": existing.due_date, "new": row.due_date}),
                    );
                    conflict_type = Some(ConflictType::DueDateChanged);
                }
                if existing.recommended_date != row.recommended_date {
                    conflict_details.insert(
                        "recommended_date".into(),
                        serde_json::json!({"old": existing.recommended_date, "new": row.recommended_date}),
                    );
                    conflict_type.get_or_insert(ConflictType::RecommendedDateChanged);
                }
                if existing.calculated_total_value != row.calculated_total_value {
                    conflict_details.insert(
                        "calculated_total_value".into(),
                        serde_json::json!({
                            "old": existing.calculated_total_value.to_string(),
                            "new": row.calculated_total_value.to_string(),
                        }),
                    );
                    conflict_type.get_or_insert(ConflictType::ValueChanged);
                }

                let updated = PurchaseOrder {
                    action_type: row.action_type,
                    due_date: row.due_date,
                    recommended_date: row.recommended_date,
                    calculated_total_value: row.calculated_total_value,
                    status: PoStatus::Queued,
                    batch_id: None,
                    updated_at: now,
                    ..existing
                };
                t.purchase_orders.insert(existing_id, updated.clone());

                let conflict = if let Some(conflict_type) = conflict_type {
                    let conflict = Conflict {
                        id: Uuid::new_v4(),
                        purchase_order_id: existing_id,
                        conflict_type,
                        conflict_details: serde_json::Value::Object(conflict_details),
                        resolution: None,
                        created_at: now,
                    };
                    t.conflicts.insert(conflict.id, conflict.clone());
                    Some(conflict)
                } else {
                    None
                };

                out.push(PoUpsertOutcome::Updated { po: updated, conflict });
            } else {
                let po = PurchaseOrder {
                    id: Uuid::new_v4(),
                    external_id: external_id.clone(),
                    po_number: row.po_number,
                    po_line: row.po_line,
                    supplier_id,
                    action_type: row.action_type,
                    status: PoStatus::Pending,
                    due_date: row.due_date,
                    original_due_date: None,
                    recommended_date: row.recommended_date,
                    calculated_total_value: row.calculated_total_value,
                    batch_id: None,
                    created_at: now,
                    updated_at: now,
                };
                t.pos_by_external_id.insert(external_id, po.id);
                t.purchase_orders.insert(po.id, po.clone());
                out.push(PoUpsertOutcome::Inserted(po));
            }
        }
        Ok(out)
    }

    async fn get_purchase_order(&self, id: PurchaseOrderId) -> Result<PurchaseOrder> {
        self.tables
            .read()
            .purchase_orders
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("purchase_order", id))
    }

    async fn unassigned_purchase_orders(&self) -> Result<Vec<PurchaseOrder>> {
        Ok(self
            .tables
            .read()
            .purchase_orders
            .values()
            .filter(|po| po.batch_id.is_none() && po.status != PoStatus::Completed && po.status != PoStatus::Failed)
            .cloned()
            .collect())
    }

    async fn update_po_status_if(
        &self,
        id: PurchaseOrderId,
        expected: PoStatus,
        new_status: PoStatus,
    ) -> Result<bool> {
        let mut t = self.tables.write();
        let Some(po) = t.purchase_orders.get_mut(&id) else {
            return Err(EngineError::not_found("purchase_order", id));
        };
        if po.status != expected {
            return Ok(false);
        }
        po.status = new_status;
        po.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete_purchase_order(
        &self,
        id: PurchaseOrderId,
        copy_recommended_into_due: bool,
    ) -> Result<bool> {
        let mut t = self.tables.write();
        let Some(po) = t.purchase_orders.get_mut(&id) else {
            return Err(EngineError::not_found("purchase_order", id));
        };
        if po.status == PoStatus::Completed {
            return Ok(false);
        }
        if copy_recommended_into_due {
            if let Some(recommended) = po.recommended_date {
                po.original_due_date.get_or_insert(po.due_date);
                po.due_date = recommended;
            }
        }
        po.status = PoStatus::Completed;
        po.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail_purchase_order(&self, id: PurchaseOrderId) -> Result<bool> {
        let mut t = self.tables.write();
        let Some(po) = t.purchase_orders.get_mut(&id) else {
            return Err(EngineError::not_found("purchase_order", id));
        };
        if po.status.is_terminal() {
            return Ok(false);
        }
        po.status = PoStatus::Failed;
        po.updated_at = Utc::now();
        Ok(true)
    }

    async fn batch_has_no_active_pos(&self, batch_id: BatchId) -> Result<bool> {
        let t = self.tables.read();
        let Some(po_ids) = t.batch_pos.get(&batch_id) else {
            return Ok(true);
        };
        Ok(po_ids
            .iter()
            .filter_map(|id| t.purchase_orders.get(id))
            .all(|po| !po.status.is_active()))
    }

    async fn create_batch_linking_pos(&self, proposed: ProposedBatch) -> Result<Option<SupplierBatch>> {
        let mut t = self.tables.write();
        let linkable: Vec<PurchaseOrderId> = proposed
            .po_ids
            .iter()
            .filter(|id| {
                t.purchase_orders
                    .get(id)
                    .is_some_and(|po| po.batch_id.is_none())
            })
            .copied()
            .collect();
        if linkable.is_empty() {
            return Ok(None);
        }

        let now = Utc::now();
        let batch = SupplierBatch {
            id: Uuid::new_v4(),
            supplier_id: proposed.supplier_id,
            status: BatchStatus::Queued,
            action_types: proposed.action_types,
            total_value: proposed.total_value,
            po_count: linkable.len(),
            priority: proposed.total_value.negated(),
            attempt_count: 0,
            max_attempts: 5,
            scheduled_for: None,
            external_id: None,
            external_url: None,
            last_outcome: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        for id in &linkable {
            if let Some(po) = t.purchase_orders.get_mut(id) {
                po.batch_id = Some(batch.id);
                po.status = PoStatus::Queued;
                po.updated_at = now;
            }
        }
        t.batch_pos.insert(batch.id, linkable);
        t.batches.insert(batch.id, batch.clone());
        Ok(Some(batch))
    }

    async fn get_batch(&self, id: BatchId) -> Result<SupplierBatch> {
        self.tables
            .read()
            .batches
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("batch", id))
    }

    async fn get_batch_purchase_orders(&self, id: BatchId) -> Result<Vec<PurchaseOrder>> {
        let t = self.tables.read();
        Ok(t.batch_pos
            .get(&id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| t.purchase_orders.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_batches(
        &self,
        filter: BatchFilter,
        sort: BatchSort,
        order: SortOrder,
        page: u32,
        limit: u32,
    ) -> Result<Page<SupplierBatch>> {
        let t = self.tables.read();
        let mut all: Vec<SupplierBatch> = t
            .batches
            .values()
            .filter(|b| filter.status.is_none_or(|s| b.status == s))
            .filter(|b| {
                filter
                    .action_type
                    .is_none_or(|a| b.action_types.contains(&a))
            })
            .filter(|b| match &filter.search {
                Some(q) => t
                    .suppliers
                    .get(&b.supplier_id)
                    .is_some_and(|s| s.name.to_lowercase().contains(&q.to_lowercase())),
                None => true,
            })
            .cloned()
            .collect();

        all.sort_by(|a, b| match sort {
            BatchSort::TotalValue => a.total_value.cmp(&b.total_value),
            BatchSort::SupplierName => {
                let name = |id: SupplierId| t.suppliers.get(&id).map(|s| s.name.clone()).unwrap_or_default();
                name(a.supplier_id).cmp(&name(b.supplier_id))
            }
            BatchSort::CreatedAt => a.created_at.cmp(&b.created_at),
            BatchSort::Priority => a.priority.cmp(&b.priority),
        });
        if order == SortOrder::Desc {
            all.reverse();
        }

        let total = all.len() as i64;
        let start = (page.saturating_sub(1) as usize) * limit as usize;
        let items = all.into_iter().skip(start).take(limit as usize).collect();
        Ok(Page { items, total })
    }

    async fn list_batches_for_supplier(&self, supplier_id: SupplierId) -> Result<Vec<SupplierBatch>> {
        Ok(self
            .tables
            .read()
            .batches
            .values()
            .filter(|b| b.supplier_id == supplier_id)
            .cloned()
            .collect())
    }

    async fn update_batch_status_if(
        &self,
        id: BatchId,
        expected: BatchStatus,
        new_status: BatchStatus,
    ) -> Result<bool> {
        let mut t = self.tables.write();
        let Some(batch) = t.batches.get_mut(&id) else {
            return Err(EngineError::not_found("batch", id));
        };
        if batch.status != expected {
            return Ok(false);
        }
        batch.status = new_status;
        batch.updated_at = Utc::now();
        Ok(true)
    }

    async fn start_dispatch(&self, batch_id: BatchId) -> Result<bool> {
        let mut t = self.tables.write();
        let po_ids = t.batch_pos.get(&batch_id).cloned().unwrap_or_default();
        let Some(batch) = t.batches.get_mut(&batch_id) else {
            return Err(EngineError::not_found("batch", batch_id));
        };
        if batch.status != BatchStatus::Queued {
            return Ok(false);
        }
        batch.status = BatchStatus::InProgress;
        batch.attempt_count += 1;
        batch.updated_at = Utc::now();
        for id in po_ids {
            if let Some(po) = t.purchase_orders.get_mut(&id) {
                if matches!(po.status, PoStatus::Queued | PoStatus::Pending) {
                    po.status = PoStatus::InProgress;
                    po.updated_at = Utc::now();
                }
            }
        }
        Ok(true)
    }

    async fn revert_dispatch(&self, batch_id: BatchId) -> Result<()> {
        let mut t = self.tables.write();
        let po_ids = t.batch_pos.get(&batch_id).cloned().unwrap_or_default();
        if let Some(batch) = t.batches.get_mut(&batch_id) {
            batch.status = BatchStatus::Queued;
            batch.attempt_count = batch.attempt_count.saturating_sub(1);
            batch.updated_at = Utc::now();
        }
        for id in po_ids {
            if let Some(po) = t.purchase_orders.get_mut(&id) {
                if po.status == PoStatus::InProgress {
                    po.status = PoStatus::Queued;
                    po.updated_at = Utc::now();
                }
            }
        }
        Ok(())
    }

    async fn record_dispatch_success(
        &self,
        batch_id: BatchId,
        external_id: &str,
        external_url: &str,
    ) -> Result<()> {
        let mut t = self.tables.write();
        let Some(batch) = t.batches.get_mut(&batch_id) else {
            return Err(EngineError::not_found("batch", batch_id));
        };
        batch.external_id = Some(external_id.to_string());
        batch.external_url = Some(external_url.to_string());
        batch.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_batch(&self, batch_id: BatchId, new_status: BatchStatus, outcome: &str) -> Result<bool> {
        let mut t = self.tables.write();
        let Some(batch) = t.batches.get_mut(&batch_id) else {
            return Err(EngineError::not_found("batch", batch_id));
        };
        if batch.status.is_terminal() {
            return Ok(false);
        }
        batch.status = new_status;
        batch.last_outcome = Some(outcome.to_string());
        batch.completed_at = Some(Utc::now());
        batch.updated_at = Utc::now();
        Ok(true)
    }

    async fn schedule_batch_callback(&self, batch_id: BatchId, scheduled_for: DateTime<Utc>) -> Result<bool> {
        let mut t = self.tables.write();
        let Some(batch) = t.batches.get_mut(&batch_id) else {
            return Err(EngineError::not_found("batch", batch_id));
        };
        if batch.status != BatchStatus::InProgress {
            return Ok(false);
        }
        batch.status = BatchStatus::Queued;
        batch.scheduled_for = Some(scheduled_for);
        batch.attempt_count += 1;
        batch.updated_at = Utc::now();
        Ok(true)
    }

    async fn stats(&self) -> Result<BatchStats> {
        let t = self.tables.read();
        let mut by_batch_status: HashMap<BatchStatus, (i64, Money)> = HashMap::new();
        for batch in t.batches.values() {
            let entry = by_batch_status.entry(batch.status).or_insert((0, Money::ZERO));
            entry.0 += 1;
            entry.1 = entry.1 + batch.total_value;
        }
        let mut by_action_type: HashMap<crate::model::ActionType, (i64, Money)> = HashMap::new();
        for po in t.purchase_orders.values() {
            let entry = by_action_type.entry(po.action_type).or_insert((0, Money::ZERO));
            entry.0 += 1;
            entry.1 = entry.1 + po.calculated_total_value;
        }
        let unique_suppliers = t
            .batches
            .values()
            .map(|b| b.supplier_id)
            .collect::<BTreeSet<_>>()
            .len() as i64;

        Ok(BatchStats {
            by_batch_status: by_batch_status.into_iter().map(|(k, (c, v))| (k, c, v)).collect(),
            by_action_type: by_action_type.into_iter().map(|(k, (c, v))| (k, c, v)).collect(),
            unique_suppliers,
        })
    }

    /// Clears queues and the batch/conflict/PO/supplier tables; leaves
    /// `batch_logs` and `activity_logs` untouched, since those are audit
    /// trails, not live state (spec.md `POST /reset`: "does not clear
    /// audit logs").
    async fn reset(&self) -> Result<()> {
        let mut t = self.tables.write();
        t.suppliers.clear();
        t.suppliers_by_number.clear();
        t.purchase_orders.clear();
        t.pos_by_external_id.clear();
        t.batches.clear();
        t.batch_pos.clear();
        t.agent_runs.clear();
        t.conflicts.clear();
        Ok(())
    }

    async fn create_agent_run(&self, batch_id: BatchId, external_id: &str, attempt: u32) -> Result<AgentRun> {
        let run = AgentRun {
            id: Uuid::new_v4(),
            batch_id,
            external_id: external_id.to_string(),
            status: AgentRunStatus::Active,
            outcome: None,
            attempt,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
        };
        self.tables.write().agent_runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn end_agent_run(&self, batch_id: BatchId, outcome: &str, duration_ms: Option<i64>) -> Result<()> {
        let mut t = self.tables.write();
        if let Some(run) = t
            .agent_runs
            .values_mut()
            .filter(|r| r.batch_id == batch_id && r.status == AgentRunStatus::Active)
            .max_by_key(|r| r.started_at)
        {
            run.status = if outcome == "failed" {
                AgentRunStatus::Failed
            } else {
                AgentRunStatus::Completed
            };
            run.outcome = Some(outcome.to_string());
            run.ended_at = Some(Utc::now());
            run.duration_ms = duration_ms;
        }
        Ok(())
    }

    async fn list_agent_runs(&self, batch_id: BatchId) -> Result<Vec<AgentRun>> {
        let mut runs: Vec<AgentRun> = self
            .tables
            .read()
            .agent_runs
            .values()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    async fn append_batch_log(
        &self,
        batch_id: BatchId,
        log_type: BatchLogType,
        level: LogLevel,
        message: &str,
        data: serde_json::Value,
    ) -> Result<BatchLog> {
        self.log_seq.fetch_add(1, Ordering::Relaxed);
        let log = BatchLog {
            id: Uuid::new_v4(),
            batch_id,
            log_type,
            level,
            message: message.to_string(),
            data,
            created_at: Utc::now(),
        };
        self.tables.write().batch_logs.insert(log.id, log.clone());
        Ok(log)
    }

    async fn list_batch_logs(&self, batch_id: BatchId, limit: u32) -> Result<Vec<BatchLog>> {
        let t = self.tables.read();
        let mut logs: Vec<BatchLog> = t
            .batch_logs
            .values()
            .filter(|l| l.batch_id == batch_id)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.created_at);
        logs.truncate(limit as usize);
        Ok(logs)
    }

    async fn append_activity_log(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        action: &str,
        details: serde_json::Value,
    ) -> Result<ActivityLog> {
        let log = ActivityLog {
            id: Uuid::new_v4(),
            entity_type,
            entity_id,
            action: action.to_string(),
            user_id: None,
            details,
            created_at: Utc::now(),
        };
        self.tables.write().activity_logs.insert(log.id, log.clone());
        Ok(log)
    }

    async fn create_conflict(
        &self,
        purchase_order_id: PurchaseOrderId,
        conflict_type: ConflictType,
        details: serde_json::Value,
    ) -> Result<Conflict> {
        let conflict = Conflict {
            id: Uuid::new_v4(),
            purchase_order_id,
            conflict_type,
            conflict_details: details,
            resolution: None,
            created_at: Utc::now(),
        };
        self.tables.write().conflicts.insert(conflict.id, conflict.clone());
        Ok(conflict)
    }
}
