//! Request/response data structures for the HTTP API.
//!
//! Mirrors the teacher's `api::models` convention (one struct per
//! wire shape, `From`/`Into` conversions from the store's domain types) but
//! without `utoipa` annotations — this crate doesn't carry an OpenAPI
//! dependency, since nothing in §6 calls for published API docs.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{
    ActionType, AgentRun, BatchLog, BatchStatus, PoStatus, PurchaseOrder, Supplier, SupplierBatch,
};
use crate::store::{BatchSort, Page, SortOrder, SupplierRollup, SupplierSort};

pub const DEFAULT_LIMIT: u32 = 20;
pub const MAX_LIMIT: u32 = 100;

/// Offset-based pagination query shared by `/batches` and `/suppliers`
/// (spec §4.10: "Pagination is offset-based with a hard cap").
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl PageQuery {
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

impl<T> PaginatedResponse<T> {
    pub fn from_page<U, F: Fn(U) -> T>(page: Page<U>, query_page: u32, limit: u32, map: F) -> Self {
        Self {
            data: page.items.into_iter().map(map).collect(),
            total: page.total,
            page: query_page,
            limit,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchListQuery {
    pub status: Option<BatchStatus>,
    #[serde(rename = "actionType")]
    pub action_type: Option<ActionType>,
    pub search: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl BatchListQuery {
    pub fn sort(&self) -> BatchSort {
        match self.sort.as_deref() {
            Some("supplierName") | Some("supplier_name") => BatchSort::SupplierName,
            Some("createdAt") | Some("created_at") => BatchSort::CreatedAt,
            Some("priority") => BatchSort::Priority,
            _ => BatchSort::TotalValue,
        }
    }

    pub fn order(&self) -> SortOrder {
        match self.order.as_deref() {
            Some("asc") => SortOrder::Asc,
            _ => SortOrder::Desc,
        }
    }

    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Deserialize)]
pub struct SupplierListQuery {
    pub search: Option<String>,
    #[serde(rename = "sortBy")]
    pub sort_by: Option<String>,
    #[serde(rename = "sortOrder")]
    pub sort_order: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl SupplierListQuery {
    pub fn sort(&self) -> SupplierSort {
        match self.sort_by.as_deref() {
            Some("totalValue") | Some("total_value") => SupplierSort::TotalValue,
            Some("batchCount") | Some("batch_count") => SupplierSort::BatchCount,
            Some("createdAt") | Some("created_at") => SupplierSort::CreatedAt,
            _ => SupplierSort::Name,
        }
    }

    pub fn order(&self) -> SortOrder {
        match self.sort_order.as_deref() {
            Some("desc") => SortOrder::Desc,
            _ => SortOrder::Asc,
        }
    }

    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Serialize)]
pub struct SupplierResponse {
    pub id: Uuid,
    pub supplier_number: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub facility: Option<String>,
    pub created_at: DateTime<Utc>,
    pub batch_count: i64,
    pub po_count: i64,
    pub total_value: String,
}

impl From<(Supplier, SupplierRollup)> for SupplierResponse {
    fn from((s, rollup): (Supplier, SupplierRollup)) -> Self {
        Self {
            id: s.id,
            supplier_number: s.supplier_number,
            name: s.name,
            phone: s.phone,
            email: s.email,
            facility: s.facility,
            created_at: s.created_at,
            batch_count: rollup.batch_count,
            po_count: rollup.po_count,
            total_value: rollup.total_value.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SupplierDetailResponse {
    pub id: Uuid,
    pub supplier_number: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub facility: Option<String>,
    pub created_at: DateTime<Utc>,
    pub batch_count: i64,
    pub po_count: i64,
    pub total_value: String,
    pub batches: Vec<BatchResponse>,
    pub purchase_orders: Vec<PurchaseOrderResponse>,
}

#[derive(Debug, Serialize)]
pub struct PurchaseOrderResponse {
    pub id: Uuid,
    pub external_id: String,
    pub po_number: String,
    pub po_line: String,
    pub supplier_id: Uuid,
    pub action_type: ActionType,
    pub status: PoStatus,
    pub due_date: NaiveDate,
    pub original_due_date: Option<NaiveDate>,
    pub recommended_date: Option<NaiveDate>,
    pub calculated_total_value: String,
    pub batch_id: Option<Uuid>,
}

impl From<PurchaseOrder> for PurchaseOrderResponse {
    fn from(po: PurchaseOrder) -> Self {
        Self {
            id: po.id,
            external_id: po.external_id,
            po_number: po.po_number,
            po_line: po.po_line,
            supplier_id: po.supplier_id,
            action_type: po.action_type,
            status: po.status,
            due_date: po.due_date,
            original_due_date: po.original_due_date,
            recommended_date: po.recommended_date,
            calculated_total_value: po.calculated_total_value.to_string(),
            batch_id: po.batch_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub id: Uuid,
    pub supplier_id: Uuid,
    pub status: BatchStatus,
    pub action_types: Vec<ActionType>,
    pub total_value: String,
    pub po_count: usize,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub last_outcome: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<SupplierBatch> for BatchResponse {
    fn from(b: SupplierBatch) -> Self {
        Self {
            id: b.id,
            supplier_id: b.supplier_id,
            status: b.status,
            action_types: b.action_types.into_iter().collect(),
            total_value: b.total_value.to_string(),
            po_count: b.po_count,
            attempt_count: b.attempt_count,
            max_attempts: b.max_attempts,
            scheduled_for: b.scheduled_for,
            external_id: b.external_id,
            external_url: b.external_url,
            last_outcome: b.last_outcome,
            completed_at: b.completed_at,
            created_at: b.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AgentRunResponse {
    pub id: Uuid,
    pub external_id: String,
    pub status: String,
    pub outcome: Option<String>,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl From<AgentRun> for AgentRunResponse {
    fn from(r: AgentRun) -> Self {
        let status = match r.status {
            crate::model::AgentRunStatus::Active => "active",
            crate::model::AgentRunStatus::Completed => "completed",
            crate::model::AgentRunStatus::Failed => "failed",
        };
        Self {
            id: r.id,
            external_id: r.external_id,
            status: status.to_string(),
            outcome: r.outcome,
            attempt: r.attempt,
            started_at: r.started_at,
            ended_at: r.ended_at,
            duration_ms: r.duration_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchLogResponse {
    pub id: Uuid,
    pub log_type: String,
    pub level: String,
    pub message: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<BatchLog> for BatchLogResponse {
    fn from(l: BatchLog) -> Self {
        let log_type = match l.log_type {
            crate::model::BatchLogType::Log => "log",
            crate::model::BatchLogType::PoUpdate => "po_update",
            crate::model::BatchLogType::StatusChange => "status_change",
        };
        let level = match l.level {
            crate::model::LogLevel::Debug => "debug",
            crate::model::LogLevel::Info => "info",
            crate::model::LogLevel::Warn => "warn",
            crate::model::LogLevel::Error => "error",
            crate::model::LogLevel::Success => "success",
        };
        Self {
            id: l.id,
            log_type: log_type.to_string(),
            level: level.to_string(),
            message: l.message,
            data: l.data,
            created_at: l.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchDetailResponse {
    #[serde(flatten)]
    pub batch: BatchResponse,
    pub purchase_orders: Vec<PurchaseOrderResponse>,
    pub agent_runs: Vec<AgentRunResponse>,
    pub logs: Vec<BatchLogResponse>,
}

#[derive(Debug, Serialize)]
pub struct StatsByStatus {
    pub status: BatchStatus,
    pub count: i64,
    pub total_value: String,
}

#[derive(Debug, Serialize)]
pub struct StatsByActionType {
    pub action_type: ActionType,
    pub count: i64,
    pub total_value: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub by_batch_status: Vec<StatsByStatus>,
    pub by_action_type: Vec<StatsByActionType>,
    pub unique_suppliers: i64,
}

impl From<crate::store::BatchStats> for StatsResponse {
    fn from(s: crate::store::BatchStats) -> Self {
        Self {
            by_batch_status: s
                .by_batch_status
                .into_iter()
                .map(|(status, count, value)| StatsByStatus {
                    status,
                    count,
                    total_value: value.to_string(),
                })
                .collect(),
            by_action_type: s
                .by_action_type
                .into_iter()
                .map(|(action_type, count, value)| StatsByActionType {
                    action_type,
                    count,
                    total_value: value.to_string(),
                })
                .collect(),
            unique_suppliers: s.unique_suppliers,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TriggerCallRequest {
    #[serde(rename = "phoneOverride")]
    pub phone_override: Option<String>,
    #[serde(rename = "emailOverride")]
    pub email_override: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TriggerCallResponse {
    pub run_id: String,
    pub external_url: String,
}

#[derive(Debug, Serialize)]
pub struct UploadAcceptedResponse {
    pub job_id: Uuid,
}
