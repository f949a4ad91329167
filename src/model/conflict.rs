use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::purchase_order::PurchaseOrderId;

pub type ConflictId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    DueDateChanged,
    RecommendedDateChanged,
    ValueChanged,
}

/// Advisory record noting that a re-uploaded PO had materially different
/// field values than the stored copy. The new values always win; this row
/// exists purely for audit, not to block the re-upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub purchase_order_id: PurchaseOrderId,
    pub conflict_type: ConflictType,
    pub conflict_details: serde_json::Value,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
}
