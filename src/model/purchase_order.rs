use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::money::Money;
use super::supplier::SupplierId;

pub type PurchaseOrderId = Uuid;
pub type BatchId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Cancel,
    Expedite,
    PushOut,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Cancel => "CANCEL",
            ActionType::Expedite => "EXPEDITE",
            ActionType::PushOut => "PUSH_OUT",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a single PO line.
///
/// Transitions: PENDING -> QUEUED -> IN_PROGRESS -> (COMPLETED | FAILED).
/// A re-upload moves any status back to QUEUED (with `batch_id` cleared).
/// Terminal states (COMPLETED, FAILED) stay terminal absent an explicit
/// operator reset, which this engine does not expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Failed,
    Conflict,
}

impl PoStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PoStatus::Completed | PoStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, PoStatus::Queued | PoStatus::InProgress)
    }
}

/// A single purchase-order line awaiting resolution.
///
/// Invariant: `batch_id.is_some()` implies the linked batch's `supplier_id`
/// equals `self.supplier_id` — enforced at the storage layer by the atomic
/// link query, never by application-side trust.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub id: PurchaseOrderId,
    /// `(po_number, po_line)` composed into a string unique across reloads.
    pub external_id: String,
    pub po_number: String,
    pub po_line: String,
    pub supplier_id: SupplierId,
    pub action_type: ActionType,
    pub status: PoStatus,
    pub due_date: NaiveDate,
    /// The due date as originally recorded, preserved when a completion
    /// event overwrites `due_date` with the recommended date (see §4.7).
    pub original_due_date: Option<NaiveDate>,
    pub recommended_date: Option<NaiveDate>,
    pub calculated_total_value: Money,
    pub batch_id: Option<BatchId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PurchaseOrder {
    pub fn make_external_id(po_number: &str, po_line: &str) -> String {
        format!("{po_number}-{po_line}")
    }
}
