use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::money::Money;
use super::purchase_order::{ActionType, BatchId};
use super::supplier::SupplierId;

/// Lifecycle status of a supplier batch.
///
/// Transitions: QUEUED -> IN_PROGRESS -> (COMPLETED | PARTIAL | FAILED).
/// A callback moves IN_PROGRESS back to QUEUED with `scheduled_for` set.
/// Terminal statuses (COMPLETED, PARTIAL, FAILED) stay terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Partial,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Partial)
    }
}

/// A unit of work: one supplier's bundle of POs to resolve in a single call.
///
/// Invariant: `1 <= po_count <= MaxPOsPerBatch` and
/// `total_value == sum(linked PO.calculated_total_value)`, maintained by the
/// Batch Builder at creation time and never recomputed ad hoc afterwards
/// (each PO-level completion event only narrows the set of POs still open,
/// it never changes `total_value`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierBatch {
    pub id: BatchId,
    pub supplier_id: SupplierId,
    pub status: BatchStatus,
    pub action_types: BTreeSet<ActionType>,
    pub total_value: Money,
    pub po_count: usize,
    pub priority: rust_decimal::Decimal,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub last_outcome: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SupplierBatch {
    /// Score used for the primary-queue ordering: `-total_value`, so a
    /// pop-min on the queue yields the highest-value batch first.
    pub fn priority_score(&self) -> rust_decimal::Decimal {
        self.total_value.negated()
    }
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Queued => "QUEUED",
            BatchStatus::InProgress => "IN_PROGRESS",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Partial => "PARTIAL",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
