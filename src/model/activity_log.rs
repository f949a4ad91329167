use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ActivityLogId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Batch,
    Po,
}

/// Cross-entity audit record, independent of `BatchLog` (which is
/// batch-scoped only). Written for conflicts, escalations, and PO due-date
/// rewrites so the full history survives batch deletion/retention policy
/// changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLog {
    pub id: ActivityLogId,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub action: String,
    pub user_id: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
