use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::purchase_order::BatchId;

pub type AgentRunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Active,
    Completed,
    Failed,
}

/// One row per call attempt on a batch. Created on a successful trigger
/// (§4.6 step 8); updated with `ended_at`/`duration` on `call_complete`
/// (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: AgentRunId,
    pub batch_id: BatchId,
    pub external_id: String,
    pub status: AgentRunStatus,
    pub outcome: Option<String>,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}
