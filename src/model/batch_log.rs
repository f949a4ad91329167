use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::purchase_order::BatchId;

pub type BatchLogId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchLogType {
    Log,
    PoUpdate,
    StatusChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Success,
}

/// Append-only activity entry scoped to a batch. Persisted for the batch
/// lifetime plus retention, and mirrored to the batch's live event channel
/// as it's written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchLog {
    pub id: BatchLogId,
    pub batch_id: BatchId,
    pub log_type: BatchLogType,
    pub level: LogLevel,
    pub message: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
