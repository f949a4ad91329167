use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UploadJobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadJobStatus {
    Pending,
    Processing,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    Parsing,
    Suppliers,
    Pos,
    Batches,
    Queuing,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadProgress {
    pub stage: UploadStage,
    pub current: usize,
    pub total: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadSummary {
    pub rows_parsed: usize,
    pub rows_skipped: usize,
    pub pos_created: usize,
    pub pos_updated: usize,
    pub conflicts: usize,
    pub batches_created: usize,
    pub batches_abandoned: usize,
}

/// Ephemeral record (TTL ≤ 1h) tracking a background upload-processing job.
/// Not persisted in the Durable Store proper — kept in a short-lived table
/// or in-memory registry that the Upload Job Coordinator expires on a timer
/// regardless of whether the job finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadJob {
    pub id: UploadJobId,
    pub status: UploadJobStatus,
    pub progress: UploadProgress,
    pub result: Option<UploadSummary>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadJob {
    pub fn new(ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: UploadJobStatus::Pending,
            progress: UploadProgress {
                stage: UploadStage::Parsing,
                current: 0,
                total: 0,
                message: "waiting to start".to_string(),
            },
            result: None,
            error: None,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
