//! The Upload Job Coordinator: parses and classifies a spreadsheet
//! synchronously, then runs the Batch Builder in the background, publishing
//! stage progress over the Event Bus (§4.9).
//!
//! `submit` does the fast synchronous half (parse + classify) and returns a
//! job id immediately; everything from supplier/PO upsert onward runs on a
//! spawned task so a slow upload doesn't hold the HTTP request open.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde_json::json;

use crate::batch_builder::propose_batches;
use crate::classifier::{self, ClassifierInput};
use crate::error::Result;
use crate::events::{EventBus, PipelineEventKind};
use crate::model::{BatchLogType, LogLevel, UploadJob, UploadJobId, UploadJobStatus, UploadProgress, UploadStage, UploadSummary};
use crate::queue::QueueStore;
use crate::spreadsheet::{self, WorklistRow};
use crate::store::{PoUpsert, PoUpsertOutcome, Store};

const UPLOAD_JOB_TTL_HOURS: i64 = 1;

#[derive(Clone)]
pub struct UploadJobCoordinator {
    store: Arc<dyn Store>,
    queue: Arc<dyn QueueStore>,
    events: EventBus,
    max_pos_per_batch: usize,
    batch_chunk_size: usize,
    jobs: Arc<RwLock<HashMap<UploadJobId, UploadJob>>>,
}

impl UploadJobCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn QueueStore>,
        events: EventBus,
        max_pos_per_batch: usize,
        batch_chunk_size: usize,
    ) -> Self {
        Self {
            store,
            queue,
            events,
            max_pos_per_batch,
            batch_chunk_size: batch_chunk_size.max(1),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Parse + classify synchronously, then hand the rest off to a
    /// background task. Returns the job id the caller hands back to the
    /// uploader for progress polling/streaming.
    pub async fn submit(&self, file_bytes: Vec<u8>) -> Result<UploadJobId> {
        let parsed = spreadsheet::parse_workbook(&file_bytes)?;
        let rows_parsed = parsed.rows.len();
        let rows_skipped = parsed.rows_skipped;

        let classified = classify_rows(parsed.rows);

        let mut job = UploadJob::new(chrono::Duration::hours(UPLOAD_JOB_TTL_HOURS));
        job.status = UploadJobStatus::Processing;
        job.progress = UploadProgress {
            stage: UploadStage::Parsing,
            current: rows_parsed,
            total: rows_parsed,
            message: format!("parsed {rows_parsed} rows ({rows_skipped} skipped)"),
        };
        let job_id = job.id;
        self.jobs.write().insert(job_id, job.clone());
        self.publish(job_id, &job);

        let mut summary = UploadSummary {
            rows_parsed,
            rows_skipped,
            ..Default::default()
        };

        let worker = self.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.run_background(job_id, classified, &mut summary).await {
                worker.finish_with_error(job_id, &e.to_string());
            }
        });

        Ok(job_id)
    }

    pub fn get(&self, job_id: UploadJobId) -> Option<UploadJob> {
        self.jobs.read().get(&job_id).cloned()
    }

    /// Periodic sweep dropping expired job records regardless of outcome.
    /// Intended to be called alongside the callback scheduler's own
    /// housekeeping tick.
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        self.jobs.write().retain(|_, job| !job.is_expired(now));
    }

    async fn run_background(&self, job_id: UploadJobId, rows: Vec<PoUpsert>, summary: &mut UploadSummary) -> Result<()> {
        self.advance(job_id, UploadStage::Suppliers, 0, rows.len(), "matching suppliers");

        let outcomes = self.store.upsert_purchase_orders(rows).await?;
        for outcome in &outcomes {
            match outcome {
                PoUpsertOutcome::Inserted(_) => summary.pos_created += 1,
                PoUpsertOutcome::Updated { conflict, .. } => {
                    summary.pos_updated += 1;
                    if conflict.is_some() {
                        summary.conflicts += 1;
                    }
                }
            }
        }
        self.advance(job_id, UploadStage::Pos, outcomes.len(), outcomes.len(), "purchase orders upserted");

        let unbatched: Vec<_> = outcomes.into_iter().map(|o| o.po().clone()).filter(|po| po.batch_id.is_none()).collect();
        let proposals = propose_batches(unbatched, self.max_pos_per_batch);
        let total_proposals = proposals.len();

        self.advance(job_id, UploadStage::Batches, 0, total_proposals, "creating batches");
        let mut created_batches = Vec::with_capacity(total_proposals);
        let mut linked = 0usize;
        for chunk in proposals.chunks(self.batch_chunk_size) {
            let results = stream::iter(chunk.iter().cloned())
                .map(|proposal| {
                    let store = self.store.clone();
                    async move { store.create_batch_linking_pos(proposal).await }
                })
                .buffer_unordered(chunk.len())
                .collect::<Vec<_>>()
                .await;
            for result in results {
                match result? {
                    Some(batch) => created_batches.push(batch),
                    None => summary.batches_abandoned += 1,
                }
            }
            linked += chunk.len();
            self.advance(job_id, UploadStage::Batches, linked.min(total_proposals), total_proposals, "creating batches");
        }
        summary.batches_created = created_batches.len();

        let total_created = created_batches.len();
        self.advance(job_id, UploadStage::Queuing, 0, total_created, "queuing batches");
        for (i, batch) in created_batches.into_iter().enumerate() {
            self.queue.enqueue(batch.id, batch.priority_score()).await?;
            self.events.publish_pipeline(
                PipelineEventKind::BatchQueued,
                batch.id,
                json!({"supplierId": batch.supplier_id, "totalValue": batch.total_value.to_string(), "poCount": batch.po_count}),
            );
            let log = self
                .store
                .append_batch_log(
                    batch.id,
                    BatchLogType::StatusChange,
                    LogLevel::Info,
                    "batch created and queued",
                    json!({"poCount": batch.po_count, "totalValue": batch.total_value.to_string()}),
                )
                .await?;
            self.events.publish_batch(batch.id, log);
            self.advance(job_id, UploadStage::Queuing, i + 1, total_created, "queuing batches");
        }

        self.finish_complete(job_id, summary.clone());
        Ok(())
    }

    fn advance(&self, job_id: UploadJobId, stage: UploadStage, current: usize, total: usize, message: &str) {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(&job_id) else { return };
        job.progress = UploadProgress {
            stage,
            current,
            total,
            message: message.to_string(),
        };
        let snapshot = job.clone();
        drop(jobs);
        self.publish(job_id, &snapshot);
    }

    fn finish_complete(&self, job_id: UploadJobId, summary: UploadSummary) {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(&job_id) else { return };
        job.status = UploadJobStatus::Complete;
        job.progress = UploadProgress {
            stage: UploadStage::Complete,
            current: summary.pos_created + summary.pos_updated,
            total: summary.pos_created + summary.pos_updated,
            message: "upload processed".to_string(),
        };
        job.result = Some(summary);
        let snapshot = job.clone();
        drop(jobs);
        self.publish(job_id, &snapshot);
    }

    fn finish_with_error(&self, job_id: UploadJobId, message: &str) {
        tracing::error!(job_id = %job_id, error = message, "upload job failed");
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(&job_id) else { return };
        job.status = UploadJobStatus::Error;
        job.error = Some(message.to_string());
        let snapshot = job.clone();
        drop(jobs);
        self.publish(job_id, &snapshot);
    }

    fn publish(&self, job_id: UploadJobId, job: &UploadJob) {
        self.events.publish_pipeline(
            PipelineEventKind::UploadProgress,
            job_id,
            serde_json::to_value(job).unwrap_or_else(|_| json!({})),
        );
    }
}

/// Synchronous classification step: maps each worklist row through the
/// classifier, dropping rows needing no action (`recommended == due`).
fn classify_rows(rows: Vec<WorklistRow>) -> Vec<PoUpsert> {
    rows.into_iter()
        .filter_map(|row| {
            let classification = classifier::classify(&ClassifierInput {
                due_date: row.due_date,
                recommended_date: row.recommended_date,
            })?;
            Some(PoUpsert {
                po_number: row.po_number,
                po_line: row.po_line,
                supplier_number: row.supplier_number,
                supplier_name: row.supplier_name,
                action_type: classification.action_type,
                due_date: row.due_date,
                recommended_date: row.recommended_date,
                calculated_total_value: row.calculated_total_value,
            })
        })
        .collect()
}
