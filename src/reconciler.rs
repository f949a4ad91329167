//! The Webhook Reconciler: accepts agent-provider events over HTTP and
//! advances PO/batch state machines (§4.7). Authentication (the `x-api-key`
//! shared-secret check) lives in the HTTP layer; this module is the
//! idempotent state-machine core so it can be unit tested without a router.
//!
//! Idempotence is achieved the way the spec requires: every status
//! transition is a conditional update (`update_po_status_if`,
//! `complete_batch`, ...) that no-ops instead of erroring when the entity
//! has already moved past the expected state, so replaying a webhook
//! delivery never double-applies or reverts a transition.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::Result;
use crate::events::{EventBus, PipelineEventKind};
use crate::model::{ActionType, BatchLogType, BatchStatus, ConflictType, EntityType, LogLevel, PoStatus};
use crate::queue::QueueStore;
use crate::store::Store;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum WebhookEvent {
    Log(LogEvent),
    PoResolved(PoResolvedEvent),
    CallbackRequested(CallbackRequestedEvent),
    Escalation(EscalationEvent),
    CallComplete(CallCompleteEvent),
}

impl WebhookEvent {
    pub fn batch_id(&self) -> Uuid {
        match self {
            WebhookEvent::Log(e) => e.batch_id,
            WebhookEvent::PoResolved(e) => e.batch_id,
            WebhookEvent::CallbackRequested(e) => e.batch_id,
            WebhookEvent::Escalation(e) => e.batch_id,
            WebhookEvent::CallComplete(e) => e.batch_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogEvent {
    pub batch_id: Uuid,
    pub run_id: Option<String>,
    pub message: String,
    pub level: Option<String>,
    pub source: Option<String>,
    pub po_id: Option<Uuid>,
    pub po_outcome: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoResolvedEvent {
    pub batch_id: Uuid,
    pub run_id: Option<String>,
    pub po_id: Uuid,
    pub po_number: String,
    pub po_line: Option<String>,
    pub outcome: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackRequestedEvent {
    pub batch_id: Uuid,
    pub run_id: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EscalationEvent {
    pub batch_id: Uuid,
    pub run_id: Option<String>,
    pub po_id: Option<Uuid>,
    pub reason: String,
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallCompleteEvent {
    pub batch_id: Uuid,
    pub run_id: String,
    pub outcome: String,
    pub summary: Option<String>,
    pub duration_seconds: Option<i64>,
    pub resolved_count: Option<i64>,
    pub failed_count: Option<i64>,
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    queue: Arc<dyn QueueStore>,
    events: EventBus,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn QueueStore>, events: EventBus) -> Self {
        Self { store, queue, events }
    }

    #[tracing::instrument(skip(self, event), fields(batch_id = %event.batch_id()))]
    pub async fn handle(&self, event: WebhookEvent) -> Result<()> {
        match event {
            WebhookEvent::Log(e) => self.handle_log(e).await,
            WebhookEvent::PoResolved(e) => self.handle_po_resolved(e).await,
            WebhookEvent::CallbackRequested(e) => self.handle_callback_requested(e).await,
            WebhookEvent::Escalation(e) => self.handle_escalation(e).await,
            WebhookEvent::CallComplete(e) => self.handle_call_complete(e).await,
        }
    }

    async fn handle_log(&self, event: LogEvent) -> Result<()> {
        let level = parse_level(event.level.as_deref());
        let log = self
            .store
            .append_batch_log(
                event.batch_id,
                BatchLogType::Log,
                level,
                &event.message,
                json!({"runId": event.run_id, "source": event.source, "poId": event.po_id}),
            )
            .await?;
        self.events.publish_batch(event.batch_id, log);

        if let (Some(po_id), Some(outcome)) = (event.po_id, event.po_outcome.as_deref()) {
            self.resolve_po(event.batch_id, po_id, outcome, None).await?;
        }
        Ok(())
    }

    async fn handle_po_resolved(&self, event: PoResolvedEvent) -> Result<()> {
        let prior = self.store.get_purchase_order(event.po_id).await?;
        self.store
            .append_activity_log(
                EntityType::Po,
                event.po_id,
                "po_resolved",
                json!({
                    "outcome": event.outcome,
                    "reason": event.reason,
                    "priorDueDate": prior.due_date,
                    "poNumber": event.po_number,
                    "poLine": event.po_line,
                }),
            )
            .await?;
        self.resolve_po(event.batch_id, event.po_id, &event.outcome, event.reason.as_deref()).await
    }

    /// Shared PO-resolution + batch-completion-check logic used by both
    /// `log` (when it carries a `po_id`/`po_outcome`) and `po_resolved`.
    async fn resolve_po(&self, batch_id: Uuid, po_id: Uuid, outcome: &str, _reason: Option<&str>) -> Result<()> {
        let po = self.store.get_purchase_order(po_id).await?;
        let changed = match outcome {
            "success" => {
                let copy_into_due = matches!(po.action_type, ActionType::Expedite | ActionType::PushOut);
                self.store.complete_purchase_order(po_id, copy_into_due).await?
            }
            "rejected" => self.store.fail_purchase_order(po_id).await?,
            other => {
                tracing::warn!(outcome = other, "unrecognized po_outcome, ignoring");
                false
            }
        };

        if changed {
            let log = self
                .store
                .append_batch_log(
                    batch_id,
                    BatchLogType::PoUpdate,
                    LogLevel::Info,
                    &format!("PO {po_id} resolved: {outcome}"),
                    json!({"poId": po_id, "outcome": outcome}),
                )
                .await?;
            self.events.publish_batch(batch_id, log);
        }

        if self.store.batch_has_no_active_pos(batch_id).await? {
            if self.store.complete_batch(batch_id, BatchStatus::Completed, "success").await? {
                self.queue.complete(batch_id).await?;
                if let Ok(batch) = self.store.get_batch(batch_id).await {
                    self.queue.release_supplier(batch.supplier_id).await?;
                }
                self.events.publish_pipeline(
                    PipelineEventKind::BatchCompleted,
                    batch_id,
                    json!({"outcome": "success"}),
                );
            }
        }
        Ok(())
    }

    async fn handle_callback_requested(&self, event: CallbackRequestedEvent) -> Result<()> {
        if !self.store.schedule_batch_callback(event.batch_id, event.scheduled_for).await? {
            tracing::debug!("callback_requested no-op: batch not in_progress");
            return Ok(());
        }
        self.queue.schedule_callback(event.batch_id, event.scheduled_for).await?;
        self.queue.complete(event.batch_id).await?;
        if let Ok(batch) = self.store.get_batch(event.batch_id).await {
            self.queue.release_supplier(batch.supplier_id).await?;
        }
        let log = self
            .store
            .append_batch_log(
                event.batch_id,
                BatchLogType::StatusChange,
                LogLevel::Info,
                "callback requested",
                json!({"scheduledFor": event.scheduled_for, "reason": event.reason}),
            )
            .await?;
        self.events.publish_batch(event.batch_id, log);
        self.events.publish_pipeline(
            PipelineEventKind::BatchCallbackScheduled,
            event.batch_id,
            json!({"scheduledFor": event.scheduled_for, "reason": event.reason}),
        );
        Ok(())
    }

    async fn handle_escalation(&self, event: EscalationEvent) -> Result<()> {
        if let Some(po_id) = event.po_id {
            self.store
                .create_conflict(
                    po_id,
                    ConflictType::ValueChanged,
                    json!({"reason": event.reason, "priority": event.priority, "kind": "escalation"}),
                )
                .await?;
        }
        self.store
            .append_activity_log(
                EntityType::Batch,
                event.batch_id,
                "escalation",
                json!({"reason": event.reason, "priority": event.priority, "poId": event.po_id}),
            )
            .await?;
        let log = self
            .store
            .append_batch_log(
                event.batch_id,
                BatchLogType::Log,
                LogLevel::Warn,
                &event.reason,
                json!({"priority": event.priority, "poId": event.po_id}),
            )
            .await?;
        self.events.publish_batch(event.batch_id, log);
        Ok(())
    }

    async fn handle_call_complete(&self, event: CallCompleteEvent) -> Result<()> {
        let duration_ms = event.duration_seconds.map(|s| s * 1000);
        self.store.end_agent_run(event.batch_id, &event.outcome, duration_ms).await?;

        let is_callback = event.outcome == "callback";
        let new_status = match event.outcome.as_str() {
            "success" => BatchStatus::Completed,
            "partial" => BatchStatus::Partial,
            "failed" => BatchStatus::Failed,
            "callback" => BatchStatus::Queued,
            other => {
                tracing::warn!(outcome = other, "unrecognized call_complete outcome, treating as failed");
                BatchStatus::Failed
            }
        };

        let applied = if is_callback {
            self.store.update_batch_status_if(event.batch_id, BatchStatus::InProgress, BatchStatus::Queued).await?
        } else {
            self.store.complete_batch(event.batch_id, new_status, &event.outcome).await?
        };

        if applied {
            self.queue.complete(event.batch_id).await?;
            if let Ok(batch) = self.store.get_batch(event.batch_id).await {
                self.queue.release_supplier(batch.supplier_id).await?;
            }
            let kind = if is_callback {
                PipelineEventKind::BatchCallbackScheduled
            } else {
                PipelineEventKind::BatchCompleted
            };
            self.events.publish_pipeline(
                kind,
                event.batch_id,
                json!({
                    "outcome": event.outcome,
                    "summary": event.summary,
                    "resolvedCount": event.resolved_count,
                    "failedCount": event.failed_count,
                }),
            );
            let log = self
                .store
                .append_batch_log(
                    event.batch_id,
                    BatchLogType::StatusChange,
                    LogLevel::Info,
                    "call complete",
                    json!({"outcome": event.outcome, "summary": event.summary}),
                )
                .await?;
            self.events.publish_batch(event.batch_id, log);
        }

        Ok(())
    }
}

fn parse_level(level: Option<&str>) -> LogLevel {
    match level {
        Some("debug") => LogLevel::Debug,
        Some("warn") | Some("warning") => LogLevel::Warn,
        Some("error") => LogLevel::Error,
        Some("success") => LogLevel::Success,
        _ => LogLevel::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::in_memory::InMemoryQueueStore;
    use crate::store::in_memory::InMemoryStore;
    use crate::store::{BatchFilter, ProposedBatch, SortOrder};
    use rust_decimal_macros::dec;

    async fn seeded_in_progress_batch() -> (Reconciler, Arc<dyn Store>, Arc<dyn QueueStore>, Uuid, Uuid) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
        let events = EventBus::new();

        let supplier = store.upsert_supplier("S1", "Acme").await.unwrap();
        let rows = vec![crate::store::PoUpsert {
            po_number: "PO1".into(),
            po_line: "1".into(),
            supplier_number: "S1".into(),
            supplier_name: "Acme".into(),
            action_type: ActionType::PushOut,
            due_date: chrono::NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            recommended_date: Some(chrono::NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()),
            calculated_total_value: crate::model::Money::new(dec!(100.00)),
        }];
        let outcomes = store.upsert_purchase_orders(rows).await.unwrap();
        let po_id = outcomes[0].po().id;

        let batch = store
            .create_batch_linking_pos(ProposedBatch {
                supplier_id: supplier.id,
                po_ids: vec![po_id],
                action_types: [ActionType::PushOut].into_iter().collect(),
                total_value: crate::model::Money::new(dec!(100.00)),
            })
            .await
            .unwrap()
            .unwrap();

        queue.claim_supplier(supplier.id).await.unwrap();
        store.start_dispatch(batch.id).await.unwrap();

        let reconciler = Reconciler::new(store.clone(), queue.clone(), events);
        (reconciler, store, queue, batch.id, po_id)
    }

    #[tokio::test]
    async fn po_resolved_success_completes_batch_and_releases_supplier() {
        let (reconciler, store, queue, batch_id, po_id) = seeded_in_progress_batch().await;

        reconciler
            .handle(WebhookEvent::PoResolved(PoResolvedEvent {
                batch_id,
                run_id: None,
                po_id,
                po_number: "PO1".into(),
                po_line: Some("1".into()),
                outcome: "success".into(),
                reason: None,
            }))
            .await
            .unwrap();

        let po = store.get_purchase_order(po_id).await.unwrap();
        assert_eq!(po.status, PoStatus::Completed);
        assert_eq!(po.due_date, chrono::NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());

        let batch = store.get_batch(batch_id).await.unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);

        let page = store.list_batches(BatchFilter::default(), crate::store::BatchSort::CreatedAt, SortOrder::Asc, 1, 10).await.unwrap();
        assert_eq!(page.items[0].status, BatchStatus::Completed);

        assert!(queue.claim_supplier(po.supplier_id).await.unwrap());
    }

    #[tokio::test]
    async fn replaying_po_resolved_after_completion_is_a_no_op() {
        let (reconciler, store, _queue, batch_id, po_id) = seeded_in_progress_batch().await;

        let event = || {
            WebhookEvent::PoResolved(PoResolvedEvent {
                batch_id,
                run_id: None,
                po_id,
                po_number: "PO1".into(),
                po_line: Some("1".into()),
                outcome: "success".into(),
                reason: None,
            })
        };

        reconciler.handle(event()).await.unwrap();
        let batch_after_first = store.get_batch(batch_id).await.unwrap();

        reconciler.handle(event()).await.unwrap();
        let batch_after_second = store.get_batch(batch_id).await.unwrap();

        assert_eq!(batch_after_first.completed_at, batch_after_second.completed_at);
        assert_eq!(batch_after_second.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn callback_requested_returns_batch_to_queued_and_schedules_callback() {
        let (reconciler, store, queue, batch_id, _po_id) = seeded_in_progress_batch().await;
        let scheduled_for = Utc::now() + chrono::Duration::minutes(10);

        reconciler
            .handle(WebhookEvent::CallbackRequested(CallbackRequestedEvent {
                batch_id,
                run_id: None,
                scheduled_for,
                reason: Some("voicemail".into()),
            }))
            .await
            .unwrap();

        let batch = store.get_batch(batch_id).await.unwrap();
        assert_eq!(batch.status, BatchStatus::Queued);
        assert_eq!(batch.scheduled_for, Some(scheduled_for));
        assert_eq!(batch.attempt_count, 1);

        assert!(queue.claim_supplier(batch.supplier_id).await.unwrap());
    }
}
