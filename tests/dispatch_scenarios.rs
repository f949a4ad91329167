//! Cross-module integration tests for the six concrete scenarios in the
//! system design's testable-properties section: basic dispatch, supplier
//! contention, completion via per-PO events, callback scheduling,
//! trigger-failure rollback, and re-upload conflict.
//!
//! Each test wires the real `Dispatcher`/`Reconciler` against the in-memory
//! `Store`/`QueueStore` and a `MockAgentProvider`, the same substitution the
//! unit tests beside `reconciler.rs` use, just exercised end to end through
//! the public API instead of the internal handler functions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::StreamExt;
use rust_decimal_macros::dec;
use uuid::Uuid;

use dispatch_engine::agent_provider::{AgentProviderClient, DispatchOutcome, DispatchRequest, MockAgentProvider};
use dispatch_engine::dispatcher::{Dispatcher, DispatcherConfig};
use dispatch_engine::error::Result as EngineResult;
use dispatch_engine::events::EventBus;
use dispatch_engine::model::{ActionType, BatchStatus, ConflictType, Money, PoStatus};
use dispatch_engine::queue::in_memory::InMemoryQueueStore;
use dispatch_engine::queue::QueueStore;
use dispatch_engine::reconciler::{
    CallCompleteEvent, CallbackRequestedEvent, PoResolvedEvent, Reconciler, WebhookEvent,
};
use dispatch_engine::store::in_memory::InMemoryStore;
use dispatch_engine::store::{PoUpsert, PoUpsertOutcome, ProposedBatch, Store};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const SETTLE: Duration = Duration::from_millis(150);

/// Wraps `MockAgentProvider` with an artificial delay so a test can assert
/// on state while a dispatch is still in flight and holding its supplier
/// claim, instead of racing two freshly spawned dispatch tasks against
/// each other.
struct DelayedProvider {
    inner: MockAgentProvider,
    delay: Duration,
}

#[async_trait]
impl AgentProviderClient for DelayedProvider {
    async fn dispatch(&self, request: DispatchRequest, timeout: Duration) -> EngineResult<DispatchOutcome> {
        tokio::time::sleep(self.delay).await;
        self.inner.dispatch(request, timeout).await
    }
}

fn test_dispatcher(
    store: Arc<dyn Store>,
    queue: Arc<dyn QueueStore>,
    events: EventBus,
    provider: Arc<dyn AgentProviderClient>,
) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        store,
        queue,
        events,
        Some(provider),
        DispatcherConfig {
            max_concurrent_calls: 5,
            call_timeout: Duration::from_secs(5),
            callback_base_url: "http://engine.test".to_string(),
        },
    ))
}

async fn seed_batch(store: &Arc<dyn Store>, supplier_number: &str, values: &[rust_decimal::Decimal]) -> (Uuid, Uuid) {
    let supplier = store.upsert_supplier(supplier_number, &format!("Supplier {supplier_number}")).await.unwrap();
    let due = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
    let rows: Vec<PoUpsert> = values
        .iter()
        .enumerate()
        .map(|(i, value)| PoUpsert {
            po_number: format!("{supplier_number}-{i}"),
            po_line: "1".to_string(),
            supplier_number: supplier_number.to_string(),
            supplier_name: format!("Supplier {supplier_number}"),
            action_type: ActionType::PushOut,
            due_date: due,
            recommended_date: Some(due + chrono::Duration::days(14)),
            calculated_total_value: Money::new(*value),
        })
        .collect();
    let outcomes = store.upsert_purchase_orders(rows).await.unwrap();
    let po_ids: Vec<_> = outcomes.iter().map(|o| o.po().id).collect();
    let total_value: Money = values.iter().copied().map(Money::new).fold(Money::new(dec!(0.00)), |a, b| a + b);

    let batch = store
        .create_batch_linking_pos(ProposedBatch {
            supplier_id: supplier.id,
            po_ids,
            action_types: [ActionType::PushOut].into_iter().collect(),
            total_value,
        })
        .await
        .unwrap()
        .unwrap();
    (batch.id, supplier.id)
}

#[tokio::test]
async fn basic_dispatch_moves_batch_and_pos_to_in_progress() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let queue: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
    let events = EventBus::new();
    let provider = Arc::new(MockAgentProvider::new());

    let (batch_id, supplier_id) =
        seed_batch(&store, "S1", &[dec!(10000.00), dec!(5000.00), dec!(2000.00)]).await;
    provider.queue_response(
        batch_id,
        DispatchOutcome::Success {
            run_id: "R1".to_string(),
            external_url: "http://x".to_string(),
        },
    );

    let mut pipeline = Box::pin(events.subscribe_pipeline());

    queue.enqueue(batch_id, store.get_batch(batch_id).await.unwrap().priority_score()).await.unwrap();

    let dispatcher = test_dispatcher(store.clone(), queue.clone(), events.clone(), provider.clone());
    let task = tokio::spawn(dispatcher.run(POLL_INTERVAL));
    tokio::time::sleep(SETTLE).await;
    task.abort();

    let batch = store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::InProgress);

    let pos = store.get_batch_purchase_orders(batch_id).await.unwrap();
    assert_eq!(pos.len(), 3);
    assert!(pos.iter().all(|po| po.status == PoStatus::InProgress));

    let runs = store.list_agent_runs(batch_id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].external_id, "R1");

    assert!(!queue.claim_supplier(supplier_id).await.unwrap(), "supplier should still be claimed");

    let calls = provider.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].batch_id, batch_id);

    let first_event = tokio::time::timeout(Duration::from_secs(1), pipeline.next())
        .await
        .expect("a pipeline event should have been published")
        .expect("stream should not be closed");
    assert_eq!(first_event.batch_id, batch_id);
}

#[tokio::test]
async fn supplier_contention_requeues_the_lower_value_batch() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let queue: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
    let events = EventBus::new();
    let inner = MockAgentProvider::new();

    let (batch_high, supplier_id) = seed_batch(&store, "S1", &[dec!(20000.00)]).await;
    let rows = vec![PoUpsert {
        po_number: "S1-second".to_string(),
        po_line: "1".to_string(),
        supplier_number: "S1".to_string(),
        supplier_name: "Supplier S1".to_string(),
        action_type: ActionType::PushOut,
        due_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        recommended_date: None,
        calculated_total_value: Money::new(dec!(15000.00)),
    }];
    let outcomes = store.upsert_purchase_orders(rows).await.unwrap();
    let batch_low = store
        .create_batch_linking_pos(ProposedBatch {
            supplier_id,
            po_ids: vec![outcomes[0].po().id],
            action_types: [ActionType::PushOut].into_iter().collect(),
            total_value: Money::new(dec!(15000.00)),
        })
        .await
        .unwrap()
        .unwrap()
        .id;

    inner.queue_response(
        batch_high,
        DispatchOutcome::Success { run_id: "R1".into(), external_url: "http://x".into() },
    );
    // `batch_high`'s trigger is held open for 300ms so `batch_low`'s claim
    // attempt deterministically lands while the supplier is still locked,
    // instead of racing two freshly spawned dispatch tasks against each other.
    let provider: Arc<dyn AgentProviderClient> = Arc::new(DelayedProvider { inner, delay: Duration::from_millis(300) });

    queue.enqueue(batch_high, store.get_batch(batch_high).await.unwrap().priority_score()).await.unwrap();
    queue.enqueue(batch_low, store.get_batch(batch_low).await.unwrap().priority_score()).await.unwrap();

    let dispatcher = test_dispatcher(store.clone(), queue.clone(), events.clone(), provider);
    let task = tokio::spawn(dispatcher.run(POLL_INTERVAL));
    tokio::time::sleep(Duration::from_millis(120)).await;

    let low = store.get_batch(batch_low).await.unwrap();
    assert_eq!(low.status, BatchStatus::Queued, "lower-value batch must stay queued while the supplier is locked");

    let due = queue.due_callbacks(chrono::Utc::now(), 10).await.unwrap();
    assert!(due.is_empty(), "the requeue isn't due yet at +30s");
    let due_later = queue
        .due_callbacks(chrono::Utc::now() + chrono::Duration::seconds(31), 10)
        .await
        .unwrap();
    assert!(due_later.iter().any(|e| e.batch_id == batch_low));

    tokio::time::sleep(Duration::from_millis(300)).await;
    task.abort();

    let high = store.get_batch(batch_high).await.unwrap();
    assert_eq!(high.status, BatchStatus::InProgress);
}

#[tokio::test]
async fn completion_via_per_po_events_is_idempotent_on_replay() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let queue: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
    let events = EventBus::new();

    let (batch_id, supplier_id) = seed_batch(&store, "S1", &[dec!(1000.00), dec!(2000.00)]).await;
    let pos = store.get_batch_purchase_orders(batch_id).await.unwrap();
    let (p1, p2) = (pos[0].id, pos[1].id);

    queue.claim_supplier(supplier_id).await.unwrap();
    store.start_dispatch(batch_id).await.unwrap();

    let reconciler = Reconciler::new(store.clone(), queue.clone(), events.clone());

    let resolved = |po_id: Uuid, po_number: &str| {
        WebhookEvent::PoResolved(PoResolvedEvent {
            batch_id,
            run_id: None,
            po_id,
            po_number: po_number.to_string(),
            po_line: Some("1".into()),
            outcome: "success".into(),
            reason: None,
        })
    };

    reconciler.handle(resolved(p1, "S1-0")).await.unwrap();
    let batch_after_p1 = store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch_after_p1.status, BatchStatus::InProgress, "one PO outstanding, batch stays open");

    reconciler.handle(resolved(p2, "S1-1")).await.unwrap();
    let batch_after_p2 = store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch_after_p2.status, BatchStatus::Completed);
    assert!(queue.claim_supplier(supplier_id).await.unwrap(), "supplier must be released on completion");
    queue.release_supplier(supplier_id).await.unwrap();

    // Re-deliver the first event: no further state change.
    reconciler.handle(resolved(p1, "S1-0")).await.unwrap();
    let batch_after_replay = store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch_after_replay.completed_at, batch_after_p2.completed_at);
}

#[tokio::test]
async fn callback_requested_returns_batch_to_queued_with_incremented_attempt() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let queue: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
    let events = EventBus::new();

    let (batch_id, supplier_id) = seed_batch(&store, "S1", &[dec!(500.00)]).await;
    queue.claim_supplier(supplier_id).await.unwrap();
    store.start_dispatch(batch_id).await.unwrap();

    let reconciler = Reconciler::new(store.clone(), queue.clone(), events.clone());
    let scheduled_for = chrono::Utc::now() + chrono::Duration::minutes(10);
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

    let due = queue
        .due_callbacks(scheduled_for + chrono::Duration::seconds(1), 10)
        .await
        .unwrap();
    assert!(due.iter().any(|e| e.batch_id == batch_id));
    assert!(queue.claim_supplier(supplier_id).await.unwrap(), "supplier must be released on callback");
}

#[tokio::test]
async fn trigger_failure_rolls_back_without_consuming_an_attempt() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let queue: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
    let events = EventBus::new();
    let provider = Arc::new(MockAgentProvider::new());

    let (batch_id, supplier_id) = seed_batch(&store, "S1", &[dec!(100.00)]).await;
    provider.queue_response(batch_id, DispatchOutcome::Error { error: "503".to_string() });
    queue.enqueue(batch_id, store.get_batch(batch_id).await.unwrap().priority_score()).await.unwrap();

    let dispatcher = test_dispatcher(store.clone(), queue.clone(), events.clone(), provider.clone());
    let task = tokio::spawn(dispatcher.run(POLL_INTERVAL));
    tokio::time::sleep(SETTLE).await;
    task.abort();

    let batch = store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Queued);
    assert_eq!(batch.attempt_count, 0, "a failed trigger does not consume an attempt");

    let pos = store.get_batch_purchase_orders(batch_id).await.unwrap();
    assert!(pos.iter().all(|po| po.status == PoStatus::Queued));

    assert_eq!(store.list_agent_runs(batch_id).await.unwrap().len(), 0);
    assert!(queue.claim_supplier(supplier_id).await.unwrap(), "supplier must be released after rollback");
}

#[tokio::test]
async fn call_complete_failed_outcome_completes_batch_as_failed() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let queue: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
    let events = EventBus::new();

    let (batch_id, supplier_id) = seed_batch(&store, "S1", &[dec!(100.00)]).await;
    queue.claim_supplier(supplier_id).await.unwrap();
    store.start_dispatch(batch_id).await.unwrap();
    store.create_agent_run(batch_id, "R1", 1).await.unwrap();

    let reconciler = Reconciler::new(store.clone(), queue.clone(), events.clone());
    reconciler
        .handle(WebhookEvent::CallComplete(CallCompleteEvent {
            batch_id,
            run_id: "R1".to_string(),
            outcome: "failed".to_string(),
            summary: Some("no answer after max attempts".into()),
            duration_seconds: Some(42),
            resolved_count: Some(0),
            failed_count: Some(1),
        }))
        .await
        .unwrap();

    let batch = store.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert!(queue.claim_supplier(supplier_id).await.unwrap());
}

#[tokio::test]
async fn reuploading_identical_spreadsheet_records_no_conflicts() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let due = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
    let row = |value| PoUpsert {
        po_number: "100".to_string(),
        po_line: "1".to_string(),
        supplier_number: "S1".to_string(),
        supplier_name: "Supplier S1".to_string(),
        action_type: ActionType::PushOut,
        due_date: due,
        recommended_date: None,
        calculated_total_value: Money::new(value),
    };

    store.upsert_purchase_orders(vec![row(dec!(500.00))]).await.unwrap();
    let outcomes = store.upsert_purchase_orders(vec![row(dec!(500.00))]).await.unwrap();

    match &outcomes[0] {
        PoUpsertOutcome::Updated { conflict, .. } => {
            assert!(conflict.is_none(), "identical re-upload must not record a conflict");
        }
        PoUpsertOutcome::Inserted(_) => panic!("expected an update on re-upload"),
    }
}

#[tokio::test]
async fn reupload_with_changed_due_date_records_exactly_one_conflict() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let row = |due: NaiveDate| PoUpsert {
        po_number: "100".to_string(),
        po_line: "1".to_string(),
        supplier_number: "S1".to_string(),
        supplier_name: "Supplier S1".to_string(),
        action_type: ActionType::PushOut,
        due_date: due,
        recommended_date: None,
        calculated_total_value: Money::new(dec!(500.00)),
    };

    store.upsert_purchase_orders(vec![row(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap())]).await.unwrap();
    let outcomes = store
        .upsert_purchase_orders(vec![row(NaiveDate::from_ymd_opt(2025, 1, 20).unwrap())])
        .await
        .unwrap();

    match &outcomes[0] {
        PoUpsertOutcome::Updated { po, conflict } => {
            assert!(po.batch_id.is_none());
            assert_eq!(po.due_date, NaiveDate::from_ymd_opt(2025, 1, 20).unwrap());
            let conflict = conflict.as_ref().expect("a due-date change must record a conflict");
            assert_eq!(conflict.conflict_type, ConflictType::DueDateChanged);
        }
        PoUpsertOutcome::Inserted(_) => panic!("expected an update on re-upload"),
    }
}
