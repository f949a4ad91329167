//! The Dispatcher: pops batches off the primary queue, enforces the
//! supplier-exclusivity interlock, and invokes the Agent Provider (§4.6).
//!
//! Loop structure mirrors the teacher's `Daemon`: a global concurrency
//! semaphore bounds in-flight calls, a `JoinSet` tracks spawned dispatch
//! tasks, and each tick first drains completed tasks before claiming more
//! work. The teacher shards its semaphore per model; this engine has a
//! single global `max_concurrent_calls` bound instead, since supplier
//! exclusivity (not model concurrency) is this system's admission control.
//!
//! Open Question (a) resolved: a batch whose `scheduledFor` is in the
//! future is delegated to the callback structure rather than re-scored
//! into the primary queue, so the Callback Scheduler is the single place
//! that owns moving time-gated batches back onto the primary queue.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::agent_provider::{AgentProviderClient, DispatchOutcome, DispatchRequest};
use crate::error::Result;
use crate::events::{EventBus, PipelineEventKind};
use crate::model::{BatchLogType, BatchStatus, ContactOverride, LogLevel};
use crate::queue::QueueStore;
use crate::store::Store;

const SUPPLIER_CONTENTION_REQUEUE_DELAY: Duration = Duration::from_secs(30);

pub struct DispatcherConfig {
    pub max_concurrent_calls: usize,
    pub call_timeout: Duration,
    pub callback_base_url: String,
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    queue: Arc<dyn QueueStore>,
    events: EventBus,
    provider: Option<Arc<dyn AgentProviderClient>>,
    config: DispatcherConfig,
    concurrency: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn QueueStore>,
        events: EventBus,
        provider: Option<Arc<dyn AgentProviderClient>>,
        config: DispatcherConfig,
    ) -> Self {
        let concurrency = Arc::new(Semaphore::new(config.max_concurrent_calls.max(1)));
        Self {
            store,
            queue,
            events,
            provider,
            config,
            concurrency,
        }
    }

    /// Run forever, ticking every `poll_interval`.
    pub async fn run(self: Arc<Self>, poll_interval: Duration) {
        let mut interval = tokio::time::interval(poll_interval);
        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            interval.tick().await;
            while tasks.try_join_next().is_some() {}
            if let Err(e) = self.clone().tick(&mut tasks).await {
                tracing::error!(error = %e, "dispatcher tick failed");
            }
        }
    }

    /// Drain the primary queue until it's empty or concurrency is
    /// exhausted, spawning one task per claimed batch.
    #[tracing::instrument(skip(self, tasks))]
    async fn tick(self: Arc<Self>, tasks: &mut JoinSet<()>) -> Result<()> {
        loop {
            let permit = match self.concurrency.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let Some(entry) = self.queue.pop_min().await? else {
                drop(permit);
                break;
            };

            let this = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(e) = this.dispatch_one(entry.batch_id).await {
                    tracing::error!(batch_id = %entry.batch_id, error = %e, "dispatch attempt failed");
                }
            });
        }
        Ok(())
    }

    /// Process a single popped batch end to end: load, validate, claim
    /// supplier, invoke the provider, branch on the outcome. Every exit
    /// path that claimed the supplier releases it exactly once.
    #[tracing::instrument(skip(self), fields(batch_id = %batch_id))]
    async fn dispatch_one(&self, batch_id: uuid::Uuid) -> Result<()> {
        let batch = match self.store.get_batch(batch_id).await {
            Ok(batch) => batch,
            Err(e) => {
                self.queue.complete(batch_id).await?;
                return Err(e);
            }
        };

        if batch.status != BatchStatus::Queued {
            tracing::debug!(status = %batch.status, "batch no longer queued, dropping");
            self.queue.complete(batch_id).await?;
            return Ok(());
        }

        if let Some(scheduled_for) = batch.scheduled_for {
            if scheduled_for > chrono::Utc::now() {
                tracing::debug!(%scheduled_for, "batch not due yet, delegating to callback structure");
                self.queue.schedule_callback(batch_id, scheduled_for).await?;
                self.queue.complete(batch_id).await?;
                return Ok(());
            }
        }

        if !self.queue.claim_supplier(batch.supplier_id).await? {
            tracing::debug!(supplier_id = %batch.supplier_id, "supplier busy, requeuing with delay");
            let not_before = chrono::Utc::now()
                + chrono::Duration::from_std(SUPPLIER_CONTENTION_REQUEUE_DELAY).expect("fits in chrono::Duration");
            self.queue.schedule_callback(batch_id, not_before).await?;
            self.queue.complete(batch_id).await?;
            return Ok(());
        }

        // From here on, every exit path must release the supplier claim.
        let result = self.try_dispatch(&batch, &ContactOverride::default()).await;
        self.queue.release_supplier(batch.supplier_id).await?;
        self.queue.complete(batch_id).await?;

        // A provider-reported failure is already reverted and logged by
        // try_dispatch; it's an expected outcome, not a dispatcher error.
        match result {
            Ok(_) => Ok(()),
            Err(crate::error::EngineError::ExternalServiceFailure(_) | crate::error::EngineError::Timeout(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Manual dispatch for `POST /batches/{id}/trigger-call`: dispatches a
    /// QUEUED batch immediately, bypassing the primary queue's pop order,
    /// and hands the caller the provider's run id and external url instead
    /// of leaving the outcome to be discovered later over the Event Bus.
    ///
    /// Does not touch the queue store at all: the batch was never popped
    /// for this call, so there's nothing to claim or complete there. The
    /// supplier-exclusivity lock is still enforced, since a manual trigger
    /// racing the background dispatcher on the same supplier must not
    /// result in two in-flight calls.
    #[tracing::instrument(skip(self, overrides), fields(batch_id = %batch_id))]
    pub async fn trigger_manual(&self, batch_id: uuid::Uuid, overrides: ContactOverride) -> Result<(String, String)> {
        if self.provider.is_none() {
            return Err(crate::error::EngineError::ConfigurationMissing(
                "no agent provider configured".to_string(),
            ));
        }

        let batch = self.store.get_batch(batch_id).await?;
        if batch.status != BatchStatus::Queued {
            return Err(crate::error::EngineError::invalid_state(
                "batch",
                batch_id,
                "queued",
                batch.status.to_string(),
            ));
        }

        if !self.queue.claim_supplier(batch.supplier_id).await? {
            return Err(crate::error::EngineError::Conflict(format!(
                "supplier {} already has a call in flight",
                batch.supplier_id
            )));
        }

        let result = self.try_dispatch(&batch, &overrides).await;
        self.queue.release_supplier(batch.supplier_id).await?;
        match result? {
            Some(pair) => Ok(pair),
            None => Err(crate::error::EngineError::Conflict(format!(
                "batch {} changed state concurrently, trigger aborted",
                batch_id
            ))),
        }
    }

    async fn try_dispatch(
        &self,
        batch: &crate::model::SupplierBatch,
        overrides: &ContactOverride,
    ) -> Result<Option<(String, String)>> {
        let Some(provider) = &self.provider else {
            tracing::warn!("no agent provider configured, reverting batch to queued");
            self.store.revert_dispatch(batch.id).await?;
            return Ok(None);
        };

        if !self.store.start_dispatch(batch.id).await? {
            tracing::debug!("start_dispatch no-op, batch changed status concurrently");
            return Ok(None);
        }

        let supplier = self.store.get_supplier(batch.supplier_id).await?;
        let pos = self.store.get_batch_purchase_orders(batch.id).await?;
        let callback_url = format!("{}/webhooks/agent", self.config.callback_base_url.trim_end_matches('/'));
        let request = DispatchRequest::build(batch, &supplier, &pos, overrides, callback_url);

        let outcome = provider.dispatch(request, self.config.call_timeout).await;

        match outcome {
            Ok(DispatchOutcome::Success { run_id, external_url }) => {
                self.store.record_dispatch_success(batch.id, &run_id, &external_url).await?;
                self.store.create_agent_run(batch.id, &run_id, batch.attempt_count + 1).await?;
                self.events.publish_pipeline(
                    PipelineEventKind::BatchDispatched,
                    batch.id,
                    json!({"externalUrl": external_url, "runId": run_id}),
                );
                let log = self
                    .store
                    .append_batch_log(
                        batch.id,
                        BatchLogType::StatusChange,
                        LogLevel::Success,
                        "call dispatched",
                        json!({"externalUrl": external_url, "runId": run_id}),
                    )
                    .await?;
                self.events.publish_batch(batch.id, log);
                Ok(Some((run_id, external_url)))
            }
            Ok(DispatchOutcome::Error { error }) | Err(crate::error::EngineError::ExternalServiceFailure(error)) => {
                self.revert_failed_trigger(batch.id, &error).await?;
                Err(crate::error::EngineError::ExternalServiceFailure(error))
            }
            Err(crate::error::EngineError::Timeout(error)) => {
                self.revert_failed_trigger(batch.id, &error).await?;
                Err(crate::error::EngineError::Timeout(error))
            }
            Err(e) => {
                self.revert_failed_trigger(batch.id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn revert_failed_trigger(&self, batch_id: uuid::Uuid, reason: &str) -> Result<()> {
        self.store.revert_dispatch(batch_id).await?;
        self.events.publish_pipeline(
            PipelineEventKind::BatchFailed,
            batch_id,
            json!({"outcome": "failed", "reason": reason}),
        );
        let log = self
            .store
            .append_batch_log(
                batch_id,
                BatchLogType::StatusChange,
                LogLevel::Error,
                "trigger failed, batch requeued",
                json!({"reason": reason}),
            )
            .await?;
        self.events.publish_batch(batch_id, log);
        Ok(())
    }
}
