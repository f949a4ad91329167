//! Client for the external voice-agent provider: an opaque HTTP endpoint
//! that accepts a call request for a batch and later delivers webhook
//! events back to this engine. Grounded on the teacher's `HttpClient`
//! abstraction — a trait the dispatcher codes against, a `reqwest`
//! production impl, and a mock impl that records calls for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::model::{ContactOverride, PurchaseOrder, Supplier, SupplierBatch};

#[derive(Debug, Clone, Serialize)]
pub struct DispatchPoDescriptor {
    pub po_number: String,
    pub po_line: String,
    pub action_type: String,
    pub due_date: chrono::NaiveDate,
    pub recommended_date: Option<chrono::NaiveDate>,
    pub calculated_total_value: String,
}

/// The outbound request body: batch metadata, ordered PO descriptors, a
/// callback URL, the current attempt number, and contact overrides.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRequest {
    pub batch_id: uuid::Uuid,
    pub supplier_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub purchase_orders: Vec<DispatchPoDescriptor>,
    pub attempt: u32,
    pub callback_url: String,
}

impl DispatchRequest {
    pub fn build(
        batch: &SupplierBatch,
        supplier: &Supplier,
        pos: &[PurchaseOrder],
        overrides: &ContactOverride,
        callback_url: String,
    ) -> Self {
        Self {
            batch_id: batch.id,
            supplier_name: supplier.name.clone(),
            phone: overrides.phone(supplier).map(str::to_string),
            email: overrides.email(supplier).map(str::to_string),
            purchase_orders: pos
                .iter()
                .map(|po| DispatchPoDescriptor {
                    po_number: po.po_number.clone(),
                    po_line: po.po_line.clone(),
                    action_type: po.action_type.as_str().to_string(),
                    due_date: po.due_date,
                    recommended_date: po.recommended_date,
                    calculated_total_value: po.calculated_total_value.to_string(),
                })
                .collect(),
            attempt: batch.attempt_count + 1,
            callback_url,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Success { run_id: String, external_url: String },
    Error { error: String },
}

/// Trait the dispatcher codes against. Allows a mock impl in tests without
/// a real HTTP round trip.
#[async_trait]
pub trait AgentProviderClient: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest, timeout: Duration) -> Result<DispatchOutcome>;
}

#[derive(Clone)]
pub struct ReqwestAgentProvider {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestAgentProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl AgentProviderClient for ReqwestAgentProvider {
    #[tracing::instrument(skip(self, request), fields(batch_id = %request.batch_id, attempt = request.attempt))]
    async fn dispatch(&self, request: DispatchRequest, timeout: Duration) -> Result<DispatchOutcome> {
        let url = format!("{}/calls", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(format!("agent provider call for batch {} timed out", request.batch_id))
                } else {
                    EngineError::Http(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Ok(DispatchOutcome::Error {
                error: format!("provider returned {status}: {body}"),
            });
        }

        response
            .json::<DispatchOutcome>()
            .await
            .map_err(EngineError::Http)
    }
}

/// Mock provider for dispatcher/reconciler tests: configurable, FIFO
/// responses keyed by batch ID, with call recording.
#[derive(Clone, Default)]
pub struct MockAgentProvider {
    responses: Arc<Mutex<HashMap<uuid::Uuid, Vec<DispatchOutcome>>>>,
    calls: Arc<Mutex<Vec<DispatchRequest>>>,
}

impl MockAgentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_response(&self, batch_id: uuid::Uuid, outcome: DispatchOutcome) {
        self.responses.lock().entry(batch_id).or_default().push(outcome);
    }

    pub fn calls(&self) -> Vec<DispatchRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AgentProviderClient for MockAgentProvider {
    async fn dispatch(&self, request: DispatchRequest, _timeout: Duration) -> Result<DispatchOutcome> {
        let batch_id = request.batch_id;
        self.calls.lock().push(request);
        let mut responses = self.responses.lock();
        if let Some(queue) = responses.get_mut(&batch_id) {
            if !queue.is_empty() {
                return Ok(queue.remove(0));
            }
        }
        Err(EngineError::ExternalServiceFailure(format!(
            "no mock response configured for batch {batch_id}"
        )))
    }
}
