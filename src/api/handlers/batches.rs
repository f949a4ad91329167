//! HTTP handlers for batch listing, detail, manual dispatch, and the
//! per-batch SSE log stream (§6 "Inbound HTTP").

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::StreamExt;
use serde_json::json;
use uuid::Uuid;

use crate::api::models::{
    BatchDetailResponse, BatchListQuery, BatchLogResponse, BatchResponse, PaginatedResponse, StatsResponse,
    TriggerCallRequest, TriggerCallResponse,
};
use crate::error::{EngineError, Result};
use crate::model::ContactOverride;
use crate::state::AppState;
use crate::store::BatchFilter;

pub async fn list_batches(
    State(state): State<AppState>,
    Query(query): Query<BatchListQuery>,
) -> Result<Json<PaginatedResponse<BatchResponse>>> {
    let filter = BatchFilter {
        status: query.status,
        action_type: query.action_type,
        search: query.search.clone(),
    };
    let page = state
        .store
        .list_batches(filter, query.sort(), query.order(), query.page(), query.limit())
        .await?;
    Ok(Json(PaginatedResponse::from_page(page, query.page(), query.limit(), BatchResponse::from)))
}

pub async fn get_batch(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<BatchDetailResponse>> {
    let batch = state.store.get_batch(id).await?;
    let pos = state.store.get_batch_purchase_orders(id).await?;
    let runs = state.store.list_agent_runs(id).await?;
    let logs = state.store.list_batch_logs(id, 200).await?;

    Ok(Json(BatchDetailResponse {
        batch: batch.into(),
        purchase_orders: pos.into_iter().map(Into::into).collect(),
        agent_runs: runs.into_iter().map(Into::into).collect(),
        logs: logs.into_iter().map(Into::into).collect(),
    }))
}

pub async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>> {
    let stats = state.store.stats().await?;
    Ok(Json(stats.into()))
}

/// Manual dispatch for a QUEUED batch (§6: `POST /batches/{id}/trigger-call`).
/// 400 if the batch isn't QUEUED; 503 if no provider is configured — both
/// mapped automatically by `EngineError`'s `IntoResponse` impl.
pub async fn trigger_call(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: String,
) -> Result<Json<TriggerCallResponse>> {
    let body: TriggerCallRequest = if body.trim().is_empty() {
        TriggerCallRequest {
            phone_override: None,
            email_override: None,
        }
    } else {
        serde_json::from_str(&body).map_err(|e| EngineError::ValidationError(e.to_string()))?
    };
    let overrides = ContactOverride {
        phone_override: body.phone_override,
        email_override: body.email_override,
    };
    let (run_id, external_url) = state.dispatcher.trigger_manual(id, overrides).await?;
    Ok(Json(TriggerCallResponse { run_id, external_url }))
}

/// SSE stream for a batch's log channel (§4.3, §6). Emits an initial
/// `connected` event carrying the batch's current status, then live
/// events, with a heartbeat comment every 30s to keep the connection open
/// through intermediate proxies (spec requires heartbeats ≥ 30s).
pub async fn batch_events(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    let batch = state.store.get_batch(id).await?;

    let connected = Event::default()
        .event("connected")
        .json_data(json!({"currentStatus": batch.status}))
        .map_err(|e| EngineError::Internal(e.into()))?;

    let log_stream = state
        .events
        .subscribe_batch(id)
        .map(|log| -> std::result::Result<Event, std::convert::Infallible> {
            let event_name = match log.log_type {
                crate::model::BatchLogType::Log => "log",
                crate::model::BatchLogType::PoUpdate => "po_update",
                crate::model::BatchLogType::StatusChange => "status_change",
            };
            let resp: BatchLogResponse = log.into();
            Ok(Event::default()
                .event(event_name)
                .json_data(resp)
                .unwrap_or_else(|_| Event::default().event("log").data("{}")))
        });

    let stream = futures::stream::once(async move { Ok(connected) }).chain(log_stream);

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("heartbeat")))
}

