//! `POST /webhooks/agent` — inbound webhook from the voice-agent provider,
//! authenticated by the `x-api-key` shared secret header (§6, §7).
//!
//! Malformed payloads are reported as 4xx; an unrecognized `event_type` is
//! logged as a warning and acknowledged with 200 rather than failed, so the
//! provider doesn't redeliver it forever (§7 "Webhook handler treats...
//! unknown event_type as a warning").

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use crate::error::{EngineError, Result};
use crate::reconciler::WebhookEvent;
use crate::state::AppState;

const API_KEY_HEADER: &str = "x-api-key";

pub async fn agent_webhook(State(state): State<AppState>, headers: HeaderMap, body: String) -> Result<StatusCode> {
    let provided = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| EngineError::ValidationError(format!("missing {API_KEY_HEADER} header")))?;

    if provided != state.config.agent_webhook_secret {
        return Err(EngineError::ValidationError("invalid webhook api key".to_string()));
    }

    let value: serde_json::Value =
        serde_json::from_str(&body).map_err(|e| EngineError::ValidationError(format!("malformed webhook payload: {e}")))?;

    const KNOWN_EVENT_TYPES: &[&str] = &["log", "po_resolved", "callback_requested", "escalation", "call_complete"];
    let event_type = value.get("event_type").and_then(|v| v.as_str());
    if !event_type.is_some_and(|t| KNOWN_EVENT_TYPES.contains(&t)) {
        tracing::warn!(event_type, "unrecognized webhook event_type, acknowledging without action");
        return Ok(StatusCode::OK);
    }

    let event: WebhookEvent = serde_json::from_value(value)
        .map_err(|e| EngineError::ValidationError(format!("malformed {} payload: {e}", event_type.unwrap_or("?"))))?;

    state.reconciler.handle(event).await?;
    Ok(StatusCode::OK)
}
