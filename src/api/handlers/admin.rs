//! Operator endpoints: liveness probe and the destructive `/reset` used in
//! development/demo environments (§6).

use axum::extract::State;
use axum::http::StatusCode;

use crate::error::Result;
use crate::state::AppState;

pub async fn healthz() -> &'static str {
    "OK"
}

/// `POST /reset` — clears queues and batch/conflict/PO/supplier tables;
/// does not touch audit logs (spec §6 explicitly carves out ActivityLog).
pub async fn reset(State(state): State<AppState>) -> Result<StatusCode> {
    state.queue.reset().await?;
    state.store.reset().await?;
    Ok(StatusCode::NO_CONTENT)
}
