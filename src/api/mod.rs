//! API layer for HTTP request handling and data models.
//!
//! Mirrors the teacher's `api` module split: [`handlers`] holds the Axum
//! route functions, [`models`] holds the request/response wire types. The
//! router itself is assembled here and handed back to `lib.rs` to layer
//! tracing/CORS/body-limit middleware over.

pub mod handlers;
pub mod models;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full route table (§6 "Inbound HTTP"), unlayered — tracing,
/// CORS, and graceful shutdown are applied by the caller (`lib.rs`), same
/// separation the teacher's `build_router` / `Application::serve` keep.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let upload_routes = Router::new()
        .route("/upload/pos", post(handlers::upload::upload_pos).layer(DefaultBodyLimit::max(max_upload_bytes)))
        .route("/upload/progress/{job_id}", get(handlers::upload::upload_progress));

    let batch_routes = Router::new()
        .route("/batches", get(handlers::batches::list_batches))
        .route("/batches/stats", get(handlers::batches::get_stats))
        .route("/batches/{id}", get(handlers::batches::get_batch))
        .route("/batches/{id}/trigger-call", post(handlers::batches::trigger_call))
        .route("/batches/{id}/events", get(handlers::batches::batch_events));

    let supplier_routes = Router::new()
        .route("/suppliers", get(handlers::suppliers::list_suppliers))
        .route("/suppliers/{id}", get(handlers::suppliers::get_supplier));

    let admin_routes = Router::new()
        .route("/reset", post(handlers::admin::reset))
        .route("/webhooks/agent", post(handlers::webhooks::agent_webhook));

    Router::new()
        .route("/healthz", get(handlers::admin::healthz))
        .merge(upload_routes)
        .merge(batch_routes)
        .merge(supplier_routes)
        .merge(admin_routes)
        .with_state(state)
}
