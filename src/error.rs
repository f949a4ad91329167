//! Error kinds shared across the engine, and their mapping onto HTTP responses.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur anywhere in the dispatch engine.
///
/// Kinds mirror the taxonomy in the system design: request-scope errors
/// (`NotFound`, `InvalidState`, `ValidationError`, `Conflict`) are reported to
/// the caller with a stable kind and a 4xx status; `ExternalServiceFailure`
/// and `Timeout` revert state at the call site; `Internal` is logged with
/// full context and surfaced as a 5xx.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state for {entity} {id}: expected {expected}, found {found}")]
    InvalidState {
        entity: &'static str,
        id: String,
        expected: String,
        found: String,
    },

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("external service failure: {0}")]
    ExternalServiceFailure(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue store error: {0}")]
    Queue(#[from] redis::RedisError),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{entity} {id} not found"))
    }

    pub fn invalid_state(
        entity: &'static str,
        id: Uuid,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            entity,
            id: id.to_string(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::ValidationError(_) => "validation_error",
            EngineError::Conflict(_) => "conflict",
            EngineError::ExternalServiceFailure(_) => "external_service_failure",
            EngineError::Timeout(_) => "timeout",
            EngineError::ConfigurationMissing(_) => "configuration_missing",
            EngineError::Internal(_) => "internal",
            #[cfg(feature = "postgres")]
            EngineError::Database(_) => "internal",
            EngineError::Queue(_) => "internal",
            EngineError::Http(_) => "external_service_failure",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidState { .. } => StatusCode::BAD_REQUEST,
            EngineError::ValidationError(_) => StatusCode::BAD_REQUEST,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::ExternalServiceFailure(_) => StatusCode::BAD_GATEWAY,
            EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EngineError::ConfigurationMissing(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            #[cfg(feature = "postgres")]
            EngineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Http(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        if matches!(self, EngineError::Internal(_) | EngineError::Queue(_)) {
            tracing::error!(error = %self, "internal error");
        }
        #[cfg(feature = "postgres")]
        if matches!(self, EngineError::Database(_)) {
            tracing::error!(error = %self, "database error");
        }

        let status = self.status();
        let body = Json(json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}
