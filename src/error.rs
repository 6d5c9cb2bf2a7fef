//! Error taxonomy for the registry, mapped deterministically to HTTP
//! responses at the boundary (see SPEC_FULL §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by the store layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("integrity violation on key '{key}': {message}")]
    Integrity { key: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl StoreError {
    /// Whether a caller should retry this error with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
            || matches!(self, StoreError::Sqlx(e) if matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)))
    }
}

/// Errors raised while validating an inbound registration/heartbeat body.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("duplicate function_name '{0}' within a single agent's capability set")]
    DuplicateFunctionName(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid version constraint '{0}'")]
    InvalidVersion(String),

    #[error("malformed request body: {0}")]
    Malformed(String),
}

/// Top-level error type returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent evicted: {0}")]
    AgentEvicted(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error_code: &'static str,
    message: String,
}

impl RegistryError {
    fn error_code(&self) -> &'static str {
        match self {
            RegistryError::Validation(ValidationError::DuplicateFunctionName(_)) => "duplicate_function_name",
            RegistryError::Validation(ValidationError::MissingField(_)) => "missing_field",
            RegistryError::Validation(ValidationError::InvalidVersion(_)) => "invalid_version",
            RegistryError::Validation(ValidationError::Malformed(_)) => "malformed_request",
            RegistryError::AgentNotFound(_) => "agent_not_found",
            RegistryError::AgentEvicted(_) => "agent_evicted",
            RegistryError::Store(e) if e.is_transient() => "store_unavailable",
            RegistryError::Store(_) => "store_error",
            RegistryError::Internal(_) => "internal_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::Validation(_) => StatusCode::BAD_REQUEST,
            RegistryError::AgentNotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::AgentEvicted(_) => StatusCode::GONE,
            RegistryError::Store(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RegistryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "unhandled registry error");
        } else {
            tracing::debug!(error = %self, "registry error response");
        }
        let body = ErrorBody {
            error_code: self.error_code(),
            message: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}
