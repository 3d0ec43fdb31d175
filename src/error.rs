//! Error types for the lifecycle core and API responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::time::Duration;

/// Errors raised by the supervisor, the manager and the request proxy
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    #[error("Model {model} not found")]
    UnknownModel { model: String },

    #[error("llama-server for {model} failed to start: {reason}")]
    StartupFailed { model: String, reason: String },

    #[error("llama-server for {model} did not become healthy within {timeout:?}")]
    StartupTimeout { model: String, timeout: Duration },

    #[error("request to {model} failed: {reason}")]
    ProxyFailed { model: String, reason: String },

    #[error("error stopping {model}: {reason}")]
    ShutdownError { model: String, reason: String },

    /// The entry was stopped and removed by the manager while a caller still
    /// held it. The manager retries with a fresh entry.
    #[error("server for {model} was evicted")]
    Evicted { model: String },
}

pub type ManagerResult<T> = Result<T, ManagerError>;

impl ManagerError {
    pub fn model(&self) -> &str {
        match self {
            Self::UnknownModel { model }
            | Self::StartupFailed { model, .. }
            | Self::StartupTimeout { model, .. }
            | Self::ProxyFailed { model, .. }
            | Self::ShutdownError { model, .. }
            | Self::Evicted { model } => model,
        }
    }
}

/// API error types
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Upstream(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Upstream(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::UnknownModel { .. } => ApiError::NotFound(err.to_string()),
            ManagerError::StartupFailed { .. }
            | ManagerError::StartupTimeout { .. }
            | ManagerError::Evicted { .. } => ApiError::Unavailable(err.to_string()),
            ManagerError::ProxyFailed { .. } => ApiError::Upstream(err.to_string()),
            ManagerError::ShutdownError { .. } => ApiError::Internal(anyhow::Error::new(err)),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}
