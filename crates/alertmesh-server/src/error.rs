//! Error types for the alertmesh server.

use std::net::SocketAddr;

use alertmesh_cluster::ClusterError;
use alertmesh_core::AlertError;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Errors raised while starting or reloading the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Routing, receiver or inhibition setup failed.
    #[error(transparent)]
    Alert(#[from] AlertError),

    /// Cluster setup failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors returned by API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or wrong bearer token.
    #[error("unauthorized")]
    Unauthorized,

    /// Resource not found.
    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    /// The request conflicts with the resource's current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::NotFound(_, _) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };

        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"error":"internal_error","message":"failed to serialize error"}"#.to_string()
        });

        (status, [("content-type", "application/json")], json).into_response()
    }
}

impl From<AlertError> for ApiError {
    fn from(err: AlertError) -> Self {
        match err {
            AlertError::SilenceNotFound { id } => Self::NotFound("silence", id),
            AlertError::SilenceExpired { .. } => Self::Conflict(err.to_string()),
            AlertError::InvalidAlert { .. }
            | AlertError::InvalidMatcher { .. }
            | AlertError::InvalidSilence { .. }
            | AlertError::InvalidRoute { .. }
            | AlertError::InvalidReceiver { .. } => Self::InvalidRequest(err.to_string()),
            AlertError::NotificationFailed { .. }
            | AlertError::Http(_)
            | AlertError::SerializationError(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::UnexpectedMessage { .. } => Self::InvalidRequest(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Alert(inner) => inner.into(),
            ServerError::Config(_) | ServerError::Toml(_) => Self::InvalidRequest(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}
