//! Common error types for Handoff
//!
//! This module defines all error types used across the decode router.
//! All errors map onto HTTP status codes so handlers can return them directly.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main error type for Handoff
#[derive(Error, Debug)]
pub enum RouterError {
    /// Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reservation requested while no decode workers are registered
    #[error("No decode workers available")]
    NoWorkersAvailable,

    /// Dispatch referenced a worker id the registry does not know
    #[error("Decode worker not found: {0}")]
    WorkerNotFound(String),

    /// The decode worker call failed (network error, bad status or timeout)
    #[error("Error communicating with decode worker {worker}: {detail}")]
    Upstream {
        worker: String,
        status: Option<u16>,
        detail: String,
    },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Request body is not valid JSON or does not match the endpoint's schema
    #[error("{detail}")]
    MalformedBody { status: StatusCode, detail: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registration/encoding errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for RouterError {
    fn from(err: config::ConfigError) -> Self {
        RouterError::Config(err.to_string())
    }
}

impl From<JsonRejection> for RouterError {
    fn from(rejection: JsonRejection) -> Self {
        RouterError::MalformedBody {
            status: rejection.status(),
            detail: rejection.body_text(),
        }
    }
}

impl RouterError {
    /// HTTP status reported to the caller of a router endpoint
    pub fn status_code(&self) -> StatusCode {
        match self {
            RouterError::WorkerNotFound(_) => StatusCode::NOT_FOUND,
            RouterError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RouterError::MalformedBody { status, .. } => *status,
            // Upstream failures and an empty registry are both server-side
            // conditions for the prefill worker calling us.
            RouterError::NoWorkersAvailable
            | RouterError::Upstream { .. }
            | RouterError::Config(_)
            | RouterError::Serialization(_)
            | RouterError::Io(_)
            | RouterError::Metrics(_)
            | RouterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        RouterError::Config(msg.into())
    }

    /// Create a worker not found error
    pub fn worker_not_found(worker: impl Into<String>) -> Self {
        RouterError::WorkerNotFound(worker.into())
    }

    /// Create an upstream error
    pub fn upstream(
        worker: impl Into<String>,
        status: Option<u16>,
        detail: impl Into<String>,
    ) -> Self {
        RouterError::Upstream {
            worker: worker.into(),
            status,
            detail: detail.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        RouterError::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        RouterError::Internal(msg.into())
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let mut body = json!({ "detail": self.to_string() });
        if let RouterError::Upstream {
            status: Some(status),
            ..
        } = &self
        {
            body["upstream_status"] = json!(status);
        }
        (self.status_code(), Json(body)).into_response()
    }
}

/// Result type alias for Handoff operations
pub type Result<T> = std::result::Result<T, RouterError>;
