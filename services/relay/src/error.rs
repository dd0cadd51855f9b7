use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use courier_domain::envelope::EnvelopeError;

/// Outbox error variants.
///
/// Producer-facing variants (`Serialization`, `CapacityExceeded`,
/// `InvalidInput`) are returned to the caller. Relay-facing variants
/// (`PublishFailed`, `PublishTimeout`, `Storage`) are absorbed by the relay
/// loop and only show up in logs.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("serialization failed")]
    Serialization(#[from] EnvelopeError),
    #[error("outbox is full (capacity {capacity})")]
    CapacityExceeded { capacity: u64 },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("message not found")]
    NotFound,
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("publish timed out after {0:?}")]
    PublishTimeout(Duration),
    #[error("storage error")]
    Storage(#[from] anyhow::Error),
}

impl OutboxError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Serialization(_) => "SERIALIZATION",
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::NotFound => "NOT_FOUND",
            Self::PublishFailed(_) => "PUBLISH_FAILED",
            Self::PublishTimeout(_) => "PUBLISH_TIMEOUT",
            Self::Storage(_) => "STORAGE",
        }
    }

    /// Display text including the underlying cause, for logs.
    pub fn detail(&self) -> String {
        match self {
            Self::Storage(e) => format!("{e:#}"),
            Self::Serialization(e) => e.to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for OutboxError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::PublishFailed(_) => StatusCode::BAD_GATEWAY,
            Self::PublishTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Serialization(_) | Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Causes go to the log, never to the response body.
        if status.is_server_error() {
            tracing::error!(error = %self.detail(), kind = self.kind(), "request failed");
        }
        let body = serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}
