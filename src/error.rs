//! Error types for FlowViz.
//!
//! A single `thiserror` enum covers the flow reporting path, geolocation
//! enrichment and process startup I/O. Handlers turn it into an HTTP response
//! through the `IntoResponse` impl at the bottom of this module.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;
use tracing::error;

/// Custom error type for FlowViz operations.
#[derive(Debug, Error)]
pub enum FlowVizError {
    /// Address is unparseable, private or loopback. Never looked up, never cached.
    #[error("invalid or private IP address: {0}")]
    InvalidAddress(String),

    /// Geolocation provider failed: transport, HTTP status or a `"fail"` status body.
    #[error("geoip lookup failed: {0}")]
    LookupFailed(String),

    /// One interface's accounting history could not produce a window.
    #[error("flow snapshot unavailable for interface {interface}: {reason}")]
    SnapshotUnavailable { interface: String, reason: String },

    /// Error reading or writing files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing JSON data.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Error building the HTTP client.
    #[error("HTTP client error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// Error rendering a dashboard template.
    #[error("template error: {0}")]
    Template(#[from] tera::Error),
}

impl FlowVizError {
    /// Maps a provider-side `reqwest` failure into `LookupFailed`.
    pub fn lookup(err: impl std::fmt::Display) -> Self {
        FlowVizError::LookupFailed(err.to_string())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            FlowVizError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
            FlowVizError::LookupFailed(_) => StatusCode::BAD_GATEWAY,
            FlowVizError::SnapshotUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for FlowVizError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("request failed: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
