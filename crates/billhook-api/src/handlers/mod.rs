//! HTTP request handlers.

pub mod admin;
pub mod health;
pub mod ingest;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use billhook_core::BillhookError;

pub use admin::{
    audit_trail, event_type_stats, list_audit_records, list_dead_letters, overview,
    resolve_dead_letter, retry_dead_letter,
};
pub use health::{health_check, liveness_check};
pub use ingest::ingest_webhook;

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message.
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Error code from the service taxonomy (E1001-E9999).
    pub code: String,
    /// Human-readable error description.
    pub message: String,
}

/// Creates a standardized error response from the service taxonomy.
pub(crate) fn error_response(status: StatusCode, error: &BillhookError) -> Response {
    let body = ErrorResponse {
        error: ErrorDetail { code: error.code().to_string(), message: error.to_string() },
    };
    (status, Json(body)).into_response()
}
