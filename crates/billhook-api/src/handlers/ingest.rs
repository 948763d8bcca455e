//! Webhook ingestion endpoint.
//!
//! `POST /webhooks/{processor}` runs the gate stages in a fixed order: the
//! rate limiter first, so a flooding source never costs an HMAC computation,
//! then signature verification, then admission into the pipeline. Handler
//! failures after admission are internal outcomes; the sender still gets
//! `200` so it does not redeliver an event the pipeline already owns.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use tracing::{info, instrument, warn};

use billhook_core::{BillhookError, CoreError};
use billhook_pipeline::verify::VerifyError;

use crate::{handlers::error_response, server::AppState};

/// Header carrying `t=<unix>,v1=<hex>` from the processor.
pub const SIGNATURE_HEADER: &str = "webhook-signature";

/// Acknowledgment returned for every accepted notification.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// Always true for a 2xx response.
    pub received: bool,
    /// Whether a handler completed during this request. False for
    /// duplicates, scheduled retries, and quarantined events.
    pub processed: bool,
    /// Internal id assigned to the event.
    pub event_id: String,
    /// Declared event type from the envelope.
    pub event_type: String,
}

/// Ingests a signed event notification.
///
/// Status codes follow the acceptance contract: `429` for a rate-limited
/// source, `400` only for authentication failures (bad signature, stale
/// timestamp, malformed envelope), `503` when storage cannot durably record
/// the event, and `200` for everything else including duplicates.
#[instrument(name = "ingest_webhook", skip(state, headers, body), fields(processor = %processor))]
pub async fn ingest_webhook(
    Path(processor): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let now = state.clock.now_utc();

    match state.rate_limiter.check(&processor, now).await {
        Ok(crate::middleware::RateDecision::Allowed) => {},
        Ok(crate::middleware::RateDecision::Limited) => {
            return error_response(
                StatusCode::TOO_MANY_REQUESTS,
                &BillhookError::RateLimited { source_id: processor },
            );
        },
        Err(e) => return storage_error_response(&e),
    }

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()).unwrap_or("");

    let envelope = match state.verifier.verify(&body, signature, state.clock.as_ref()) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "rejected unauthenticated notification");
            return error_response(StatusCode::BAD_REQUEST, &verify_error(e));
        },
    };

    match state.pipeline.process_new(envelope).await {
        Ok(outcome) => {
            info!(
                event_id = %outcome.event_id,
                processed = outcome.processed,
                duplicate = outcome.duplicate,
                "notification accepted"
            );
            (
                StatusCode::OK,
                Json(IngestResponse {
                    received: true,
                    processed: outcome.processed,
                    event_id: outcome.event_id.to_string(),
                    event_type: outcome.event_type.to_string(),
                }),
            )
                .into_response()
        },
        Err(e) => storage_error_response(&e),
    }
}

fn verify_error(e: VerifyError) -> BillhookError {
    match e {
        VerifyError::StaleTimestamp { tolerance_secs } => {
            BillhookError::StaleSignature { tolerance_secs }
        },
        VerifyError::MalformedEnvelope(reason) => BillhookError::MalformedEnvelope { reason },
        VerifyError::MissingSignature
        | VerifyError::InvalidFormat(_)
        | VerifyError::VerificationFailed
        | VerifyError::InvalidSecret => BillhookError::InvalidSignature,
    }
}

fn storage_error_response(e: &CoreError) -> Response {
    tracing::error!(error = %e, "storage failure during ingestion");
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        &BillhookError::StorageUnavailable(e.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failures_map_to_e1xxx_codes() {
        assert_eq!(verify_error(VerifyError::VerificationFailed).code(), "E1001");
        assert_eq!(verify_error(VerifyError::MissingSignature).code(), "E1001");
        assert_eq!(verify_error(VerifyError::StaleTimestamp { tolerance_secs: 300 }).code(), "E1002");
        assert_eq!(
            verify_error(VerifyError::MalformedEnvelope("not json".to_string())).code(),
            "E1003"
        );
    }
}
