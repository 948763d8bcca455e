//! Operator endpoints behind bearer authentication.
//!
//! Read endpoints serve the metrics read-model, the dead-letter queue, and
//! per-event audit trails. Mutations re-run or resolve quarantined events
//! through the same pipeline the ingestion path uses.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{error, instrument};
use uuid::Uuid;

use billhook_core::{Alert, AuditRecord, EventId, OverviewStats, ProcessingAttempt, Resolution};
use billhook_pipeline::{dead_letter::ManualRetryOutcome, PipelineError};

use crate::server::AppState;

const DEFAULT_STATS_WINDOW_HOURS: i64 = 24;
const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

/// Pipeline overview with the alerts currently firing.
#[derive(Debug, Serialize)]
pub struct OverviewResponse {
    /// Lifetime event counts and backlog sizes.
    pub overview: OverviewStats,
    /// Terminal-event success rate across all types.
    pub success_rate: f64,
    /// Alerts from evaluating the thresholds against current stats.
    pub alerts: Vec<Alert>,
}

/// Query parameters for windowed statistics.
#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// Look-back window in hours. Defaults to 24.
    pub since_hours: Option<i64>,
}

/// Query parameters for list endpoints.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Maximum rows returned. Defaults to 50.
    pub limit: Option<i64>,
}

/// Audit trail for one event: the write-once record plus every attempt.
#[derive(Debug, Serialize)]
pub struct AuditTrailResponse {
    /// The append-only audit record.
    pub audit: AuditRecord,
    /// Handler invocations in attempt order.
    pub attempts: Vec<ProcessingAttempt>,
}

/// Request body for manual retry.
#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    /// Operator identity recorded if the retry resolves the entry.
    pub requested_by: Option<String>,
}

/// Request body for resolving a dead-letter entry.
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    /// How the entry was dealt with.
    pub resolution: Resolution,
    /// Operator identity recorded on the entry.
    pub resolved_by: String,
}

/// Outcome of a mutation on a dead-letter entry.
#[derive(Debug, Serialize)]
pub struct MutationResponse {
    /// Machine-readable outcome.
    pub outcome: String,
}

/// `GET /admin/metrics/overview`
#[instrument(skip(state))]
pub async fn overview(State(state): State<AppState>) -> Response {
    let since = state.clock.now_utc() - Duration::hours(DEFAULT_STATS_WINDOW_HOURS);

    let overview = match state.storage.metrics.overview().await {
        Ok(overview) => overview,
        Err(e) => return internal_error(&e),
    };
    let stats = match state.storage.metrics.event_type_stats(since).await {
        Ok(stats) => stats,
        Err(e) => return internal_error(&e),
    };

    let alerts = state.alert_policy.evaluate(&overview, &stats);
    let success_rate = overview.success_rate();

    (StatusCode::OK, Json(OverviewResponse { overview, success_rate, alerts })).into_response()
}

/// `GET /admin/metrics/event-types`
#[instrument(skip(state))]
pub async fn event_type_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let hours = query.since_hours.unwrap_or(DEFAULT_STATS_WINDOW_HOURS).max(1);
    let since = state.clock.now_utc() - Duration::hours(hours);

    match state.storage.metrics.event_type_stats(since).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => internal_error(&e),
    }
}

/// `GET /admin/dead-letters`
#[instrument(skip(state))]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    match state.storage.dead_letters.list_unresolved(Some(clamp_limit(query.limit))).await {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(e) => internal_error(&e),
    }
}

/// `GET /admin/audit-records`
#[instrument(skip(state))]
pub async fn list_audit_records(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    match state.storage.audit_records.list_recent(Some(clamp_limit(query.limit))).await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(e) => internal_error(&e),
    }
}

/// `GET /admin/events/{event_id}/audit`
#[instrument(skip(state))]
pub async fn audit_trail(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Response {
    let event_id = EventId(event_id);

    let audit = match state.storage.audit_records.find_by_event(event_id).await {
        Ok(Some(audit)) => audit,
        Ok(None) => return not_found(event_id),
        Err(e) => return internal_error(&e),
    };
    let attempts = match state.storage.processing_attempts.find_by_event(event_id).await {
        Ok(attempts) => attempts,
        Err(e) => return internal_error(&e),
    };

    (StatusCode::OK, Json(AuditTrailResponse { audit, attempts })).into_response()
}

/// `POST /admin/dead-letters/{event_id}/retry`
#[instrument(skip(state, request))]
pub async fn retry_dead_letter(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    request: Option<Json<RetryRequest>>,
) -> Response {
    let event_id = EventId(event_id);
    let requested_by = request
        .and_then(|Json(r)| r.requested_by)
        .unwrap_or_else(|| "admin".to_string());
    let now = state.clock.now_utc();

    match state.dead_letters.manual_retry(event_id, &requested_by, now).await {
        Ok(outcome) => {
            let outcome = match outcome {
                ManualRetryOutcome::Reprocessed => "reprocessed",
                ManualRetryOutcome::RetryScheduled => "retry_scheduled",
                ManualRetryOutcome::StillFailing => "still_failing",
                ManualRetryOutcome::AlreadySucceeded => "already_succeeded",
            };
            (StatusCode::OK, Json(MutationResponse { outcome: outcome.to_string() }))
                .into_response()
        },
        Err(PipelineError::EventNotFound { .. }) => not_found(event_id),
        Err(e) => pipeline_error(&e),
    }
}

/// `POST /admin/dead-letters/{event_id}/resolve`
#[instrument(skip(state, request))]
pub async fn resolve_dead_letter(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Json(request): Json<ResolveRequest>,
) -> Response {
    let event_id = EventId(event_id);
    let now = state.clock.now_utc();

    match state
        .dead_letters
        .resolve(event_id, request.resolution, &request.resolved_by, now)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(MutationResponse { outcome: "resolved".to_string() }),
        )
            .into_response(),
        Err(PipelineError::EventNotFound { .. }) => not_found(event_id),
        Err(e) => pipeline_error(&e),
    }
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

fn not_found(event_id: EventId) -> Response {
    (StatusCode::NOT_FOUND, format!("no record for event {event_id}")).into_response()
}

fn internal_error(e: &billhook_core::CoreError) -> Response {
    error!(error = %e, "admin query failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}

fn pipeline_error(e: &PipelineError) -> Response {
    error!(error = %e, "admin mutation failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_limit_defaults_and_clamps() {
        assert_eq!(clamp_limit(None), DEFAULT_LIST_LIMIT);
        assert_eq!(clamp_limit(Some(25)), 25);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(-10)), 1);
        assert_eq!(clamp_limit(Some(10_000)), MAX_LIST_LIMIT);
    }
}
