//! HTTP server assembly and request routing.
//!
//! One router serves three groups: health probes (unauthenticated), the
//! public ingestion endpoint (authenticated by signature inside the
//! handler), and the admin group (bearer token middleware). Requests carry
//! an `X-Request-Id` header end to end for cross-service tracing.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use billhook_core::{AlertPolicy, Clock};
use billhook_pipeline::{DeadLetterService, ProcessingPipeline, SignatureVerifier};

use crate::{handlers, middleware::auth::admin_auth, middleware::RateLimiter};

/// Shared state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Repository access for reads and health checks.
    pub storage: Arc<billhook_core::storage::Storage>,
    /// Event processing pipeline for ingestion.
    pub pipeline: Arc<ProcessingPipeline>,
    /// Dead-letter resolution and manual retry.
    pub dead_letters: Arc<DeadLetterService>,
    /// Signature verifier with the configured secret set.
    pub verifier: Arc<SignatureVerifier>,
    /// Per-source request limiter.
    pub rate_limiter: Arc<RateLimiter>,
    /// Alert thresholds for the overview endpoint.
    pub alert_policy: AlertPolicy,
    /// Bearer token for the admin group.
    pub admin_token: String,
    /// Time source, swappable in tests.
    pub clock: Arc<dyn Clock>,
}

/// Creates the Axum router with all routes and middleware.
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/live", get(handlers::liveness_check));

    let webhook_routes =
        Router::new().route("/webhooks/{processor}", post(handlers::ingest_webhook));

    let admin_routes = Router::new()
        .route("/admin/metrics/overview", get(handlers::overview))
        .route("/admin/metrics/event-types", get(handlers::event_type_stats))
        .route("/admin/dead-letters", get(handlers::list_dead_letters))
        .route("/admin/audit-records", get(handlers::list_audit_records))
        .route("/admin/dead-letters/{event_id}/retry", post(handlers::retry_dead_letter))
        .route("/admin/dead-letters/{event_id}/resolve", post(handlers::resolve_dead_letter))
        .route("/admin/events/{event_id}/audit", get(handlers::audit_trail))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .merge(admin_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Middleware to inject a request id into all responses.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Starts the HTTP server with graceful shutdown support.
///
/// # Errors
///
/// Returns `std::io::Error` if the port is in use or the interface is
/// unavailable.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    request_timeout: Duration,
) -> Result<(), std::io::Error> {
    let app = create_router(state, request_timeout);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    warn!("Waiting for in-flight requests to complete");
}
