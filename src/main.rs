//! Billhook event notification service.
//!
//! Main entry point. Loads configuration, establishes the database pool,
//! ensures the schema exists, wires the processing pipeline and retry
//! sweep, and serves HTTP until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use billhook_api::{middleware::RateLimiter, AppState, Config};
use billhook_core::{storage::Storage, Clock, RealClock};
use billhook_pipeline::{
    handlers::default_router,
    processor::HttpProcessorClient,
    scheduler::RetryScheduler,
    storage::{PipelineStorage, PostgresPipelineStorage},
    AuditRecorder, DeadLetterService, ProcessingPipeline,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!("Starting billhook event notification service");
    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        "Configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    run_migrations(&pool).await?;
    info!("Database schema ready");

    let storage = Arc::new(Storage::new(pool.clone()));
    let pipeline_storage: Arc<dyn PipelineStorage> =
        Arc::new(PostgresPipelineStorage::new(storage.clone()));
    let clock: Arc<dyn Clock> = Arc::new(RealClock);

    let processor = Arc::new(
        HttpProcessorClient::new(config.to_processor_config())
            .map_err(|e| anyhow::anyhow!("failed to build processor client: {e}"))?,
    );
    let router = default_router(processor)
        .map_err(|e| anyhow::anyhow!("failed to build event router: {e}"))?;
    info!(
        event_types = %router.registered_kinds().map(ToString::to_string).collect::<Vec<_>>().join(", "),
        "Event handlers registered"
    );

    let recorder = Arc::new(AuditRecorder::new(pipeline_storage.clone()));
    let pipeline = Arc::new(
        ProcessingPipeline::new(
            pipeline_storage.clone(),
            Arc::new(router),
            recorder,
            config.to_retry_policy(),
            clock.clone(),
        )
        .with_handler_timeout(Duration::from_secs(config.handler_timeout_seconds)),
    );
    let dead_letters = Arc::new(DeadLetterService::new(pipeline_storage.clone(), pipeline.clone()));

    let mut scheduler = RetryScheduler::new(
        pipeline_storage,
        pipeline.clone(),
        config.to_scheduler_config(),
        clock.clone(),
    );
    scheduler.start();
    info!(worker_count = config.sweep_worker_count, "Retry sweep running");

    let rate_limiter = Arc::new(RateLimiter::new(storage.clone(), config.rate_limit_per_minute));
    let prune_task = spawn_rate_limit_prune(rate_limiter.clone(), clock.clone());

    let state = AppState {
        storage,
        pipeline,
        dead_letters,
        verifier: Arc::new(config.to_signature_verifier()?),
        rate_limiter,
        alert_policy: config.to_alert_policy(),
        admin_token: config.admin_token.clone(),
        clock,
    };

    let addr = config.parse_server_addr()?;
    info!(%addr, "Billhook is ready to receive notifications");

    billhook_api::start_server(state, addr, Duration::from_secs(config.request_timeout))
        .await
        .context("HTTP server failed")?;

    info!("Server stopped, draining retry sweep");
    prune_task.abort();
    scheduler.shutdown_graceful().await.context("Retry sweep shutdown failed")?;

    pool.close().await;
    info!("Billhook shutdown complete");
    Ok(())
}

/// Periodically expires rate-limit windows older than the current one so
/// the counter table stays small.
fn spawn_rate_limit_prune(
    rate_limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
) -> tokio::task::JoinHandle<()> {
    const PRUNE_INTERVAL: Duration = Duration::from_secs(300);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            match rate_limiter.prune_expired(clock.now_utc()).await {
                Ok(0) => {},
                Ok(pruned) => info!(pruned, "Expired rate limit windows removed"),
                Err(e) => tracing::warn!(error = %e, "Rate limit window prune failed"),
            }
        }
    })
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Ensures the schema exists.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS inbound_events (
            id UUID PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            event_type TEXT NOT NULL,
            payload JSONB NOT NULL,
            received_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            signature_valid BOOLEAN NOT NULL,
            status TEXT NOT NULL,
            processed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create inbound_events table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_attempts (
            id UUID PRIMARY KEY,
            event_id UUID NOT NULL REFERENCES inbound_events(id),
            attempt_number INTEGER NOT NULL,
            started_at TIMESTAMPTZ NOT NULL,
            completed_at TIMESTAMPTZ,
            outcome TEXT,
            error_detail TEXT,
            UNIQUE(event_id, attempt_number)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create processing_attempts table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS retry_tickets (
            event_id UUID PRIMARY KEY REFERENCES inbound_events(id),
            next_attempt_at TIMESTAMPTZ NOT NULL,
            attempts_so_far INTEGER NOT NULL,
            max_attempts INTEGER NOT NULL,
            claimed_by TEXT,
            claimed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create retry_tickets table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letter_entries (
            event_id UUID PRIMARY KEY REFERENCES inbound_events(id),
            event_type TEXT NOT NULL,
            first_failed_at TIMESTAMPTZ NOT NULL,
            last_failed_at TIMESTAMPTZ NOT NULL,
            failure_count INTEGER NOT NULL,
            last_error TEXT NOT NULL,
            resolved BOOLEAN NOT NULL DEFAULT FALSE,
            resolution TEXT,
            resolved_by TEXT,
            resolved_at TIMESTAMPTZ,
            requires_manual_review BOOLEAN NOT NULL DEFAULT TRUE
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create dead_letter_entries table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_records (
            event_id UUID PRIMARY KEY REFERENCES inbound_events(id),
            signature_validated BOOLEAN NOT NULL,
            idempotency_checked BOOLEAN NOT NULL,
            handler_matched BOOLEAN NOT NULL DEFAULT FALSE,
            processing_started_at TIMESTAMPTZ,
            processing_completed_at TIMESTAMPTZ,
            response_status INTEGER,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create audit_records table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rate_limit_windows (
            source TEXT NOT NULL,
            window_start TIMESTAMPTZ NOT NULL,
            count BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (source, window_start)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create rate_limit_windows table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_retry_tickets_due
        ON retry_tickets(next_attempt_at)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create retry_tickets index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_inbound_events_status
        ON inbound_events(status, received_at DESC)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create inbound_events status index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_dead_letter_unresolved
        ON dead_letter_entries(last_failed_at DESC)
        WHERE resolved = FALSE
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create dead_letter_entries index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_processing_attempts_event
        ON processing_attempts(event_id, attempt_number)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create processing_attempts index")?;

    Ok(())
}
