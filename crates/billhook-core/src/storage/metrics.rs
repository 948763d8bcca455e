//! Read-model aggregation queries for the operational dashboard.
//!
//! Everything here is derived from `inbound_events`, `retry_tickets`, and
//! `dead_letter_entries`; nothing is authoritative and every number can be
//! rebuilt by re-running the query. Kept separate from the write-path
//! repositories so the dashboard is testable without the ingestion flow.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::{
    error::Result,
    metrics::{EventTypeStats, OverviewStats},
    models::EventKind,
};

/// Aggregation queries backing the dashboard endpoints.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Computes per-event-type rollups for events received since `since`.
    ///
    /// Latency is measured from receipt to terminal state, so only terminal
    /// events contribute to the average and p95.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn event_type_stats(&self, since: DateTime<Utc>) -> Result<Vec<EventTypeStats>> {
        let rows = sqlx::query(
            r#"
            SELECT event_type,
                   COUNT(*) AS count,
                   COUNT(*) FILTER (WHERE status = 'succeeded') AS success_count,
                   AVG(EXTRACT(EPOCH FROM (processed_at - received_at)) * 1000)
                       FILTER (WHERE processed_at IS NOT NULL)::DOUBLE PRECISION
                       AS avg_latency_ms,
                   (PERCENTILE_CONT(0.95) WITHIN GROUP (
                       ORDER BY EXTRACT(EPOCH FROM (processed_at - received_at)) * 1000
                   ) FILTER (WHERE processed_at IS NOT NULL))::DOUBLE PRECISION
                       AS p95_latency_ms
            FROM inbound_events
            WHERE received_at >= $1
            GROUP BY event_type
            ORDER BY count DESC
            "#,
        )
        .bind(since)
        .fetch_all(&*self.pool)
        .await?;

        let mut stats = Vec::with_capacity(rows.len());
        for row in rows {
            stats.push(EventTypeStats {
                event_type: EventKind::parse(row.try_get::<&str, _>("event_type")?),
                count: row.try_get("count")?,
                success_count: row.try_get("success_count")?,
                avg_latency_ms: row.try_get("avg_latency_ms")?,
                p95_latency_ms: row.try_get("p95_latency_ms")?,
            });
        }

        Ok(stats)
    }

    /// Computes the service-wide overview rollup.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn overview(&self) -> Result<OverviewStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM inbound_events) AS total_events,
                (SELECT COUNT(*) FROM inbound_events WHERE status = 'succeeded')
                    AS succeeded,
                (SELECT COUNT(*) FROM inbound_events WHERE status = 'dead_lettered')
                    AS dead_lettered,
                (SELECT COUNT(*) FROM retry_tickets) AS pending_retries,
                (SELECT COUNT(*) FROM dead_letter_entries WHERE NOT resolved)
                    AS dead_letter_backlog
            "#,
        )
        .fetch_one(&*self.pool)
        .await?;

        Ok(OverviewStats {
            total_events: row.try_get("total_events")?,
            succeeded: row.try_get("succeeded")?,
            dead_lettered: row.try_get("dead_lettered")?,
            pending_retries: row.try_get("pending_retries")?,
            dead_letter_backlog: row.try_get("dead_letter_backlog")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
