//! Repository for per-source rate limit windows.
//!
//! The counter is a durable fixed-window: one row per (source, window start),
//! incremented with an atomic upsert. No read-modify-write happens in
//! application code, so concurrent instances share a correct count.

use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Utc};
use sqlx::PgPool;

use crate::error::{CoreError, Result};

/// Repository for rate limit window database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Increments the current window counter for a source.
    ///
    /// Returns the count after increment; the caller compares it against the
    /// limit. `INSERT ... ON CONFLICT ... SET count = count + 1` makes the
    /// increment a single atomic statement.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails, or `InvalidInput` for a
    /// non-positive window size.
    pub async fn increment(
        &self,
        source: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<i64> {
        let window_start = now
            .duration_trunc(window)
            .map_err(|e| CoreError::InvalidInput(format!("invalid rate limit window: {e}")))?;

        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO rate_limit_windows (source, window_start, count)
            VALUES ($1, $2, 1)
            ON CONFLICT (source, window_start)
            DO UPDATE SET count = rate_limit_windows.count + 1
            RETURNING count
            "#,
        )
        .bind(source)
        .bind(window_start)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count)
    }

    /// Deletes windows that ended before the cutoff.
    ///
    /// Expired windows are dead weight; a periodic sweep keeps the table
    /// small. Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_windows WHERE window_start < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected())
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
