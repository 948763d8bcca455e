//! Repository for dead-letter entries.
//!
//! Promotion is idempotent: repeated promotion of the same event updates
//! `last_failed_at` and increments `failure_count` instead of creating a
//! second row. Entries are never deleted; resolution is recorded on the row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{DeadLetterEntry, EventId, EventKind, Resolution},
};

/// Repository for dead-letter database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Promotes an event into the dead letter, idempotently.
    ///
    /// First promotion creates the entry with `failure_count` set to the
    /// number of attempts that failed; subsequent promotions bump the count,
    /// refresh `last_failed_at`/`last_error`, and re-open a previously
    /// resolved entry.
    ///
    /// # Errors
    ///
    /// Returns error if upsert fails.
    pub async fn promote(
        &self,
        event_id: EventId,
        event_type: &EventKind,
        last_error: &str,
        failed_at: DateTime<Utc>,
        failure_count: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letter_entries (
                event_id, event_type, first_failed_at, last_failed_at,
                failure_count, last_error, resolved, resolution,
                resolved_by, resolved_at, requires_manual_review
            ) VALUES ($1, $2, $3, $3, $5, $4, FALSE, NULL, NULL, NULL, TRUE)
            ON CONFLICT (event_id) DO UPDATE SET
                last_failed_at = EXCLUDED.last_failed_at,
                failure_count = dead_letter_entries.failure_count + 1,
                last_error = EXCLUDED.last_error,
                resolved = FALSE,
                resolution = NULL,
                resolved_by = NULL,
                resolved_at = NULL,
                requires_manual_review = TRUE
            "#,
        )
        .bind(event_id.0)
        .bind(event_type)
        .bind(failed_at)
        .bind(last_error)
        .bind(failure_count.max(1))
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks an entry resolved, recording who, when, and how.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no entry exists for the event.
    pub async fn resolve(
        &self,
        event_id: EventId,
        resolution: Resolution,
        resolved_by: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letter_entries
            SET resolved = TRUE,
                resolution = $1,
                resolved_by = $2,
                resolved_at = $3,
                requires_manual_review = FALSE
            WHERE event_id = $4
            "#,
        )
        .bind(&resolution)
        .bind(resolved_by)
        .bind(resolved_at)
        .bind(event_id.0)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!(
                "no dead-letter entry for event {event_id}"
            )));
        }

        Ok(())
    }

    /// Finds the entry for an event.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_event(&self, event_id: EventId) -> Result<Option<DeadLetterEntry>> {
        let entry = sqlx::query_as::<_, DeadLetterEntry>(
            r#"
            SELECT event_id, event_type, first_failed_at, last_failed_at,
                   failure_count, last_error, resolved, resolution,
                   resolved_by, resolved_at, requires_manual_review
            FROM dead_letter_entries
            WHERE event_id = $1
            "#,
        )
        .bind(event_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }

    /// Lists unresolved entries, most recently failed first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_unresolved(&self, limit: Option<i64>) -> Result<Vec<DeadLetterEntry>> {
        let entries = sqlx::query_as::<_, DeadLetterEntry>(
            r#"
            SELECT event_id, event_type, first_failed_at, last_failed_at,
                   failure_count, last_error, resolved, resolution,
                   resolved_by, resolved_at, requires_manual_review
            FROM dead_letter_entries
            WHERE NOT resolved
            ORDER BY last_failed_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit.unwrap_or(100))
        .fetch_all(&*self.pool)
        .await?;

        Ok(entries)
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
