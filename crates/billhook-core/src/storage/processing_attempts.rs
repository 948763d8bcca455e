//! Repository for processing attempt records.
//!
//! Attempts are created open when a handler invocation begins and sealed
//! exactly once when it completes. A sealed row is never updated again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{AttemptOutcome, EventId, ProcessingAttempt},
};

/// Repository for processing attempt database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Opens a new attempt record for a handler invocation.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn begin(
        &self,
        event_id: EventId,
        attempt_number: i32,
        started_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO processing_attempts (id, event_id, attempt_number, started_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id.0)
        .bind(attempt_number)
        .bind(started_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Seals an open attempt with its classified outcome.
    ///
    /// The `completed_at IS NULL` guard makes sealing a one-shot operation;
    /// a second seal of the same attempt is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn seal(
        &self,
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        completed_at: DateTime<Utc>,
        error_detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE processing_attempts
            SET completed_at = $1, outcome = $2, error_detail = $3
            WHERE id = $4 AND completed_at IS NULL
            "#,
        )
        .bind(completed_at)
        .bind(&outcome)
        .bind(error_detail)
        .bind(attempt_id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Lists all attempts for an event, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_event(&self, event_id: EventId) -> Result<Vec<ProcessingAttempt>> {
        let attempts = sqlx::query_as::<_, ProcessingAttempt>(
            r#"
            SELECT id, event_id, attempt_number, started_at,
                   completed_at, outcome, error_detail
            FROM processing_attempts
            WHERE event_id = $1
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(event_id.0)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
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
