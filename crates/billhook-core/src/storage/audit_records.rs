//! Repository for the append-only audit trail.
//!
//! One row per admitted event, opened at admission. Each stage field is
//! written exactly once: the stage updates carry an `IS NULL` guard so a
//! replayed write can never overwrite an earlier value.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{AuditRecord, EventId},
};

/// Repository for audit record database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Opens the audit record for a newly admitted event.
    ///
    /// Idempotent: re-opening an existing record is a no-op, so an
    /// at-least-once caller cannot reset an event's trail.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn open(
        &self,
        event_id: EventId,
        signature_validated: bool,
        idempotency_checked: bool,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_records (
                event_id, signature_validated, idempotency_checked,
                handler_matched, created_at
            ) VALUES ($1, $2, $3, FALSE, $4)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id.0)
        .bind(signature_validated)
        .bind(idempotency_checked)
        .bind(created_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Records that a registered handler matched the event type.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_handler_matched(&self, event_id: EventId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE audit_records
            SET handler_matched = TRUE
            WHERE event_id = $1
            "#,
        )
        .bind(event_id.0)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Records when the first handler invocation began. Write-once.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_processing_started(
        &self,
        event_id: EventId,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE audit_records
            SET processing_started_at = $1
            WHERE event_id = $2 AND processing_started_at IS NULL
            "#,
        )
        .bind(started_at)
        .bind(event_id.0)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Records terminal completion and the response status. Write-once.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_processing_completed(
        &self,
        event_id: EventId,
        completed_at: DateTime<Utc>,
        response_status: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE audit_records
            SET processing_completed_at = $1, response_status = $2
            WHERE event_id = $3 AND processing_completed_at IS NULL
            "#,
        )
        .bind(completed_at)
        .bind(response_status)
        .bind(event_id.0)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds the audit record for an event.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_event(&self, event_id: EventId) -> Result<Option<AuditRecord>> {
        let record = sqlx::query_as::<_, AuditRecord>(
            r#"
            SELECT event_id, signature_validated, idempotency_checked,
                   handler_matched, processing_started_at,
                   processing_completed_at, response_status, created_at
            FROM audit_records
            WHERE event_id = $1
            "#,
        )
        .bind(event_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Lists recent audit records, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_recent(&self, limit: Option<i64>) -> Result<Vec<AuditRecord>> {
        let records = sqlx::query_as::<_, AuditRecord>(
            r#"
            SELECT event_id, signature_validated, idempotency_checked,
                   handler_matched, processing_started_at,
                   processing_completed_at, response_status, created_at
            FROM audit_records
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit.unwrap_or(100))
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
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
