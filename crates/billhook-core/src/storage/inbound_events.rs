//! Repository for inbound event database operations.
//!
//! The idempotency guard lives here: admission is an atomic insert-if-absent
//! against the unique constraint on `external_id`, correct across process
//! restarts and concurrent instances.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{Admission, EventId, EventStatus, InboundEvent},
};

/// Repository for inbound event database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Atomically admits an event, or reports the existing duplicate.
    ///
    /// `INSERT ... ON CONFLICT DO NOTHING` makes the check-and-insert a
    /// single atomic statement; when two deliveries of the same
    /// `external_id` race, exactly one insert wins and the loser observes
    /// the winner's row. Duplicates are acknowledged, never rejected.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails for any reason other than the
    /// uniqueness conflict.
    pub async fn admit(&self, event: &InboundEvent) -> Result<Admission> {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO inbound_events (
                id, external_id, event_type, payload,
                received_at, signature_valid, status, processed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (external_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(event.id.0)
        .bind(&event.external_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.received_at)
        .bind(event.signature_valid)
        .bind(&event.status)
        .bind(event.processed_at)
        .fetch_optional(&*self.pool)
        .await?;

        match inserted {
            Some(_) => Ok(Admission::Admitted),
            None => {
                // Lost the race (or a redelivery): surface the winner's id.
                let existing: Uuid = sqlx::query_scalar(
                    "SELECT id FROM inbound_events WHERE external_id = $1",
                )
                .bind(&event.external_id)
                .fetch_one(&*self.pool)
                .await?;

                Ok(Admission::Duplicate(EventId(existing)))
            },
        }
    }

    /// Finds an event by internal ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, event_id: EventId) -> Result<Option<InboundEvent>> {
        let event = sqlx::query_as::<_, InboundEvent>(
            r#"
            SELECT id, external_id, event_type, payload,
                   received_at, signature_valid, status, processed_at
            FROM inbound_events
            WHERE id = $1
            "#,
        )
        .bind(event_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Updates the lifecycle status of an event.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn update_status(&self, event_id: EventId, status: EventStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE inbound_events
            SET status = $1
            WHERE id = $2
            "#,
        )
        .bind(&status)
        .bind(event_id.0)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks an event terminal, recording when it finished.
    ///
    /// # Errors
    ///
    /// Returns error if update fails, or `NotFound` if no such event exists.
    pub async fn mark_terminal(
        &self,
        event_id: EventId,
        status: EventStatus,
        processed_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE inbound_events
            SET status = $1, processed_at = $2
            WHERE id = $3
            "#,
        )
        .bind(&status)
        .bind(processed_at)
        .bind(event_id.0)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("event {event_id} not found")));
        }

        Ok(())
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
