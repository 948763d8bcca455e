//! Repository for retry ticket operations.
//!
//! Tickets are claimed with `FOR UPDATE SKIP LOCKED` so concurrent sweep
//! workers never block each other, and `claimed_by`/`claimed_at` carry the
//! claim so at most one worker executes a given retry. Claims older than the
//! staleness threshold are reclaimable; a crashed worker never strands a
//! ticket.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{EventId, RetryTicket},
};

/// Repository for retry ticket database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Creates or reschedules the ticket for an event.
    ///
    /// Called after each transient failure. The upsert clears any existing
    /// claim so the next sweep can pick the ticket up once it comes due.
    ///
    /// # Errors
    ///
    /// Returns error if upsert fails.
    pub async fn schedule(
        &self,
        event_id: EventId,
        next_attempt_at: DateTime<Utc>,
        attempts_so_far: i32,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO retry_tickets (
                event_id, next_attempt_at, attempts_so_far, max_attempts,
                claimed_by, claimed_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, NULL, NULL, $5, $5)
            ON CONFLICT (event_id) DO UPDATE SET
                next_attempt_at = EXCLUDED.next_attempt_at,
                attempts_so_far = EXCLUDED.attempts_so_far,
                max_attempts = EXCLUDED.max_attempts,
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(event_id.0)
        .bind(next_attempt_at)
        .bind(attempts_so_far)
        .bind(max_attempts)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Claims due tickets for a sweep worker.
    ///
    /// Selects tickets whose `next_attempt_at` has passed and that are
    /// either unclaimed or hold a claim older than `claim_staleness`, under
    /// `FOR UPDATE SKIP LOCKED`, then stamps the claim in the same
    /// transaction. Tickets come back oldest-due first.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim_due(
        &self,
        claimant: &str,
        batch_size: usize,
        claim_staleness: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<RetryTicket>> {
        let stale_before = now - claim_staleness;

        let mut tx = self.pool.begin().await?;

        let event_ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT event_id FROM retry_tickets
            WHERE next_attempt_at <= $1
              AND (claimed_at IS NULL OR claimed_at < $2)
            ORDER BY next_attempt_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(batch_size as i32)
        .fetch_all(&mut *tx)
        .await?;

        if event_ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let tickets = sqlx::query_as::<_, RetryTicket>(
            r#"
            UPDATE retry_tickets
            SET claimed_by = $1, claimed_at = $2
            WHERE event_id = ANY($3)
            RETURNING event_id, next_attempt_at, attempts_so_far, max_attempts,
                      claimed_by, claimed_at, created_at, updated_at
            "#,
        )
        .bind(claimant)
        .bind(now)
        .bind(&event_ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(tickets)
    }

    /// Deletes the ticket for an event.
    ///
    /// Called on success or when the event is promoted to the dead letter.
    /// Returns whether a ticket existed.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn delete(&self, event_id: EventId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM retry_tickets WHERE event_id = $1")
            .bind(event_id.0)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Releases a claim without deleting the ticket.
    ///
    /// Used when a claimed retry could not run (shutdown mid-sweep); the
    /// ticket becomes immediately reclaimable instead of waiting out the
    /// staleness threshold.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn release_claim(&self, event_id: EventId, claimant: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE retry_tickets
            SET claimed_by = NULL, claimed_at = NULL
            WHERE event_id = $1 AND claimed_by = $2
            "#,
        )
        .bind(event_id.0)
        .bind(claimant)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds the ticket for an event.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_event(&self, event_id: EventId) -> Result<Option<RetryTicket>> {
        let ticket = sqlx::query_as::<_, RetryTicket>(
            r#"
            SELECT event_id, next_attempt_at, attempts_so_far, max_attempts,
                   claimed_by, claimed_at, created_at, updated_at
            FROM retry_tickets
            WHERE event_id = $1
            "#,
        )
        .bind(event_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(ticket)
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
