//! Database access layer implementing the repository pattern for event
//! persistence.
//!
//! The repository layer translates between domain models and database
//! schemas. All database operations go through these repositories; direct
//! SQL outside this module is forbidden to keep the idempotency and claiming
//! invariants in one place.

use std::sync::Arc;

use sqlx::PgPool;

pub mod audit_records;
pub mod dead_letters;
pub mod inbound_events;
pub mod metrics;
pub mod processing_attempts;
pub mod rate_limits;
pub mod retry_tickets;

use crate::error::Result;

/// Container for all repository instances providing unified database access.
///
/// Entry point for all database operations. Manages a shared connection pool
/// and provides type-safe access to each domain repository.
#[derive(Clone)]
pub struct Storage {
    /// Repository for admitted event notifications.
    pub inbound_events: Arc<inbound_events::Repository>,

    /// Repository for handler invocation records.
    pub processing_attempts: Arc<processing_attempts::Repository>,

    /// Repository for scheduled retries.
    pub retry_tickets: Arc<retry_tickets::Repository>,

    /// Repository for quarantined events.
    pub dead_letters: Arc<dead_letters::Repository>,

    /// Repository for the append-only audit trail.
    pub audit_records: Arc<audit_records::Repository>,

    /// Repository for per-source request windows.
    pub rate_limits: Arc<rate_limits::Repository>,

    /// Read-model aggregation queries for the dashboard.
    pub metrics: Arc<metrics::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    ///
    /// All repositories share the same pool via Arc.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            inbound_events: Arc::new(inbound_events::Repository::new(pool.clone())),
            processing_attempts: Arc::new(processing_attempts::Repository::new(pool.clone())),
            retry_tickets: Arc::new(retry_tickets::Repository::new(pool.clone())),
            dead_letters: Arc::new(dead_letters::Repository::new(pool.clone())),
            audit_records: Arc::new(audit_records::Repository::new(pool.clone())),
            rate_limits: Arc::new(rate_limits::Repository::new(pool.clone())),
            metrics: Arc::new(metrics::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy or the
    /// query times out.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.inbound_events.pool()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        // Verifies wiring only; database behavior is covered by
        // integration tests.
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _storage = Storage::new(pool);
    }
}
