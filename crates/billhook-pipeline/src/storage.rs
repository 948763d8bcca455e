//! Storage abstraction for the processing pipeline.
//!
//! Trait-based seam over the concrete repositories so pipeline logic, retry
//! decisions, and dead-letter flows are testable without a database. The
//! production implementation delegates to `billhook_core::storage::Storage`;
//! tests use the in-memory mock below.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use billhook_core::{
    error::Result,
    models::{
        Admission, AttemptOutcome, AuditRecord, DeadLetterEntry, EventId, EventKind, EventStatus,
        InboundEvent, ProcessingAttempt, Resolution, RetryTicket,
    },
};

type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations required by the processing pipeline.
///
/// Covers the full event lifecycle: admission, attempt records, retry
/// tickets, dead-letter entries, and the audit trail. Every mutation keeps
/// the semantics the concrete repositories guarantee (atomic admission,
/// claim exclusivity, idempotent promotion, write-once audit fields).
pub trait PipelineStorage: Send + Sync + 'static {
    /// Atomically admits an event or reports the existing duplicate.
    fn admit_event(&self, event: InboundEvent) -> StorageFuture<'_, Admission>;

    /// Finds an event by internal id.
    fn find_event(&self, event_id: EventId) -> StorageFuture<'_, Option<InboundEvent>>;

    /// Updates an event's lifecycle status.
    fn update_event_status(
        &self,
        event_id: EventId,
        status: EventStatus,
    ) -> StorageFuture<'_, ()>;

    /// Marks an event terminal with its completion time.
    fn mark_event_terminal(
        &self,
        event_id: EventId,
        status: EventStatus,
        processed_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Opens a processing attempt record.
    fn begin_attempt(
        &self,
        event_id: EventId,
        attempt_number: i32,
        started_at: DateTime<Utc>,
    ) -> StorageFuture<'_, Uuid>;

    /// Seals an attempt with its classified outcome.
    fn seal_attempt(
        &self,
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        completed_at: DateTime<Utc>,
        error_detail: Option<String>,
    ) -> StorageFuture<'_, ()>;

    /// Creates or reschedules the retry ticket for an event.
    fn schedule_retry(
        &self,
        event_id: EventId,
        next_attempt_at: DateTime<Utc>,
        attempts_so_far: i32,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Claims due tickets for a sweep worker.
    fn claim_due_tickets(
        &self,
        claimant: String,
        batch_size: usize,
        claim_staleness: Duration,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<RetryTicket>>;

    /// Deletes the ticket for an event, returning whether one existed.
    fn delete_ticket(&self, event_id: EventId) -> StorageFuture<'_, bool>;

    /// Releases a held claim without deleting the ticket.
    fn release_claim(&self, event_id: EventId, claimant: String) -> StorageFuture<'_, ()>;

    /// Finds the retry ticket for an event.
    fn find_ticket(&self, event_id: EventId) -> StorageFuture<'_, Option<RetryTicket>>;

    /// Idempotently promotes an event into the dead letter. `failure_count`
    /// is the number of attempts that failed; repeated promotion increments
    /// the stored count instead of replacing it.
    fn promote_dead_letter(
        &self,
        event_id: EventId,
        event_type: EventKind,
        last_error: String,
        failed_at: DateTime<Utc>,
        failure_count: i32,
    ) -> StorageFuture<'_, ()>;

    /// Finds the dead-letter entry for an event.
    fn find_dead_letter(&self, event_id: EventId) -> StorageFuture<'_, Option<DeadLetterEntry>>;

    /// Marks a dead-letter entry resolved.
    fn resolve_dead_letter(
        &self,
        event_id: EventId,
        resolution: Resolution,
        resolved_by: String,
        resolved_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Opens the audit record for an admitted event.
    fn audit_open(
        &self,
        event_id: EventId,
        signature_validated: bool,
        idempotency_checked: bool,
        created_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Records that a handler matched the event type.
    fn audit_handler_matched(&self, event_id: EventId) -> StorageFuture<'_, ()>;

    /// Records when processing began. Write-once.
    fn audit_processing_started(
        &self,
        event_id: EventId,
        started_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Records terminal completion and response status. Write-once.
    fn audit_processing_completed(
        &self,
        event_id: EventId,
        completed_at: DateTime<Utc>,
        response_status: i32,
    ) -> StorageFuture<'_, ()>;

    /// Finds the audit record for an event.
    fn find_audit(&self, event_id: EventId) -> StorageFuture<'_, Option<AuditRecord>>;
}

/// Production storage implementation delegating to the repositories.
pub struct PostgresPipelineStorage {
    storage: Arc<billhook_core::storage::Storage>,
}

impl PostgresPipelineStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<billhook_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl PipelineStorage for PostgresPipelineStorage {
    fn admit_event(&self, event: InboundEvent) -> StorageFuture<'_, Admission> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.inbound_events.admit(&event).await })
    }

    fn find_event(&self, event_id: EventId) -> StorageFuture<'_, Option<InboundEvent>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.inbound_events.find_by_id(event_id).await })
    }

    fn update_event_status(
        &self,
        event_id: EventId,
        status: EventStatus,
    ) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.inbound_events.update_status(event_id, status).await })
    }

    fn mark_event_terminal(
        &self,
        event_id: EventId,
        status: EventStatus,
        processed_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.inbound_events.mark_terminal(event_id, status, processed_at).await
        })
    }

    fn begin_attempt(
        &self,
        event_id: EventId,
        attempt_number: i32,
        started_at: DateTime<Utc>,
    ) -> StorageFuture<'_, Uuid> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.processing_attempts.begin(event_id, attempt_number, started_at).await
        })
    }

    fn seal_attempt(
        &self,
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        completed_at: DateTime<Utc>,
        error_detail: Option<String>,
    ) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .processing_attempts
                .seal(attempt_id, outcome, completed_at, error_detail.as_deref())
                .await
        })
    }

    fn schedule_retry(
        &self,
        event_id: EventId,
        next_attempt_at: DateTime<Utc>,
        attempts_so_far: i32,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .retry_tickets
                .schedule(event_id, next_attempt_at, attempts_so_far, max_attempts, now)
                .await
        })
    }

    fn claim_due_tickets(
        &self,
        claimant: String,
        batch_size: usize,
        claim_staleness: Duration,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<RetryTicket>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.retry_tickets.claim_due(&claimant, batch_size, claim_staleness, now).await
        })
    }

    fn delete_ticket(&self, event_id: EventId) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.retry_tickets.delete(event_id).await })
    }

    fn release_claim(&self, event_id: EventId, claimant: String) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.retry_tickets.release_claim(event_id, &claimant).await })
    }

    fn find_ticket(&self, event_id: EventId) -> StorageFuture<'_, Option<RetryTicket>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.retry_tickets.find_by_event(event_id).await })
    }

    fn promote_dead_letter(
        &self,
        event_id: EventId,
        event_type: EventKind,
        last_error: String,
        failed_at: DateTime<Utc>,
        failure_count: i32,
    ) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .dead_letters
                .promote(event_id, &event_type, &last_error, failed_at, failure_count)
                .await
        })
    }

    fn find_dead_letter(&self, event_id: EventId) -> StorageFuture<'_, Option<DeadLetterEntry>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.dead_letters.find_by_event(event_id).await })
    }

    fn resolve_dead_letter(
        &self,
        event_id: EventId,
        resolution: Resolution,
        resolved_by: String,
        resolved_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.dead_letters.resolve(event_id, resolution, &resolved_by, resolved_at).await
        })
    }

    fn audit_open(
        &self,
        event_id: EventId,
        signature_validated: bool,
        idempotency_checked: bool,
        created_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .audit_records
                .open(event_id, signature_validated, idempotency_checked, created_at)
                .await
        })
    }

    fn audit_handler_matched(&self, event_id: EventId) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.audit_records.mark_handler_matched(event_id).await })
    }

    fn audit_processing_started(
        &self,
        event_id: EventId,
        started_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.audit_records.mark_processing_started(event_id, started_at).await
        })
    }

    fn audit_processing_completed(
        &self,
        event_id: EventId,
        completed_at: DateTime<Utc>,
        response_status: i32,
    ) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .audit_records
                .mark_processing_completed(event_id, completed_at, response_status)
                .await
        })
    }

    fn find_audit(&self, event_id: EventId) -> StorageFuture<'_, Option<AuditRecord>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.audit_records.find_by_event(event_id).await })
    }
}

pub mod mock {
    //! In-memory storage for testing pipeline logic without a database.
    //!
    //! Reimplements the semantics the repositories guarantee: unique
    //! admission by `external_id`, claim exclusivity with staleness
    //! reclaim, idempotent promotion, and write-once audit fields. Supports
    //! failure injection for storage-unavailable paths.

    use std::collections::HashMap;

    use billhook_core::error::CoreError;
    use tokio::sync::RwLock;

    use super::*;

    #[derive(Default)]
    struct State {
        events: HashMap<EventId, InboundEvent>,
        by_external_id: HashMap<String, EventId>,
        attempts: Vec<ProcessingAttempt>,
        tickets: HashMap<EventId, RetryTicket>,
        dead_letters: HashMap<EventId, DeadLetterEntry>,
        audits: HashMap<EventId, AuditRecord>,
        fail_next: Option<String>,
    }

    /// Mock pipeline storage with deterministic in-memory state.
    pub struct MockPipelineStorage {
        state: Arc<RwLock<State>>,
    }

    impl MockPipelineStorage {
        /// Creates empty mock storage.
        pub fn new() -> Self {
            Self { state: Arc::new(RwLock::new(State::default())) }
        }

        /// Makes the next storage operation fail with a database error.
        pub async fn inject_failure(&self, message: impl Into<String>) {
            self.state.write().await.fail_next = Some(message.into());
        }

        /// Returns the stored event for verification.
        pub async fn event(&self, event_id: EventId) -> Option<InboundEvent> {
            self.state.read().await.events.get(&event_id).cloned()
        }

        /// Returns all attempts for an event, oldest first.
        pub async fn attempts_for(&self, event_id: EventId) -> Vec<ProcessingAttempt> {
            let state = self.state.read().await;
            let mut attempts: Vec<_> =
                state.attempts.iter().filter(|a| a.event_id == event_id).cloned().collect();
            attempts.sort_by_key(|a| a.attempt_number);
            attempts
        }

        /// Counts unresolved dead-letter entries.
        pub async fn unresolved_dead_letters(&self) -> usize {
            self.state.read().await.dead_letters.values().filter(|e| !e.resolved).count()
        }

        /// Counts audit records across all events.
        pub async fn audit_count(&self) -> usize {
            self.state.read().await.audits.len()
        }

        async fn take_injected_failure(&self) -> Result<()> {
            if let Some(message) = self.state.write().await.fail_next.take() {
                return Err(CoreError::Database(message));
            }
            Ok(())
        }
    }

    impl Default for MockPipelineStorage {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PipelineStorage for MockPipelineStorage {
        fn admit_event(&self, event: InboundEvent) -> StorageFuture<'_, Admission> {
            Box::pin(async move {
                self.take_injected_failure().await?;

                let mut state = self.state.write().await;
                if let Some(existing) = state.by_external_id.get(&event.external_id) {
                    return Ok(Admission::Duplicate(*existing));
                }

                state.by_external_id.insert(event.external_id.clone(), event.id);
                state.events.insert(event.id, event);
                Ok(Admission::Admitted)
            })
        }

        fn find_event(&self, event_id: EventId) -> StorageFuture<'_, Option<InboundEvent>> {
            Box::pin(async move { Ok(self.state.read().await.events.get(&event_id).cloned()) })
        }

        fn update_event_status(
            &self,
            event_id: EventId,
            status: EventStatus,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                if let Some(event) = self.state.write().await.events.get_mut(&event_id) {
                    event.status = status;
                }
                Ok(())
            })
        }

        fn mark_event_terminal(
            &self,
            event_id: EventId,
            status: EventStatus,
            processed_at: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let event = state
                    .events
                    .get_mut(&event_id)
                    .ok_or_else(|| CoreError::NotFound(format!("event {event_id} not found")))?;
                event.status = status;
                event.processed_at = Some(processed_at);
                Ok(())
            })
        }

        fn begin_attempt(
            &self,
            event_id: EventId,
            attempt_number: i32,
            started_at: DateTime<Utc>,
        ) -> StorageFuture<'_, Uuid> {
            Box::pin(async move {
                self.take_injected_failure().await?;

                let id = Uuid::new_v4();
                self.state.write().await.attempts.push(ProcessingAttempt {
                    id,
                    event_id,
                    attempt_number,
                    started_at,
                    completed_at: None,
                    outcome: None,
                    error_detail: None,
                });
                Ok(id)
            })
        }

        fn seal_attempt(
            &self,
            attempt_id: Uuid,
            outcome: AttemptOutcome,
            completed_at: DateTime<Utc>,
            error_detail: Option<String>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(attempt) = state
                    .attempts
                    .iter_mut()
                    .find(|a| a.id == attempt_id && a.completed_at.is_none())
                {
                    attempt.completed_at = Some(completed_at);
                    attempt.outcome = Some(outcome);
                    attempt.error_detail = error_detail;
                }
                Ok(())
            })
        }

        fn schedule_retry(
            &self,
            event_id: EventId,
            next_attempt_at: DateTime<Utc>,
            attempts_so_far: i32,
            max_attempts: i32,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let created_at =
                    state.tickets.get(&event_id).map_or(now, |existing| existing.created_at);
                state.tickets.insert(
                    event_id,
                    RetryTicket {
                        event_id,
                        next_attempt_at,
                        attempts_so_far,
                        max_attempts,
                        claimed_by: None,
                        claimed_at: None,
                        created_at,
                        updated_at: now,
                    },
                );
                Ok(())
            })
        }

        fn claim_due_tickets(
            &self,
            claimant: String,
            batch_size: usize,
            claim_staleness: Duration,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Vec<RetryTicket>> {
            Box::pin(async move {
                self.take_injected_failure().await?;

                let stale_before = now - claim_staleness;
                let mut state = self.state.write().await;

                let mut due: Vec<EventId> = state
                    .tickets
                    .values()
                    .filter(|t| {
                        t.next_attempt_at <= now
                            && t.claimed_at.map_or(true, |claimed| claimed < stale_before)
                    })
                    .map(|t| t.event_id)
                    .collect();
                due.sort_by_key(|id| {
                    state.tickets.get(id).map(|t| t.next_attempt_at).unwrap_or(now)
                });
                due.truncate(batch_size);

                let mut claimed = Vec::with_capacity(due.len());
                for event_id in due {
                    if let Some(ticket) = state.tickets.get_mut(&event_id) {
                        ticket.claimed_by = Some(claimant.clone());
                        ticket.claimed_at = Some(now);
                        claimed.push(ticket.clone());
                    }
                }
                Ok(claimed)
            })
        }

        fn delete_ticket(&self, event_id: EventId) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                Ok(self.state.write().await.tickets.remove(&event_id).is_some())
            })
        }

        fn release_claim(&self, event_id: EventId, claimant: String) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                if let Some(ticket) = self.state.write().await.tickets.get_mut(&event_id) {
                    if ticket.claimed_by.as_deref() == Some(claimant.as_str()) {
                        ticket.claimed_by = None;
                        ticket.claimed_at = None;
                    }
                }
                Ok(())
            })
        }

        fn find_ticket(&self, event_id: EventId) -> StorageFuture<'_, Option<RetryTicket>> {
            Box::pin(async move { Ok(self.state.read().await.tickets.get(&event_id).cloned()) })
        }

        fn promote_dead_letter(
            &self,
            event_id: EventId,
            event_type: EventKind,
            last_error: String,
            failed_at: DateTime<Utc>,
            failure_count: i32,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state
                    .dead_letters
                    .entry(event_id)
                    .and_modify(|entry| {
                        entry.last_failed_at = failed_at;
                        entry.failure_count += 1;
                        entry.last_error = last_error.clone();
                        entry.resolved = false;
                        entry.resolution = None;
                        entry.resolved_by = None;
                        entry.resolved_at = None;
                        entry.requires_manual_review = true;
                    })
                    .or_insert_with(|| DeadLetterEntry {
                        event_id,
                        event_type,
                        first_failed_at: failed_at,
                        last_failed_at: failed_at,
                        failure_count: failure_count.max(1),
                        last_error,
                        resolved: false,
                        resolution: None,
                        resolved_by: None,
                        resolved_at: None,
                        requires_manual_review: true,
                    });
                Ok(())
            })
        }

        fn find_dead_letter(
            &self,
            event_id: EventId,
        ) -> StorageFuture<'_, Option<DeadLetterEntry>> {
            Box::pin(async move {
                Ok(self.state.read().await.dead_letters.get(&event_id).cloned())
            })
        }

        fn resolve_dead_letter(
            &self,
            event_id: EventId,
            resolution: Resolution,
            resolved_by: String,
            resolved_at: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let entry = state.dead_letters.get_mut(&event_id).ok_or_else(|| {
                    CoreError::NotFound(format!("no dead-letter entry for event {event_id}"))
                })?;
                entry.resolved = true;
                entry.resolution = Some(resolution);
                entry.resolved_by = Some(resolved_by);
                entry.resolved_at = Some(resolved_at);
                entry.requires_manual_review = false;
                Ok(())
            })
        }

        fn audit_open(
            &self,
            event_id: EventId,
            signature_validated: bool,
            idempotency_checked: bool,
            created_at: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.take_injected_failure().await?;

                self.state.write().await.audits.entry(event_id).or_insert(AuditRecord {
                    event_id,
                    signature_validated,
                    idempotency_checked,
                    handler_matched: false,
                    processing_started_at: None,
                    processing_completed_at: None,
                    response_status: None,
                    created_at,
                });
                Ok(())
            })
        }

        fn audit_handler_matched(&self, event_id: EventId) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                if let Some(record) = self.state.write().await.audits.get_mut(&event_id) {
                    record.handler_matched = true;
                }
                Ok(())
            })
        }

        fn audit_processing_started(
            &self,
            event_id: EventId,
            started_at: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                if let Some(record) = self.state.write().await.audits.get_mut(&event_id) {
                    record.processing_started_at.get_or_insert(started_at);
                }
                Ok(())
            })
        }

        fn audit_processing_completed(
            &self,
            event_id: EventId,
            completed_at: DateTime<Utc>,
            response_status: i32,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                if let Some(record) = self.state.write().await.audits.get_mut(&event_id) {
                    if record.processing_completed_at.is_none() {
                        record.processing_completed_at = Some(completed_at);
                        record.response_status = Some(response_status);
                    }
                }
                Ok(())
            })
        }

        fn find_audit(&self, event_id: EventId) -> StorageFuture<'_, Option<AuditRecord>> {
            Box::pin(async move { Ok(self.state.read().await.audits.get(&event_id).cloned()) })
        }
    }
}
