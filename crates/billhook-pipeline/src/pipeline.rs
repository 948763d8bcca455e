//! End-to-end processing of admitted events.
//!
//! `ProcessingPipeline` drives an event through admission, routing, handler
//! execution, and outcome classification. It is shared between ingestion
//! (first attempt, inline) and the retry scheduler (subsequent attempts,
//! from sweep workers), so the two paths cannot diverge in semantics.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use billhook_core::{
    error::Result,
    models::{Admission, AttemptOutcome, EventId, EventKind, EventStatus, InboundEvent},
    Clock,
};

use crate::{
    audit::AuditRecorder,
    error::HandlerError,
    retry::{RetryContext, RetryDecision, RetryPolicy},
    router::{EventRouter, RouteTarget},
    storage::PipelineStorage,
    verify::VerifiedEnvelope,
};

/// Default ceiling on a single handler invocation.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of ingesting one notification, shaped for the HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Internal id of the (new or previously admitted) event.
    pub event_id: EventId,
    /// Declared event type.
    pub event_type: EventKind,
    /// Whether a handler completed successfully during this request.
    pub processed: bool,
    /// Whether the notification was a duplicate delivery.
    pub duplicate: bool,
}

/// Outcome of a single processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    /// Handler completed; the event is terminal.
    Succeeded,
    /// Transient failure; a retry ticket is scheduled.
    RetryScheduled {
        /// Earliest time for the next attempt.
        next_attempt_at: DateTime<Utc>,
    },
    /// Permanent failure or exhausted budget; the event is quarantined.
    DeadLettered,
}

/// Drives events through routing, execution, and outcome recording.
pub struct ProcessingPipeline {
    storage: Arc<dyn PipelineStorage>,
    router: Arc<EventRouter>,
    recorder: Arc<AuditRecorder>,
    policy: RetryPolicy,
    handler_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl ProcessingPipeline {
    /// Creates a pipeline over the given router and storage.
    pub fn new(
        storage: Arc<dyn PipelineStorage>,
        router: Arc<EventRouter>,
        recorder: Arc<AuditRecorder>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            router,
            recorder,
            policy,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            clock,
        }
    }

    /// Overrides the per-invocation handler timeout.
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Retry policy in effect, needed by manual-retry flows.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Ingests an authenticated envelope: admit, route, run the first
    /// attempt.
    ///
    /// Duplicates are acknowledged without touching any handler. Unknown
    /// event types are accepted, logged, and marked terminal without a
    /// handler invocation.
    ///
    /// # Errors
    ///
    /// Returns an error only when storage cannot durably track the event;
    /// handler failures are internal outcomes, not caller errors.
    #[instrument(skip(self, envelope), fields(external_id = %envelope.external_id, event_type = %envelope.event_type))]
    pub async fn process_new(&self, envelope: VerifiedEnvelope) -> Result<IngestOutcome> {
        let now = self.clock.now_utc();
        let event = InboundEvent::new(
            envelope.external_id,
            envelope.event_type,
            envelope.payload,
            now,
        );

        match self.storage.admit_event(event.clone()).await? {
            Admission::Duplicate(existing_id) => {
                info!(event_id = %existing_id, "duplicate delivery acknowledged");
                return Ok(IngestOutcome {
                    event_id: existing_id,
                    event_type: event.event_type,
                    processed: false,
                    duplicate: true,
                });
            },
            Admission::Admitted => {},
        }

        self.recorder.record_admission(event.id, true, now).await;

        if !self.router.handles(&event.event_type) {
            // Accepted but nothing to run. The processor's catalog grows
            // independently of this service.
            info!(event_id = %event.id, event_type = %event.event_type, "no handler registered, event accepted");
            self.storage
                .mark_event_terminal(event.id, EventStatus::Succeeded, self.clock.now_utc())
                .await?;
            self.recorder
                .record_processing_completed(event.id, self.clock.now_utc(), 200)
                .await;
            return Ok(IngestOutcome {
                event_id: event.id,
                event_type: event.event_type,
                processed: true,
                duplicate: false,
            });
        }

        self.recorder.record_handler_matched(event.id).await;

        let result = self.execute_attempt(&event, 1).await?;
        Ok(IngestOutcome {
            event_id: event.id,
            event_type: event.event_type,
            processed: result == AttemptResult::Succeeded,
            duplicate: false,
        })
    }

    /// Runs one processing attempt for an already admitted event.
    ///
    /// Shared by ingestion (attempt 1) and the retry scheduler (attempts
    /// 2..=max). Seals the attempt record, then applies the outcome: delete
    /// the ticket on success, reschedule with backoff on transient failure,
    /// promote to the dead letter on permanent failure or exhaustion.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn execute_attempt(
        &self,
        event: &InboundEvent,
        attempt_number: i32,
    ) -> Result<AttemptResult> {
        let started_at = self.clock.now_utc();

        self.storage.update_event_status(event.id, EventStatus::Processing).await?;
        self.recorder.record_processing_started(event.id, started_at).await;
        let attempt_id = self.storage.begin_attempt(event.id, attempt_number, started_at).await?;

        let outcome = self.invoke_handler(event).await;
        let completed_at = self.clock.now_utc();

        match outcome {
            Ok(effect) => {
                self.storage
                    .seal_attempt(attempt_id, AttemptOutcome::Success, completed_at, None)
                    .await?;
                self.storage.delete_ticket(event.id).await?;
                self.storage
                    .mark_event_terminal(event.id, EventStatus::Succeeded, completed_at)
                    .await?;
                self.recorder.record_processing_completed(event.id, completed_at, 200).await;

                info!(
                    event_id = %event.id,
                    attempt_number,
                    effect = %effect,
                    "event processed"
                );
                Ok(AttemptResult::Succeeded)
            },
            Err(error) => {
                let attempt_outcome = if error.is_transient() {
                    AttemptOutcome::TransientFailure
                } else {
                    AttemptOutcome::PermanentFailure
                };
                self.storage
                    .seal_attempt(
                        attempt_id,
                        attempt_outcome,
                        completed_at,
                        Some(error.message().to_string()),
                    )
                    .await?;

                self.apply_failure(event, attempt_number, error, completed_at).await
            },
        }
    }

    async fn invoke_handler(&self, event: &InboundEvent) -> std::result::Result<crate::router::HandlerEffect, HandlerError> {
        let handler = match self.router.route(&event.event_type) {
            RouteTarget::Handler(handler) => handler.clone(),
            // Only reachable through a manual retry of an event whose
            // handler was since unregistered.
            RouteTarget::Unhandled => {
                return Err(HandlerError::permanent(format!(
                    "no handler registered for {}",
                    event.event_type
                )));
            },
        };

        match tokio::time::timeout(self.handler_timeout, handler.handle(event)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::transient(format!(
                "handler timed out after {}s",
                self.handler_timeout.as_secs()
            ))),
        }
    }

    async fn apply_failure(
        &self,
        event: &InboundEvent,
        attempt_number: i32,
        error: HandlerError,
        failed_at: DateTime<Utc>,
    ) -> Result<AttemptResult> {
        let context = RetryContext::new(
            attempt_number.max(0) as u32,
            error.clone(),
            failed_at,
            self.policy.clone(),
        );

        match context.decide_retry() {
            RetryDecision::Retry { next_attempt_at } => {
                self.storage
                    .schedule_retry(
                        event.id,
                        next_attempt_at,
                        attempt_number,
                        self.policy.max_attempts as i32,
                        failed_at,
                    )
                    .await?;
                self.storage.update_event_status(event.id, EventStatus::Pending).await?;

                warn!(
                    event_id = %event.id,
                    attempt_number,
                    error = %error,
                    next_attempt_at = %next_attempt_at,
                    "attempt failed, retry scheduled"
                );
                Ok(AttemptResult::RetryScheduled { next_attempt_at })
            },
            RetryDecision::GiveUp { reason } => {
                self.storage.delete_ticket(event.id).await?;
                self.storage
                    .promote_dead_letter(
                        event.id,
                        event.event_type.clone(),
                        error.message().to_string(),
                        failed_at,
                        attempt_number,
                    )
                    .await?;
                self.storage
                    .mark_event_terminal(event.id, EventStatus::DeadLettered, failed_at)
                    .await?;
                self.recorder.record_processing_completed(event.id, failed_at, 200).await;

                warn!(
                    event_id = %event.id,
                    attempt_number,
                    reason,
                    "event dead-lettered"
                );
                Ok(AttemptResult::DeadLettered)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use billhook_core::{EventKind, RealClock};

    use crate::{
        router::{EventHandler, HandlerEffect, HandlerFuture},
        storage::mock::MockPipelineStorage,
    };

    use super::*;

    /// Handler failing transiently until `failures` attempts have happened.
    struct FlakyHandler {
        kind: EventKind,
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyHandler {
        fn new(kind: EventKind, failures: u32) -> Self {
            Self { kind, failures, calls: AtomicU32::new(0) }
        }
    }

    impl EventHandler for FlakyHandler {
        fn kind(&self) -> EventKind {
            self.kind.clone()
        }

        fn handle<'a>(&'a self, _event: &'a InboundEvent) -> HandlerFuture<'a> {
            Box::pin(async {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.failures {
                    Err(HandlerError::transient("downstream 503"))
                } else {
                    Ok(HandlerEffect::new("recorded"))
                }
            })
        }
    }

    struct PermanentHandler;

    impl EventHandler for PermanentHandler {
        fn kind(&self) -> EventKind {
            EventKind::InvoiceFinalized
        }

        fn handle<'a>(&'a self, _event: &'a InboundEvent) -> HandlerFuture<'a> {
            Box::pin(async { Err(HandlerError::permanent("malformed invoice reference")) })
        }
    }

    fn pipeline_with(
        storage: Arc<MockPipelineStorage>,
        router: EventRouter,
    ) -> ProcessingPipeline {
        let recorder = Arc::new(AuditRecorder::new(storage.clone()));
        ProcessingPipeline::new(
            storage,
            Arc::new(router),
            recorder,
            RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() },
            Arc::new(RealClock),
        )
    }

    fn envelope(external_id: &str, kind: &str) -> VerifiedEnvelope {
        VerifiedEnvelope {
            external_id: external_id.to_string(),
            event_type: EventKind::parse(kind),
            payload: json!({"charge": "ch_1"}),
            created: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn successful_event_is_terminal_with_audit() {
        let storage = Arc::new(MockPipelineStorage::new());
        let router = EventRouter::builder()
            .register(Arc::new(FlakyHandler::new(EventKind::PaymentSucceeded, 0)))
            .unwrap()
            .build();
        let pipeline = pipeline_with(storage.clone(), router);

        let outcome = pipeline.process_new(envelope("evt_1", "payment_succeeded")).await.unwrap();
        assert!(outcome.processed);
        assert!(!outcome.duplicate);

        let event = storage.event(outcome.event_id).await.unwrap();
        assert_eq!(event.status, EventStatus::Succeeded);
        assert!(event.processed_at.is_some());

        let audit = storage.find_audit(outcome.event_id).await.unwrap().unwrap();
        assert!(audit.signature_validated);
        assert!(audit.handler_matched);
        assert_eq!(audit.response_status, Some(200));
    }

    #[tokio::test]
    async fn duplicate_is_acknowledged_without_second_attempt() {
        let storage = Arc::new(MockPipelineStorage::new());
        let router = EventRouter::builder()
            .register(Arc::new(FlakyHandler::new(EventKind::PaymentSucceeded, 0)))
            .unwrap()
            .build();
        let pipeline = pipeline_with(storage.clone(), router);

        let first = pipeline.process_new(envelope("evt_1", "payment_succeeded")).await.unwrap();
        let second = pipeline.process_new(envelope("evt_1", "payment_succeeded")).await.unwrap();

        assert!(second.duplicate);
        assert!(!second.processed);
        assert_eq!(second.event_id, first.event_id);
        assert_eq!(storage.attempts_for(first.event_id).await.len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_schedules_retry() {
        let storage = Arc::new(MockPipelineStorage::new());
        let router = EventRouter::builder()
            .register(Arc::new(FlakyHandler::new(EventKind::PaymentFailed, 3)))
            .unwrap()
            .build();
        let pipeline = pipeline_with(storage.clone(), router);

        let outcome = pipeline.process_new(envelope("evt_2", "payment_failed")).await.unwrap();
        assert!(!outcome.processed);
        assert!(!outcome.duplicate);

        let event = storage.event(outcome.event_id).await.unwrap();
        assert_eq!(event.status, EventStatus::Pending);

        let ticket = storage.find_ticket(outcome.event_id).await.unwrap().unwrap();
        assert_eq!(ticket.attempts_so_far, 1);
        assert_eq!(ticket.max_attempts, 5);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_immediately() {
        let storage = Arc::new(MockPipelineStorage::new());
        let router =
            EventRouter::builder().register(Arc::new(PermanentHandler)).unwrap().build();
        let pipeline = pipeline_with(storage.clone(), router);

        let outcome = pipeline.process_new(envelope("evt_3", "invoice_finalized")).await.unwrap();
        assert!(!outcome.processed);

        let event = storage.event(outcome.event_id).await.unwrap();
        assert_eq!(event.status, EventStatus::DeadLettered);

        let entry = storage.find_dead_letter(outcome.event_id).await.unwrap().unwrap();
        assert_eq!(entry.failure_count, 1);
        assert!(entry.requires_manual_review);
        assert!(storage.find_ticket(outcome.event_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_event_type_is_accepted_and_terminal() {
        let storage = Arc::new(MockPipelineStorage::new());
        let pipeline = pipeline_with(storage.clone(), EventRouter::builder().build());

        let outcome =
            pipeline.process_new(envelope("evt_4", "customer.discount.created")).await.unwrap();
        assert!(outcome.processed);

        let event = storage.event(outcome.event_id).await.unwrap();
        assert_eq!(event.status, EventStatus::Succeeded);

        let audit = storage.find_audit(outcome.event_id).await.unwrap().unwrap();
        assert!(!audit.handler_matched);
        assert!(storage.attempts_for(outcome.event_id).await.is_empty());
    }

    #[tokio::test]
    async fn handler_timeout_is_transient() {
        struct SlowHandler;

        impl EventHandler for SlowHandler {
            fn kind(&self) -> EventKind {
                EventKind::PaymentSucceeded
            }

            fn handle<'a>(&'a self, _event: &'a InboundEvent) -> HandlerFuture<'a> {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(HandlerEffect::new("too late"))
                })
            }
        }

        let storage = Arc::new(MockPipelineStorage::new());
        let router = EventRouter::builder().register(Arc::new(SlowHandler)).unwrap().build();
        let pipeline = pipeline_with(storage.clone(), router)
            .with_handler_timeout(Duration::from_millis(20));

        let outcome = pipeline.process_new(envelope("evt_5", "payment_succeeded")).await.unwrap();
        assert!(!outcome.processed);

        let attempts = storage.attempts_for(outcome.event_id).await;
        assert_eq!(attempts[0].outcome, Some(AttemptOutcome::TransientFailure));
        assert!(storage.find_ticket(outcome.event_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn storage_failure_on_admit_propagates() {
        let storage = Arc::new(MockPipelineStorage::new());
        let pipeline = pipeline_with(storage.clone(), EventRouter::builder().build());

        storage.inject_failure("pool exhausted").await;

        assert!(pipeline.process_new(envelope("evt_6", "payment_failed")).await.is_err());
    }
}
