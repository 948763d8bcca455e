//! Manual intervention on quarantined events.
//!
//! Operators resolve dead-letter entries or push an event back through the
//! pipeline. Manual retry re-enters at the router stage with a fresh attempt
//! counter, and the idempotency guard's duplicate semantics still hold: an
//! event that already succeeded is never applied twice.

use std::sync::Arc;

use tracing::info;

use billhook_core::{EventId, EventStatus, Resolution};

use crate::{
    error::{PipelineError, Result},
    pipeline::{AttemptResult, ProcessingPipeline},
    storage::PipelineStorage,
};

/// Outcome of a manual retry request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualRetryOutcome {
    /// The retried attempt succeeded; the entry is resolved.
    Reprocessed,
    /// The attempt failed transiently; the scheduler owns it again.
    RetryScheduled,
    /// The attempt failed again; the entry remains quarantined.
    StillFailing,
    /// The event had already succeeded; nothing was re-applied.
    AlreadySucceeded,
}

/// Resolution and retry operations over dead-letter entries.
pub struct DeadLetterService {
    storage: Arc<dyn PipelineStorage>,
    pipeline: Arc<ProcessingPipeline>,
}

impl DeadLetterService {
    /// Creates the service.
    pub fn new(storage: Arc<dyn PipelineStorage>, pipeline: Arc<ProcessingPipeline>) -> Self {
        Self { storage, pipeline }
    }

    /// Marks an entry resolved without reprocessing.
    ///
    /// # Errors
    ///
    /// Returns `EventNotFound` if no entry exists for the event.
    pub async fn resolve(
        &self,
        event_id: EventId,
        resolution: Resolution,
        resolved_by: &str,
        resolved_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        self.storage
            .resolve_dead_letter(event_id, resolution, resolved_by.to_string(), resolved_at)
            .await
            .map_err(|e| match e {
                billhook_core::CoreError::NotFound(_) => {
                    PipelineError::EventNotFound { event_id: event_id.to_string() }
                },
                other => PipelineError::Storage(other),
            })?;

        info!(%event_id, %resolution, resolved_by, "dead-letter entry resolved");
        Ok(())
    }

    /// Re-runs a quarantined event with a fresh attempt counter.
    ///
    /// The counter restarts at 1, so the event gets the full retry budget
    /// again. An event that already reached `succeeded` is skipped; the
    /// guard's semantics make double-application impossible.
    ///
    /// # Errors
    ///
    /// Returns `EventNotFound` if the event or its entry is missing, or a
    /// storage error from the attempt itself.
    pub async fn manual_retry(
        &self,
        event_id: EventId,
        requested_by: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<ManualRetryOutcome> {
        let event = self
            .storage
            .find_event(event_id)
            .await?
            .ok_or_else(|| PipelineError::EventNotFound { event_id: event_id.to_string() })?;

        if self.storage.find_dead_letter(event_id).await?.is_none() {
            return Err(PipelineError::EventNotFound { event_id: event_id.to_string() });
        }

        if event.status == EventStatus::Succeeded {
            info!(%event_id, requested_by, "manual retry skipped, event already succeeded");
            return Ok(ManualRetryOutcome::AlreadySucceeded);
        }

        info!(%event_id, requested_by, "manual retry started");
        match self.pipeline.execute_attempt(&event, 1).await? {
            AttemptResult::Succeeded => {
                self.storage
                    .resolve_dead_letter(
                        event_id,
                        Resolution::Reprocessed,
                        requested_by.to_string(),
                        now,
                    )
                    .await?;
                Ok(ManualRetryOutcome::Reprocessed)
            },
            AttemptResult::RetryScheduled { .. } => Ok(ManualRetryOutcome::RetryScheduled),
            AttemptResult::DeadLettered => Ok(ManualRetryOutcome::StillFailing),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::Utc;
    use serde_json::json;

    use billhook_core::{EventKind, InboundEvent, RealClock};

    use crate::{
        audit::AuditRecorder,
        error::HandlerError,
        retry::RetryPolicy,
        router::{EventHandler, EventRouter, HandlerEffect, HandlerFuture},
        storage::mock::MockPipelineStorage,
        verify::VerifiedEnvelope,
    };

    use super::*;

    /// Handler whose behavior can be flipped between runs, modeling an
    /// upstream outage that an operator later sees resolved.
    struct SwitchableHandler {
        healthy: Arc<AtomicBool>,
    }

    impl EventHandler for SwitchableHandler {
        fn kind(&self) -> EventKind {
            EventKind::PaymentSucceeded
        }

        fn handle<'a>(&'a self, _event: &'a InboundEvent) -> HandlerFuture<'a> {
            Box::pin(async {
                if self.healthy.load(Ordering::SeqCst) {
                    Ok(HandlerEffect::new("recorded"))
                } else {
                    Err(HandlerError::permanent("ledger rejected entry"))
                }
            })
        }
    }

    struct Fixture {
        storage: Arc<MockPipelineStorage>,
        service: DeadLetterService,
        healthy: Arc<AtomicBool>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MockPipelineStorage::new());
        let healthy = Arc::new(AtomicBool::new(false));
        let router = EventRouter::builder()
            .register(Arc::new(SwitchableHandler { healthy: healthy.clone() }))
            .unwrap()
            .build();
        let recorder = Arc::new(AuditRecorder::new(storage.clone()));
        let pipeline = Arc::new(ProcessingPipeline::new(
            storage.clone(),
            Arc::new(router),
            recorder,
            RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() },
            Arc::new(RealClock),
        ));
        let service = DeadLetterService::new(storage.clone(), pipeline.clone());
        Fixture { storage, service, healthy }
    }

    async fn dead_letter_an_event(fixture: &Fixture) -> EventId {
        let pipeline = ProcessingPipeline::new(
            fixture.storage.clone(),
            Arc::new(
                EventRouter::builder()
                    .register(Arc::new(SwitchableHandler { healthy: fixture.healthy.clone() }))
                    .unwrap()
                    .build(),
            ),
            Arc::new(AuditRecorder::new(fixture.storage.clone())),
            RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() },
            Arc::new(RealClock),
        );
        let outcome = pipeline
            .process_new(VerifiedEnvelope {
                external_id: "evt_dl".to_string(),
                event_type: EventKind::PaymentSucceeded,
                payload: json!({"charge": "ch_1"}),
                created: 1_700_000_000,
            })
            .await
            .unwrap();
        outcome.event_id
    }

    #[tokio::test]
    async fn manual_retry_reprocesses_after_fix() {
        let fixture = fixture();
        let event_id = dead_letter_an_event(&fixture).await;
        assert_eq!(fixture.storage.unresolved_dead_letters().await, 1);

        fixture.healthy.store(true, Ordering::SeqCst);
        let outcome =
            fixture.service.manual_retry(event_id, "ops@example.com", Utc::now()).await.unwrap();

        assert_eq!(outcome, ManualRetryOutcome::Reprocessed);
        assert_eq!(fixture.storage.unresolved_dead_letters().await, 0);

        let entry = fixture.storage.find_dead_letter(event_id).await.unwrap().unwrap();
        assert_eq!(entry.resolution, Some(Resolution::Reprocessed));
        assert_eq!(entry.resolved_by.as_deref(), Some("ops@example.com"));
    }

    #[tokio::test]
    async fn manual_retry_of_still_broken_event_stays_quarantined() {
        let fixture = fixture();
        let event_id = dead_letter_an_event(&fixture).await;

        let outcome =
            fixture.service.manual_retry(event_id, "ops@example.com", Utc::now()).await.unwrap();

        assert_eq!(outcome, ManualRetryOutcome::StillFailing);
        assert_eq!(fixture.storage.unresolved_dead_letters().await, 1);
    }

    #[tokio::test]
    async fn manual_retry_skips_succeeded_event() {
        let fixture = fixture();
        let event_id = dead_letter_an_event(&fixture).await;

        // Another path already completed the event.
        fixture
            .storage
            .mark_event_terminal(event_id, EventStatus::Succeeded, Utc::now())
            .await
            .unwrap();

        let outcome =
            fixture.service.manual_retry(event_id, "ops@example.com", Utc::now()).await.unwrap();
        assert_eq!(outcome, ManualRetryOutcome::AlreadySucceeded);
    }

    #[tokio::test]
    async fn resolve_discards_entry() {
        let fixture = fixture();
        let event_id = dead_letter_an_event(&fixture).await;

        fixture
            .service
            .resolve(event_id, Resolution::Discarded, "ops@example.com", Utc::now())
            .await
            .unwrap();

        let entry = fixture.storage.find_dead_letter(event_id).await.unwrap().unwrap();
        assert!(entry.resolved);
        assert_eq!(entry.resolution, Some(Resolution::Discarded));
        assert!(!entry.requires_manual_review);
    }

    #[tokio::test]
    async fn unknown_event_is_not_found() {
        let fixture = fixture();

        let err = fixture
            .service
            .manual_retry(EventId::new(), "ops@example.com", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EventNotFound { .. }));
    }
}
