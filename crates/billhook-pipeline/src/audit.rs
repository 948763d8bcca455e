//! Non-blocking audit recording.
//!
//! Audit writes never fail the critical path: a storage error is logged and
//! processing continues. Consecutive failures are counted, and crossing the
//! alert threshold emits an operational error log so a silent audit outage
//! does not go unnoticed. Any success resets the counter.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use billhook_core::{error::Result, EventId};

use crate::storage::PipelineStorage;

/// Consecutive failures before the operational alert fires.
pub const DEFAULT_ALERT_THRESHOLD: u32 = 5;

/// Records processing stages to the audit trail without blocking callers.
pub struct AuditRecorder {
    storage: Arc<dyn PipelineStorage>,
    consecutive_failures: AtomicU32,
    alert_threshold: u32,
}

impl AuditRecorder {
    /// Creates a recorder with the default alert threshold.
    pub fn new(storage: Arc<dyn PipelineStorage>) -> Self {
        Self::with_alert_threshold(storage, DEFAULT_ALERT_THRESHOLD)
    }

    /// Creates a recorder with a custom alert threshold.
    pub fn with_alert_threshold(storage: Arc<dyn PipelineStorage>, alert_threshold: u32) -> Self {
        Self { storage, consecutive_failures: AtomicU32::new(0), alert_threshold }
    }

    /// Opens the audit record for a newly admitted event.
    pub async fn record_admission(
        &self,
        event_id: EventId,
        signature_validated: bool,
        created_at: DateTime<Utc>,
    ) {
        self.swallow(
            event_id,
            "admission",
            self.storage.audit_open(event_id, signature_validated, true, created_at).await,
        );
    }

    /// Records that a handler matched the event type.
    pub async fn record_handler_matched(&self, event_id: EventId) {
        self.swallow(
            event_id,
            "handler_matched",
            self.storage.audit_handler_matched(event_id).await,
        );
    }

    /// Records when the first handler invocation began.
    pub async fn record_processing_started(&self, event_id: EventId, started_at: DateTime<Utc>) {
        self.swallow(
            event_id,
            "processing_started",
            self.storage.audit_processing_started(event_id, started_at).await,
        );
    }

    /// Records terminal completion and the response status.
    pub async fn record_processing_completed(
        &self,
        event_id: EventId,
        completed_at: DateTime<Utc>,
        response_status: i32,
    ) {
        self.swallow(
            event_id,
            "processing_completed",
            self.storage
                .audit_processing_completed(event_id, completed_at, response_status)
                .await,
        );
    }

    /// Current consecutive failure count, for health reporting.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    fn swallow(&self, event_id: EventId, stage: &str, result: Result<()>) {
        match result {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            },
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(%event_id, stage, error = %e, "audit write failed, continuing");
                if failures >= self.alert_threshold {
                    error!(
                        consecutive_failures = failures,
                        threshold = self.alert_threshold,
                        "audit trail is not being recorded"
                    );
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::storage::mock::MockPipelineStorage;

    #[tokio::test]
    async fn audit_failure_does_not_propagate() {
        let storage = Arc::new(MockPipelineStorage::new());
        let recorder = AuditRecorder::new(storage.clone());

        storage.inject_failure("audit table missing").await;

        // Must not panic or return an error.
        recorder.record_admission(EventId::new(), true, Utc::now()).await;
        assert_eq!(recorder.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        let storage = Arc::new(MockPipelineStorage::new());
        let recorder = AuditRecorder::with_alert_threshold(storage.clone(), 3);

        storage.inject_failure("transient outage").await;
        recorder.record_admission(EventId::new(), true, Utc::now()).await;
        assert_eq!(recorder.consecutive_failures(), 1);

        recorder.record_admission(EventId::new(), true, Utc::now()).await;
        assert_eq!(recorder.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn stages_are_write_once() {
        let storage = Arc::new(MockPipelineStorage::new());
        let recorder = AuditRecorder::new(storage.clone());
        let event_id = EventId::new();

        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(10);

        recorder.record_admission(event_id, true, t0).await;
        recorder.record_processing_started(event_id, t0).await;
        recorder.record_processing_started(event_id, t1).await;

        let record = storage.find_audit(event_id).await.unwrap().unwrap();
        assert_eq!(record.processing_started_at, Some(t0));
    }
}
