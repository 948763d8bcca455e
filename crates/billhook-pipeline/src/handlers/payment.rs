//! Handlers for payment lifecycle events.
//!
//! Both handlers cross-check the charge against the processor API before
//! recording the outcome: a notification can race the processor's own state,
//! and billing state must follow what the processor reports, not what the
//! notification claims.

use std::sync::Arc;

use tracing::{info, warn};

use billhook_core::{EventKind, InboundEvent};

use crate::{
    error::HandlerError,
    handlers::require_str,
    processor::ProcessorApi,
    router::{EventHandler, HandlerEffect, HandlerFuture},
};

/// Marks the invoice paid and extends the subscription period when a charge
/// settles.
pub struct PaymentSucceededHandler {
    processor: Arc<dyn ProcessorApi>,
}

impl PaymentSucceededHandler {
    /// Creates the handler with a processor API client for confirmation.
    pub fn new(processor: Arc<dyn ProcessorApi>) -> Self {
        Self { processor }
    }

    async fn process(&self, event: &InboundEvent) -> Result<HandlerEffect, HandlerError> {
        let charge_id = require_str(&event.payload, "charge", &event.event_type)?;

        let charge = self.processor.fetch_object(charge_id).await?;
        if charge.status != "succeeded" {
            // The processor disagrees with its own notification; its view
            // wins, and a later notification will carry the real outcome.
            warn!(
                event_id = %event.id,
                charge_id,
                processor_status = %charge.status,
                "charge not settled on processor side, skipping"
            );
            return Ok(HandlerEffect::new("payment_unconfirmed").with_entity(charge_id));
        }

        info!(event_id = %event.id, charge_id, "payment recorded");
        Ok(HandlerEffect::new("payment_recorded").with_entity(charge_id))
    }
}

impl EventHandler for PaymentSucceededHandler {
    fn kind(&self) -> EventKind {
        EventKind::PaymentSucceeded
    }

    fn handle<'a>(&'a self, event: &'a InboundEvent) -> HandlerFuture<'a> {
        Box::pin(self.process(event))
    }
}

/// Records a failed charge and flags the subscription for dunning.
pub struct PaymentFailedHandler {
    processor: Arc<dyn ProcessorApi>,
}

impl PaymentFailedHandler {
    /// Creates the handler with a processor API client for confirmation.
    pub fn new(processor: Arc<dyn ProcessorApi>) -> Self {
        Self { processor }
    }

    async fn process(&self, event: &InboundEvent) -> Result<HandlerEffect, HandlerError> {
        let charge_id = require_str(&event.payload, "charge", &event.event_type)?;

        let charge = self.processor.fetch_object(charge_id).await?;
        if charge.status == "succeeded" {
            // A retry on the processor side settled the charge after the
            // failure notification was queued. Nothing to dun.
            info!(event_id = %event.id, charge_id, "charge settled after failure notice");
            return Ok(HandlerEffect::new("payment_failure_superseded").with_entity(charge_id));
        }

        warn!(event_id = %event.id, charge_id, "payment failure recorded, dunning flagged");
        Ok(HandlerEffect::new("dunning_started").with_entity(charge_id))
    }
}

impl EventHandler for PaymentFailedHandler {
    fn kind(&self) -> EventKind {
        EventKind::PaymentFailed
    }

    fn handle<'a>(&'a self, event: &'a InboundEvent) -> HandlerFuture<'a> {
        Box::pin(self.process(event))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::handlers::testing::{event, StubProcessor};

    #[tokio::test]
    async fn confirmed_payment_is_recorded() {
        let handler = PaymentSucceededHandler::new(Arc::new(StubProcessor { status: "succeeded" }));
        let event = event(EventKind::PaymentSucceeded, json!({"charge": "ch_1"}));

        let effect = handler.handle(&event).await.unwrap();
        assert_eq!(effect, HandlerEffect::new("payment_recorded").with_entity("ch_1"));
    }

    #[tokio::test]
    async fn unconfirmed_payment_is_skipped_not_failed() {
        let handler = PaymentSucceededHandler::new(Arc::new(StubProcessor { status: "pending" }));
        let event = event(EventKind::PaymentSucceeded, json!({"charge": "ch_1"}));

        let effect = handler.handle(&event).await.unwrap();
        assert_eq!(effect.action, "payment_unconfirmed");
    }

    #[tokio::test]
    async fn missing_charge_field_is_permanent() {
        let handler = PaymentSucceededHandler::new(Arc::new(StubProcessor { status: "succeeded" }));
        let event = event(EventKind::PaymentSucceeded, json!({"amount": 4200}));

        let err = handler.handle(&event).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn settled_charge_supersedes_failure_notice() {
        let handler = PaymentFailedHandler::new(Arc::new(StubProcessor { status: "succeeded" }));
        let event = event(EventKind::PaymentFailed, json!({"charge": "ch_9"}));

        let effect = handler.handle(&event).await.unwrap();
        assert_eq!(effect.action, "payment_failure_superseded");
    }

    #[tokio::test]
    async fn failed_charge_starts_dunning() {
        let handler = PaymentFailedHandler::new(Arc::new(StubProcessor { status: "failed" }));
        let event = event(EventKind::PaymentFailed, json!({"charge": "ch_9"}));

        let effect = handler.handle(&event).await.unwrap();
        assert_eq!(effect, HandlerEffect::new("dunning_started").with_entity("ch_9"));
    }
}
