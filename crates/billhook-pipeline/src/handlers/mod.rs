//! Business handlers for the known event types.
//!
//! Each handler owns the semantics of one event type and classifies its own
//! failures: missing or contradictory payload fields are permanent, processor
//! API problems are transient. [`default_router`] wires the full set.

use std::sync::Arc;

use billhook_core::EventKind;

use crate::{
    processor::ProcessorApi,
    router::{EventRouter, RouterBuildError},
};

pub mod billing;
pub mod payment;
pub mod subscription;

pub use billing::{InvoiceFinalizedHandler, PaymentMethodAttachedHandler};
pub use payment::{PaymentFailedHandler, PaymentSucceededHandler};
pub use subscription::{SubscriptionDeletedHandler, SubscriptionUpdatedHandler};

/// Builds the router covering every known event type.
///
/// # Errors
///
/// Returns an error only on a programming mistake in handler registration,
/// surfaced at startup.
pub fn default_router(processor: Arc<dyn ProcessorApi>) -> Result<EventRouter, RouterBuildError> {
    Ok(EventRouter::builder()
        .register(Arc::new(PaymentSucceededHandler::new(processor.clone())))?
        .register(Arc::new(PaymentFailedHandler::new(processor)))?
        .register(Arc::new(SubscriptionUpdatedHandler::new()))?
        .register(Arc::new(SubscriptionDeletedHandler::new()))?
        .register(Arc::new(PaymentMethodAttachedHandler::new()))?
        .register(Arc::new(InvoiceFinalizedHandler::new()))?
        .build())
}

/// Extracts a required string field from an event payload.
///
/// A missing field means the processor sent a shape this handler does not
/// understand; retrying cannot fix that, so the failure is permanent.
pub(crate) fn require_str<'a>(
    payload: &'a serde_json::Value,
    field: &str,
    kind: &EventKind,
) -> Result<&'a str, crate::error::HandlerError> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            crate::error::HandlerError::permanent(format!(
                "{kind} payload missing required field '{field}'"
            ))
        })
}

#[cfg(test)]
pub(crate) mod testing {
    use billhook_core::InboundEvent;
    use chrono::Utc;

    use super::*;
    use crate::processor::{LookupFuture, ProcessorObject};

    /// Processor stub returning a fixed status for every lookup.
    pub struct StubProcessor {
        pub status: &'static str,
    }

    impl ProcessorApi for StubProcessor {
        fn fetch_object<'a>(&'a self, object_id: &'a str) -> LookupFuture<'a> {
            Box::pin(async move {
                Ok(ProcessorObject {
                    id: object_id.to_string(),
                    status: self.status.to_string(),
                    attributes: serde_json::json!({}),
                })
            })
        }
    }

    /// Builds an event of the given kind with the given payload.
    pub fn event(kind: EventKind, payload: serde_json::Value) -> InboundEvent {
        InboundEvent::new(format!("evt_{}", uuid::Uuid::new_v4()), kind, payload, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{testing::StubProcessor, *};

    #[test]
    fn default_router_covers_all_known_types() {
        let router = default_router(Arc::new(StubProcessor { status: "succeeded" })).unwrap();

        for kind in [
            EventKind::PaymentSucceeded,
            EventKind::PaymentFailed,
            EventKind::SubscriptionUpdated,
            EventKind::SubscriptionDeleted,
            EventKind::PaymentMethodAttached,
            EventKind::InvoiceFinalized,
        ] {
            assert!(router.handles(&kind), "no handler for {kind}");
        }

        assert!(!router.handles(&EventKind::parse("customer.discount.created")));
    }
}
