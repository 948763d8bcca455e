//! Handlers for payment method and invoice events.

use tracing::info;

use billhook_core::{EventKind, InboundEvent};

use crate::{
    error::HandlerError,
    handlers::require_str,
    router::{EventHandler, HandlerEffect, HandlerFuture},
};

/// Records a newly attached payment method as the customer's default.
pub struct PaymentMethodAttachedHandler;

impl PaymentMethodAttachedHandler {
    /// Creates the handler.
    pub fn new() -> Self {
        Self
    }

    async fn process(&self, event: &InboundEvent) -> Result<HandlerEffect, HandlerError> {
        let method_id = require_str(&event.payload, "payment_method", &event.event_type)?;
        let customer_id = require_str(&event.payload, "customer", &event.event_type)?;

        info!(event_id = %event.id, method_id, customer_id, "payment method attached");
        Ok(HandlerEffect::new("payment_method_attached").with_entity(method_id))
    }
}

impl Default for PaymentMethodAttachedHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for PaymentMethodAttachedHandler {
    fn kind(&self) -> EventKind {
        EventKind::PaymentMethodAttached
    }

    fn handle<'a>(&'a self, event: &'a InboundEvent) -> HandlerFuture<'a> {
        Box::pin(self.process(event))
    }
}

/// Records a finalized invoice so it can be surfaced to the customer.
pub struct InvoiceFinalizedHandler;

impl InvoiceFinalizedHandler {
    /// Creates the handler.
    pub fn new() -> Self {
        Self
    }

    async fn process(&self, event: &InboundEvent) -> Result<HandlerEffect, HandlerError> {
        let invoice_id = require_str(&event.payload, "invoice", &event.event_type)?;

        info!(event_id = %event.id, invoice_id, "invoice finalized");
        Ok(HandlerEffect::new("invoice_finalized").with_entity(invoice_id))
    }
}

impl Default for InvoiceFinalizedHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for InvoiceFinalizedHandler {
    fn kind(&self) -> EventKind {
        EventKind::InvoiceFinalized
    }

    fn handle<'a>(&'a self, event: &'a InboundEvent) -> HandlerFuture<'a> {
        Box::pin(self.process(event))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::handlers::testing::event;

    #[tokio::test]
    async fn payment_method_requires_customer() {
        let handler = PaymentMethodAttachedHandler::new();
        let event = event(EventKind::PaymentMethodAttached, json!({"payment_method": "pm_1"}));

        assert!(!handler.handle(&event).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn payment_method_attachment_recorded() {
        let handler = PaymentMethodAttachedHandler::new();
        let event = event(
            EventKind::PaymentMethodAttached,
            json!({"payment_method": "pm_1", "customer": "cus_7"}),
        );

        let effect = handler.handle(&event).await.unwrap();
        assert_eq!(effect, HandlerEffect::new("payment_method_attached").with_entity("pm_1"));
    }

    #[tokio::test]
    async fn invoice_finalization_recorded() {
        let handler = InvoiceFinalizedHandler::new();
        let event = event(EventKind::InvoiceFinalized, json!({"invoice": "inv_3"}));

        let effect = handler.handle(&event).await.unwrap();
        assert_eq!(effect.action, "invoice_finalized");
    }
}
