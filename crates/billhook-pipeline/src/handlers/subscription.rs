//! Handlers for subscription lifecycle events.

use tracing::info;

use billhook_core::{EventKind, InboundEvent};

use crate::{
    error::HandlerError,
    handlers::require_str,
    router::{EventHandler, HandlerEffect, HandlerFuture},
};

/// Applies plan, quantity, or period changes to a subscription.
pub struct SubscriptionUpdatedHandler;

impl SubscriptionUpdatedHandler {
    /// Creates the handler.
    pub fn new() -> Self {
        Self
    }

    async fn process(&self, event: &InboundEvent) -> Result<HandlerEffect, HandlerError> {
        let subscription_id = require_str(&event.payload, "subscription", &event.event_type)?;
        let status = require_str(&event.payload, "status", &event.event_type)?;

        match status {
            "active" | "trialing" | "past_due" | "unpaid" | "paused" => {
                info!(event_id = %event.id, subscription_id, status, "subscription updated");
                Ok(HandlerEffect::new(format!("subscription_{status}"))
                    .with_entity(subscription_id))
            },
            other => Err(HandlerError::permanent(format!(
                "unrecognized subscription status '{other}'"
            ))),
        }
    }
}

impl Default for SubscriptionUpdatedHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for SubscriptionUpdatedHandler {
    fn kind(&self) -> EventKind {
        EventKind::SubscriptionUpdated
    }

    fn handle<'a>(&'a self, event: &'a InboundEvent) -> HandlerFuture<'a> {
        Box::pin(self.process(event))
    }
}

/// Cancels a subscription and schedules access revocation at period end.
pub struct SubscriptionDeletedHandler;

impl SubscriptionDeletedHandler {
    /// Creates the handler.
    pub fn new() -> Self {
        Self
    }

    async fn process(&self, event: &InboundEvent) -> Result<HandlerEffect, HandlerError> {
        let subscription_id = require_str(&event.payload, "subscription", &event.event_type)?;

        info!(event_id = %event.id, subscription_id, "subscription cancelled");
        Ok(HandlerEffect::new("subscription_cancelled").with_entity(subscription_id))
    }
}

impl Default for SubscriptionDeletedHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for SubscriptionDeletedHandler {
    fn kind(&self) -> EventKind {
        EventKind::SubscriptionDeleted
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
    async fn update_applies_known_status() {
        let handler = SubscriptionUpdatedHandler::new();
        let event = event(
            EventKind::SubscriptionUpdated,
            json!({"subscription": "sub_1", "status": "past_due"}),
        );

        let effect = handler.handle(&event).await.unwrap();
        assert_eq!(effect, HandlerEffect::new("subscription_past_due").with_entity("sub_1"));
    }

    #[tokio::test]
    async fn unrecognized_status_is_permanent() {
        let handler = SubscriptionUpdatedHandler::new();
        let event = event(
            EventKind::SubscriptionUpdated,
            json!({"subscription": "sub_1", "status": "quantum"}),
        );

        assert!(!handler.handle(&event).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn deletion_cancels_subscription() {
        let handler = SubscriptionDeletedHandler::new();
        let event = event(EventKind::SubscriptionDeleted, json!({"subscription": "sub_2"}));

        let effect = handler.handle(&event).await.unwrap();
        assert_eq!(effect.action, "subscription_cancelled");
    }
}
