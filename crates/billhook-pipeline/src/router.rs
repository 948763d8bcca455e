//! Event routing to per-type handlers.
//!
//! The router holds a handler map keyed by [`EventKind`], checked at
//! construction so a misregistered handler set fails at startup rather than
//! on the first matching event. Unknown event types are not an error; the
//! pipeline accepts and logs them without invoking anything.

use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc};

use serde::Serialize;

use billhook_core::{EventKind, InboundEvent};

use crate::error::HandlerError;

/// Structured description of what a handler did.
///
/// Effects are recorded in logs rather than interpreted; they exist so an
/// operator reading the trail can see which domain state each event touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerEffect {
    /// What happened, e.g. `subscription_activated`.
    pub action: String,
    /// Domain entity affected, e.g. a subscription or invoice id.
    pub entity: Option<String>,
}

impl HandlerEffect {
    /// Creates an effect description.
    pub fn new(action: impl Into<String>) -> Self {
        Self { action: action.into(), entity: None }
    }

    /// Attaches the affected entity id.
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }
}

impl fmt::Display for HandlerEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "{} ({entity})", self.action),
            None => write!(f, "{}", self.action),
        }
    }
}

/// Boxed future returned by handler invocations.
pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HandlerEffect, HandlerError>> + Send + 'a>>;

/// Business logic for one event type.
///
/// Handlers classify their own failures: a [`HandlerError::Transient`] is
/// retried with backoff, a [`HandlerError::Permanent`] dead-letters the
/// event immediately. Handlers must be idempotent per `external_id`; the
/// pipeline guarantees at-most-one successful invocation but a timed-out
/// attempt may have partially executed before its retry runs.
pub trait EventHandler: Send + Sync {
    /// The event type this handler processes.
    fn kind(&self) -> EventKind;

    /// Processes an event, returning the effect it had on domain state.
    fn handle<'a>(&'a self, event: &'a InboundEvent) -> HandlerFuture<'a>;
}

/// Outcome of a routing decision.
pub enum RouteTarget<'r> {
    /// A registered handler matched the event type.
    Handler(&'r Arc<dyn EventHandler>),
    /// No handler is registered; the event is accepted and logged.
    Unhandled,
}

/// Maps event types to registered handlers.
pub struct EventRouter {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl EventRouter {
    /// Starts building a router.
    pub fn builder() -> EventRouterBuilder {
        EventRouterBuilder { handlers: HashMap::new() }
    }

    /// Resolves the handler for an event type.
    pub fn route(&self, kind: &EventKind) -> RouteTarget<'_> {
        match self.handlers.get(kind) {
            Some(handler) => RouteTarget::Handler(handler),
            None => RouteTarget::Unhandled,
        }
    }

    /// Returns whether a handler is registered for the event type.
    pub fn handles(&self, kind: &EventKind) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Event types with registered handlers.
    pub fn registered_kinds(&self) -> impl Iterator<Item = &EventKind> {
        self.handlers.keys()
    }
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouter").field("handlers", &self.handlers.len()).finish()
    }
}

/// Router construction errors, surfaced at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterBuildError {
    /// Two handlers were registered for the same event type.
    #[error("duplicate handler for event type {0}")]
    DuplicateHandler(String),

    /// A handler declared the `Unknown` event type.
    #[error("handlers cannot register for unknown event types")]
    UnknownKind,
}

/// Builder validating the handler set before the router exists.
pub struct EventRouterBuilder {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl EventRouterBuilder {
    /// Registers a handler under its declared event type.
    ///
    /// # Errors
    ///
    /// Returns an error on a duplicate registration or a handler declaring
    /// the `Unknown` type.
    pub fn register(mut self, handler: Arc<dyn EventHandler>) -> Result<Self, RouterBuildError> {
        let kind = handler.kind();
        if kind.is_unknown() {
            return Err(RouterBuildError::UnknownKind);
        }
        if self.handlers.insert(kind.clone(), handler).is_some() {
            return Err(RouterBuildError::DuplicateHandler(kind.to_string()));
        }
        Ok(self)
    }

    /// Finalizes the router.
    pub fn build(self) -> EventRouter {
        EventRouter { handlers: self.handlers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedHandler {
        kind: EventKind,
    }

    impl EventHandler for FixedHandler {
        fn kind(&self) -> EventKind {
            self.kind.clone()
        }

        fn handle<'a>(&'a self, _event: &'a InboundEvent) -> HandlerFuture<'a> {
            Box::pin(async { Ok(HandlerEffect::new("noop")) })
        }
    }

    #[test]
    fn routes_to_registered_handler() {
        let router = EventRouter::builder()
            .register(Arc::new(FixedHandler { kind: EventKind::PaymentSucceeded }))
            .unwrap()
            .build();

        assert!(matches!(
            router.route(&EventKind::PaymentSucceeded),
            RouteTarget::Handler(_)
        ));
        assert!(matches!(router.route(&EventKind::PaymentFailed), RouteTarget::Unhandled));
    }

    #[test]
    fn unknown_types_are_unhandled() {
        let router = EventRouter::builder().build();
        let kind = EventKind::parse("customer.discount.created");

        assert!(matches!(router.route(&kind), RouteTarget::Unhandled));
    }

    #[test]
    fn registered_kinds_reflect_the_handler_set() {
        let router = EventRouter::builder()
            .register(Arc::new(FixedHandler { kind: EventKind::PaymentSucceeded }))
            .unwrap()
            .register(Arc::new(FixedHandler { kind: EventKind::InvoiceFinalized }))
            .unwrap()
            .build();

        let mut kinds: Vec<_> = router.registered_kinds().cloned().collect();
        kinds.sort_by_key(ToString::to_string);
        assert_eq!(kinds, vec![EventKind::InvoiceFinalized, EventKind::PaymentSucceeded]);
    }

    #[test]
    fn duplicate_registration_fails_at_build_time() {
        let result = EventRouter::builder()
            .register(Arc::new(FixedHandler { kind: EventKind::PaymentFailed }))
            .unwrap()
            .register(Arc::new(FixedHandler { kind: EventKind::PaymentFailed }));

        assert!(matches!(result, Err(RouterBuildError::DuplicateHandler(_))));
    }

    #[test]
    fn unknown_kind_cannot_be_registered() {
        let result = EventRouter::builder()
            .register(Arc::new(FixedHandler { kind: EventKind::parse("mystery") }));

        assert_eq!(result.err(), Some(RouterBuildError::UnknownKind));
    }

    #[test]
    fn effect_display_includes_entity() {
        let effect = HandlerEffect::new("invoice_marked_paid").with_entity("inv_42");
        assert_eq!(effect.to_string(), "invoice_marked_paid (inv_42)");
    }
}
