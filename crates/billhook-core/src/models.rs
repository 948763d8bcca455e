//! Core domain models and strongly-typed identifiers.
//!
//! Defines inbound events, processing attempts, retry tickets, dead-letter
//! entries, and audit records, plus newtype ID wrappers for compile-time type
//! safety. Includes database serialization traits and the event lifecycle
//! state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed event identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. This is the internal
/// identity of an inbound event; the processor-assigned `external_id` lives
/// alongside it and carries the uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Event types published by the billing processor.
///
/// A closed set of known types plus an explicit `Unknown` branch: the
/// processor's event catalog evolves independently of this service, so
/// unrecognized types are accepted and logged rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A charge settled successfully.
    PaymentSucceeded,
    /// A charge was declined or otherwise failed.
    PaymentFailed,
    /// A subscription's plan, quantity, or period changed.
    SubscriptionUpdated,
    /// A subscription was cancelled.
    SubscriptionDeleted,
    /// A payment method was attached to a customer.
    PaymentMethodAttached,
    /// An invoice transitioned to its final state.
    InvoiceFinalized,
    /// Any event type this service has no handler for.
    #[serde(untagged)]
    Unknown(String),
}

impl EventKind {
    /// Parses a processor event type string.
    ///
    /// Never fails: unrecognized strings map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "payment_succeeded" => Self::PaymentSucceeded,
            "payment_failed" => Self::PaymentFailed,
            "subscription_updated" => Self::SubscriptionUpdated,
            "subscription_deleted" => Self::SubscriptionDeleted,
            "payment_method_attached" => Self::PaymentMethodAttached,
            "invoice_finalized" => Self::InvoiceFinalized,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Returns the canonical wire name of this event type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::PaymentSucceeded => "payment_succeeded",
            Self::PaymentFailed => "payment_failed",
            Self::SubscriptionUpdated => "subscription_updated",
            Self::SubscriptionDeleted => "subscription_deleted",
            Self::PaymentMethodAttached => "payment_method_attached",
            Self::InvoiceFinalized => "invoice_finalized",
            Self::Unknown(other) => other,
        }
    }

    /// Whether this is a type the service has no registered handler for.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl sqlx::Type<PgDb> for EventKind {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventKind {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self::parse(s))
    }
}

impl sqlx::Encode<'_, PgDb> for EventKind {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str().to_string(), buf)
    }
}

/// Event lifecycle status.
///
/// Events progress through these states during processing:
///
/// ```text
/// Received -> Processing -> Succeeded
///                        -> Pending (retry scheduled) -> Processing ...
///                        -> DeadLettered
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Admitted by the idempotency guard, first attempt not yet started.
    Received,

    /// A worker is actively executing a handler for this event.
    Processing,

    /// Waiting for its retry ticket to come due.
    Pending,

    /// Handler completed successfully. Terminal state.
    Succeeded,

    /// Exhausted retries or failed permanently. Terminal state; the
    /// dead-letter entry holds the failure detail.
    DeadLettered,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => write!(f, "received"),
            Self::Processing => write!(f, "processing"),
            Self::Pending => write!(f, "pending"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

impl sqlx::Type<PgDb> for EventStatus {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "received" => Ok(Self::Received),
            "processing" => Ok(Self::Processing),
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "dead_lettered" => Ok(Self::DeadLettered),
            _ => Err(format!("invalid event status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for EventStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Result of the idempotency guard's admit operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First time this `external_id` has been seen; proceed to routing.
    Admitted,
    /// Already admitted; acknowledge without re-invoking any handler.
    Duplicate(EventId),
}

/// A signed event notification admitted for processing.
///
/// # Idempotency
///
/// `external_id` carries a database uniqueness constraint. The same
/// `external_id` must never cause two successful handler executions, no
/// matter how many times the processor delivers it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InboundEvent {
    /// Internal identifier for this event.
    pub id: EventId,

    /// Processor-assigned globally unique event id.
    pub external_id: String,

    /// Declared event type from the envelope.
    pub event_type: EventKind,

    /// Raw event payload (the envelope's `data` object).
    pub payload: serde_json::Value,

    /// When the notification was received.
    pub received_at: DateTime<Utc>,

    /// Result of signature verification at ingestion.
    ///
    /// Always true for stored events: invalid signatures are rejected
    /// before admission.
    pub signature_valid: bool,

    /// Current lifecycle status.
    pub status: EventStatus,

    /// When the event reached a terminal state.
    pub processed_at: Option<DateTime<Utc>>,
}

impl InboundEvent {
    /// Creates a freshly-admitted event in `Received` state.
    pub fn new(
        external_id: String,
        event_type: EventKind,
        payload: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::new(),
            external_id,
            event_type,
            payload,
            received_at,
            signature_valid: true,
            status: EventStatus::Received,
            processed_at: None,
        }
    }
}

/// Outcome of a sealed processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Handler returned an effect description.
    Success,
    /// Handler failed with a retryable error.
    TransientFailure,
    /// Handler failed with a non-retryable error.
    PermanentFailure,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::TransientFailure => write!(f, "transient_failure"),
            Self::PermanentFailure => write!(f, "permanent_failure"),
        }
    }
}

impl sqlx::Type<PgDb> for AttemptOutcome {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AttemptOutcome {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "success" => Ok(Self::Success),
            "transient_failure" => Ok(Self::TransientFailure),
            "permanent_failure" => Ok(Self::PermanentFailure),
            _ => Err(format!("invalid attempt outcome: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for AttemptOutcome {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Record of a single handler invocation.
///
/// Created when an attempt begins, sealed when it completes. Immutable once
/// sealed; the row is never updated again.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessingAttempt {
    /// Unique identifier for this attempt.
    pub id: Uuid,

    /// Event being processed.
    pub event_id: EventId,

    /// Sequential attempt number, starting at 1.
    pub attempt_number: i32,

    /// When the handler invocation began.
    pub started_at: DateTime<Utc>,

    /// When the attempt was sealed. None while in flight.
    pub completed_at: Option<DateTime<Utc>>,

    /// Classified outcome. None while in flight.
    pub outcome: Option<AttemptOutcome>,

    /// Handler-supplied failure detail, if any.
    pub error_detail: Option<String>,
}

/// Scheduled retry for an event whose last attempt failed transiently.
///
/// Owned exclusively by the retry scheduler. `claimed_by`/`claimed_at` carry
/// the optimistic claim so at most one sweep worker executes a given retry;
/// claims older than the staleness threshold are reclaimable.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RetryTicket {
    /// Event awaiting retry.
    pub event_id: EventId,

    /// Earliest time the next attempt may run.
    pub next_attempt_at: DateTime<Utc>,

    /// Attempts completed so far.
    pub attempts_so_far: i32,

    /// Attempt budget; reaching it promotes the event to the dead letter.
    pub max_attempts: i32,

    /// Worker identity holding the current claim.
    pub claimed_by: Option<String>,

    /// When the current claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,

    /// When the ticket was created.
    pub created_at: DateTime<Utc>,

    /// When the ticket was last rescheduled.
    pub updated_at: DateTime<Utc>,
}

/// How a dead-letter entry was manually resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Re-entered the pipeline via manual retry and succeeded.
    Reprocessed,
    /// Operator chose to drop the event.
    Discarded,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reprocessed => write!(f, "reprocessed"),
            Self::Discarded => write!(f, "discarded"),
        }
    }
}

impl sqlx::Type<PgDb> for Resolution {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Resolution {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "reprocessed" => Ok(Self::Reprocessed),
            "discarded" => Ok(Self::Discarded),
            _ => Err(format!("invalid resolution: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for Resolution {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Quarantine record for an event that exhausted retries or failed
/// permanently.
///
/// Never deleted: resolution is recorded on the entry rather than removing
/// it, preserving the failure history for audit.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeadLetterEntry {
    /// Event this entry quarantines.
    pub event_id: EventId,

    /// Event type, denormalized for dashboard listing.
    pub event_type: EventKind,

    /// When the first promotion happened.
    pub first_failed_at: DateTime<Utc>,

    /// When the most recent promotion happened.
    pub last_failed_at: DateTime<Utc>,

    /// Number of times this event has been promoted.
    pub failure_count: i32,

    /// Error detail from the most recent failure.
    pub last_error: String,

    /// Whether an operator has resolved this entry.
    pub resolved: bool,

    /// How the entry was resolved, if it was.
    pub resolution: Option<Resolution>,

    /// Operator identity that resolved the entry.
    pub resolved_by: Option<String>,

    /// When the entry was resolved.
    pub resolved_at: Option<DateTime<Utc>>,

    /// Flags entries needing operator attention in the dashboard.
    pub requires_manual_review: bool,
}

/// Append-only processing trail for a single event.
///
/// One row per admitted event; each stage field is written exactly once.
/// Owned by the audit recorder, read-only to every other component.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditRecord {
    /// Event this record traces.
    pub event_id: EventId,

    /// Signature verification passed at ingestion.
    pub signature_validated: bool,

    /// Idempotency guard consulted.
    pub idempotency_checked: bool,

    /// A registered handler matched the event type.
    pub handler_matched: bool,

    /// When the first handler invocation began.
    pub processing_started_at: Option<DateTime<Utc>>,

    /// When the event reached a terminal state.
    pub processing_completed_at: Option<DateTime<Utc>>,

    /// HTTP status returned to the sender.
    pub response_status: Option<i32>,

    /// When the record was opened.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_status_display_format() {
        assert_eq!(EventStatus::Received.to_string(), "received");
        assert_eq!(EventStatus::Processing.to_string(), "processing");
        assert_eq!(EventStatus::Pending.to_string(), "pending");
        assert_eq!(EventStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(EventStatus::DeadLettered.to_string(), "dead_lettered");
    }

    #[test]
    fn event_kind_round_trips_known_types() {
        for name in [
            "payment_succeeded",
            "payment_failed",
            "subscription_updated",
            "subscription_deleted",
            "payment_method_attached",
            "invoice_finalized",
        ] {
            let kind = EventKind::parse(name);
            assert!(!kind.is_unknown(), "{name} should be a known type");
            assert_eq!(kind.as_str(), name);
        }
    }

    #[test]
    fn event_kind_preserves_unknown_types() {
        let kind = EventKind::parse("customer.discount.created");
        assert!(kind.is_unknown());
        assert_eq!(kind.as_str(), "customer.discount.created");
    }

    #[test]
    fn new_event_starts_in_received_state() {
        let event = InboundEvent::new(
            "evt_123".to_string(),
            EventKind::PaymentFailed,
            serde_json::json!({"charge": "ch_1"}),
            Utc::now(),
        );
        assert_eq!(event.status, EventStatus::Received);
        assert!(event.signature_valid);
        assert!(event.processed_at.is_none());
    }
}
