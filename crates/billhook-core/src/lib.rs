//! Core domain models and storage layer for the billhook pipeline.
//!
//! Provides strongly-typed domain primitives, the processing error taxonomy,
//! the metrics read-model, and repository-based database access. All other
//! crates depend on these foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod metrics;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{BillhookError, CoreError, Result};
pub use metrics::{Alert, AlertPolicy, EventTypeStats, OverviewStats};
pub use models::{
    Admission, AttemptOutcome, AuditRecord, DeadLetterEntry, EventId, EventKind, EventStatus,
    InboundEvent, ProcessingAttempt, Resolution, RetryTicket,
};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};
