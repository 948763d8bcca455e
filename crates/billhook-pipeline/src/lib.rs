//! Event processing pipeline: verification, routing, retries, and
//! quarantine.
//!
//! The flow through this crate mirrors the lifecycle of a notification:
//! [`verify`] authenticates it, the router in [`router`] dispatches it to a
//! handler, [`pipeline`] drives the attempt and classifies the outcome, and
//! [`scheduler`] sweeps failed events back in with bounded backoff until
//! [`dead_letter`] quarantines them. [`audit`] records what happened off the
//! critical path.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod dead_letter;
pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod processor;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod storage;
pub mod verify;

pub use audit::AuditRecorder;
pub use dead_letter::DeadLetterService;
pub use error::{HandlerError, PipelineError, Result};
pub use pipeline::{AttemptResult, ProcessingPipeline};
pub use retry::{RetryContext, RetryDecision, RetryPolicy};
pub use router::{EventRouter, HandlerEffect};
pub use scheduler::{RetryScheduler, SchedulerConfig};
pub use storage::PipelineStorage;
pub use verify::{SecretSet, SignatureVerifier, VerifiedEnvelope};
