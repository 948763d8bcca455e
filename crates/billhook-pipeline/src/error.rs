//! Error types for pipeline operations.
//!
//! Two layers: `HandlerError` is what a business handler returns, already
//! classified into transient or permanent by the handler itself.
//! `PipelineError` covers everything around the handlers: storage, timeouts,
//! shutdown, and exhausted retries.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error returned by an event handler, classified by the handler.
///
/// The handler is the only party that knows whether its failure is worth
/// retrying; the pipeline never re-classifies a handler's verdict.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// Temporary failure; the attempt is eligible for retry.
    #[error("transient handler failure: {message}")]
    Transient {
        /// What went wrong.
        message: String,
    },

    /// Unrecoverable failure; the event goes straight to the dead letter.
    #[error("permanent handler failure: {message}")]
    Permanent {
        /// What went wrong.
        message: String,
    },
}

impl HandlerError {
    /// Creates a transient (retryable) handler error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient { message: message.into() }
    }

    /// Creates a permanent (non-retryable) handler error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent { message: message.into() }
    }

    /// Returns whether this failure is eligible for retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the failure detail for attempt records.
    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message } | Self::Permanent { message } => message,
        }
    }
}

/// Errors surrounding handler execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Handler invocation exceeded its timeout.
    #[error("handler timed out after {timeout_seconds}s")]
    HandlerTimeout {
        /// Seconds before the invocation was abandoned.
        timeout_seconds: u64,
    },

    /// Retry budget exhausted; the event was dead-lettered.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Event referenced by a ticket or admin action no longer resolves.
    #[error("event not found: {event_id}")]
    EventNotFound {
        /// The missing event's identifier.
        event_id: String,
    },

    /// Storage operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] billhook_core::CoreError),

    /// Shutdown was requested while work was in flight.
    #[error("shutdown requested")]
    ShutdownRequested,

    /// Unexpected internal error.
    #[error("internal pipeline error: {message}")]
    Internal {
        /// Internal error detail.
        message: String,
    },
}

impl PipelineError {
    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether the failing operation may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::HandlerTimeout { .. } | Self::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_classification_is_preserved() {
        assert!(HandlerError::transient("processor 503").is_transient());
        assert!(!HandlerError::permanent("unknown customer").is_transient());
    }

    #[test]
    fn timeouts_are_retryable() {
        assert!(PipelineError::HandlerTimeout { timeout_seconds: 30 }.is_retryable());
        assert!(!PipelineError::RetriesExhausted { attempts: 5 }.is_retryable());
        assert!(!PipelineError::ShutdownRequested.is_retryable());
    }

    #[test]
    fn handler_error_message_accessible() {
        let err = HandlerError::transient("connection reset");
        assert_eq!(err.message(), "connection reset");
    }
}
