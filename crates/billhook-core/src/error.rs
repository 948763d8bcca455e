//! Error types and result handling for event processing.
//!
//! Defines the storage-facing error type plus the service-wide error taxonomy
//! with stable codes for client disambiguation and HTTP status mapping.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and domain operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Service error taxonomy with stable codes.
///
/// The codes partition into authentication failures (E1xxx), processing
/// failures (E2xxx), and system failures (E3xxx). Only authentication
/// failures surface as `400` to the sending processor; processing failures
/// are retried internally and acknowledged with `200`.
#[derive(Debug, Error)]
pub enum BillhookError {
    /// Signature verification failed (E1001).
    #[error("[E1001] Invalid signature: verification failed")]
    InvalidSignature,

    /// Signature timestamp outside the acceptable skew window (E1002).
    #[error("[E1002] Stale signature: timestamp outside {tolerance_secs}s window")]
    StaleSignature {
        /// Allowed clock skew in seconds.
        tolerance_secs: u64,
    },

    /// Event envelope could not be parsed (E1003).
    #[error("[E1003] Malformed envelope: {reason}")]
    MalformedEnvelope {
        /// Why the envelope was rejected.
        reason: String,
    },

    /// Request volume exceeded the per-source window limit (E1004).
    #[error("[E1004] Rate limited: source {source_id} exceeded request window")]
    RateLimited {
        /// Source identity that exceeded the limit.
        source_id: String,
    },

    /// Duplicate event detected by the idempotency guard (E2001).
    ///
    /// Not an error to the caller: duplicates are acknowledged without
    /// re-invoking any handler.
    #[error("[E2001] Duplicate event: {external_id} already admitted")]
    DuplicateEvent {
        /// The processor-assigned event id that was already admitted.
        external_id: String,
    },

    /// Handler failed with a retryable error (E2002).
    #[error("[E2002] Transient handler failure: {message}")]
    TransientFailure {
        /// Handler-supplied failure detail.
        message: String,
    },

    /// Handler failed with a non-retryable error (E2003).
    #[error("[E2003] Permanent handler failure: {message}")]
    PermanentFailure {
        /// Handler-supplied failure detail.
        message: String,
    },

    /// Retry budget exhausted, event dead-lettered (E2004).
    #[error("[E2004] Retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// Storage could not durably record the event (E3001).
    #[error("[E3001] Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Generic database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Generic error for wrapping other errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BillhookError {
    /// Returns the stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "E1001",
            Self::StaleSignature { .. } => "E1002",
            Self::MalformedEnvelope { .. } => "E1003",
            Self::RateLimited { .. } => "E1004",
            Self::DuplicateEvent { .. } => "E2001",
            Self::TransientFailure { .. } => "E2002",
            Self::PermanentFailure { .. } => "E2003",
            Self::RetriesExhausted { .. } => "E2004",
            Self::StorageUnavailable(_) => "E3001",
            Self::Database(_) | Self::Other(_) => "E9999",
        }
    }

    /// Returns whether the sender can expect a later delivery to succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::TransientFailure { .. }
                | Self::StorageUnavailable(_)
                | Self::Database(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(BillhookError::InvalidSignature.code(), "E1001");
        assert_eq!(BillhookError::StaleSignature { tolerance_secs: 300 }.code(), "E1002");
        assert_eq!(BillhookError::RateLimited { source_id: "stripe".into() }.code(), "E1004");
        assert_eq!(BillhookError::RetriesExhausted { attempts: 5 }.code(), "E2004");
        assert_eq!(BillhookError::StorageUnavailable("pool closed".into()).code(), "E3001");
    }

    #[test]
    fn retryable_classification() {
        assert!(BillhookError::RateLimited { source_id: "s".into() }.is_retryable());
        assert!(BillhookError::TransientFailure { message: "timeout".into() }.is_retryable());
        assert!(BillhookError::StorageUnavailable("down".into()).is_retryable());
        assert!(!BillhookError::InvalidSignature.is_retryable());
        assert!(!BillhookError::PermanentFailure { message: "bad payload".into() }.is_retryable());
        assert!(!BillhookError::DuplicateEvent { external_id: "evt_1".into() }.is_retryable());
    }
}
