//! Error types for the payroll engine.
//!
//! Three failure classes cross the public API: validation failures
//! (rejected before any write), status/lock conflicts, and store failures
//! that may leave a partially-committed posting behind. Data-quality
//! problems in source rows (missing timestamps, absent rate profiles) are
//! deliberately *not* errors — they degrade to zero-valued contributions
//! and a `warn!` log so one bad record cannot block payroll for everyone.

use thiserror::Error;

/// The error type for all payroll engine operations.
#[derive(Debug, Error)]
pub enum PayrollError {
    /// The request was malformed (missing period, unknown run id, bad
    /// mode). Nothing has been written.
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// The operation is not permitted in the run's current status
    /// (editing a posted run, finalizing twice, voiding a draft).
    /// Nothing has been written.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// The caller's confirmation callback declined the posting. Nothing
    /// has been written; the run is back in draft.
    #[error("Posting aborted by caller")]
    Aborted,

    /// A store write failed. Batches committed before the failure stay
    /// committed; the context names the run and phase so the caller can
    /// re-invoke finalize to recover.
    #[error("Store failure during {context}: {message}")]
    Store { context: String, message: String },
}

impl PayrollError {
    pub fn validation(message: impl Into<String>) -> Self {
        PayrollError::Validation {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        PayrollError::Conflict {
            message: message.into(),
        }
    }

    pub fn store(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        PayrollError::Store {
            context: context.into(),
            message: message.to_string(),
        }
    }
}

/// Result alias used throughout the engine.
pub type PayrollResult<T> = Result<T, PayrollError>;

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_displays_message() {
        let err = PayrollError::validation("missing period start");
        assert_eq!(err.to_string(), "Validation failed: missing period start");
    }

    #[test]
    fn test_store_displays_context_and_message() {
        let err = PayrollError::store("finalize run-1 posting", "disk I/O error");
        assert_eq!(
            err.to_string(),
            "Store failure during finalize run-1 posting: disk I/O error"
        );
    }

    #[test]
    fn test_errors_implement_std_error() {
        fn assert_error<T: std::error::Error>() {}
        assert_error::<PayrollError>();
    }

    #[test]
    fn test_error_propagation_with_question_mark() {
        fn inner() -> PayrollResult<()> {
            Err(PayrollError::Aborted)
        }
        fn outer() -> PayrollResult<()> {
            inner()?;
            Ok(())
        }
        assert!(matches!(outer(), Err(PayrollError::Aborted)));
    }
}
