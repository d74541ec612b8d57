//! # Verification Error Types
//!
//! All errors that can come out of a verifier or the worker pool.

use std::io;

use dualstate_core::ErrorClass;
use thiserror::Error;

/// Errors raised by the verification pipeline.
///
/// `Clone` so a stored failure can be surfaced again on every later call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// The validation routine rejected the content.
    #[error("content rejected: {0}")]
    Rejected(String),

    /// The routine returned without consuming everything it was given,
    /// or more content arrived after it had already returned.
    #[error("verifier finished prematurely")]
    Premature,

    /// The verifier was cancelled before completing.
    #[error("verification cancelled: {0}")]
    Cancelled(String),

    /// An operation needing the background task ran before `schedule`.
    #[error("verifier not yet scheduled")]
    NotScheduled,

    /// The routine failed in a way that is not a recognized data error.
    #[error("error verifying content, not otherwise provided for: {0}")]
    Unexpected(String),

    /// The routine's input failed underneath it.
    #[error("i/o error during verification ({kind:?}): {message}")]
    Io {
        /// Kind of the original I/O error.
        kind: io::ErrorKind,
        /// Message of the original I/O error.
        message: String,
    },

    /// The worker pool could not be configured or could not start a thread.
    #[error("worker pool: {0}")]
    Pool(String),
}

impl VerifyError {
    /// Convenience constructor for [`VerifyError::Rejected`].
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    /// Returns the category of this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Rejected(_) => ErrorClass::Format,
            Self::Premature => ErrorClass::Premature,
            Self::Cancelled(_) => ErrorClass::Cancelled,
            Self::NotScheduled => ErrorClass::InvalidState,
            Self::Unexpected(_) => ErrorClass::Unexpected,
            Self::Io { .. } | Self::Pool(_) => ErrorClass::Io,
        }
    }
}

impl From<io::Error> for VerifyError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::Interrupted {
            Self::Cancelled(err.to_string())
        } else {
            Self::Io {
                kind: err.kind(),
                message: err.to_string(),
            }
        }
    }
}

/// Result type for verification operations.
pub type VerifyResult<T> = Result<T, VerifyError>;
