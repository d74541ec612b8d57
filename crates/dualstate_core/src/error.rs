//! # Handle Error Types
//!
//! Errors raised by the dual-lifetime handle and the native collaborators,
//! plus the category taxonomy shared by every crate in the workspace.

use std::fmt;

use thiserror::Error;

/// Broad category of a failure.
///
/// Every error type in the workspace maps onto one of these so callers can
/// decide how to react without matching on message text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Operation on an already-released or already-closed object.
    InvalidState,
    /// A capability key did not match. Always a programming error.
    Capability,
    /// Content was rejected by a validation routine.
    Format,
    /// One side finished before the other expected it to.
    Premature,
    /// Work was cancelled before it could complete.
    Cancelled,
    /// Anything a validation routine raised that is not a recognized data error.
    Unexpected,
    /// Plain I/O failure, including failures reported by the native side.
    Io,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidState => "invalid state",
            Self::Capability => "capability",
            Self::Format => "format",
            Self::Premature => "premature completion",
            Self::Cancelled => "cancelled",
            Self::Unexpected => "unexpected",
            Self::Io => "i/o",
        };
        f.write_str(name)
    }
}

/// Errors raised by [`DualHandle`](crate::DualHandle) and the native side.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// The handle was already released by one side or the other.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A capability key other than the one the handle was stamped with.
    #[error("capability key does not match this handle")]
    CapabilityMismatch,

    /// A native collaborator reported a failure.
    #[error("native call failed: {0}")]
    Native(String),
}

impl HandleError {
    /// Convenience constructor for [`HandleError::InvalidState`].
    pub fn invalid_state(what: impl Into<String>) -> Self {
        Self::InvalidState(what.into())
    }

    /// Returns the category of this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidState(_) => ErrorClass::InvalidState,
            Self::CapabilityMismatch => ErrorClass::Capability,
            Self::Native(_) => ErrorClass::Io,
        }
    }

    /// True for failures that indicate a bug in the caller rather than bad data.
    #[must_use]
    pub const fn is_programming_error(&self) -> bool {
        matches!(self, Self::CapabilityMismatch)
    }
}

/// Result type for handle operations.
pub type HandleResult<T> = Result<T, HandleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(HandleError::invalid_state("gone").class(), ErrorClass::InvalidState);
        assert_eq!(HandleError::CapabilityMismatch.class(), ErrorClass::Capability);
        assert_eq!(HandleError::Native("oom".into()).class(), ErrorClass::Io);
    }

    #[test]
    fn test_only_capability_is_programming_error() {
        assert!(HandleError::CapabilityMismatch.is_programming_error());
        assert!(!HandleError::invalid_state("gone").is_programming_error());
    }
}
