//! # Stream Error Types

use std::io;

use dualstate_core::{ErrorClass, HandleError};
use dualstate_verify::VerifyError;
use thiserror::Error;

/// Errors raised by stream operations.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The stream was already closed.
    #[error("I/O operation on closed stream")]
    Closed,

    /// The underlying handle refused the operation.
    #[error(transparent)]
    Handle(#[from] HandleError),

    /// The verifier rejected, abandoned or failed on the written data.
    #[error("written data failed verification: {0}")]
    Verification(#[from] VerifyError),

    /// Content did not have the shape the caller required.
    #[error("format error: {0}")]
    Format(String),

    /// `set_verifier` was called a second time.
    #[error("verifier already set")]
    VerifierAlreadySet,

    /// A write was attempted before any verifier was set.
    #[error("no verifier set; set one before writing")]
    VerifierMissing,

    /// Adoption was attempted before writing finished.
    #[error("writing not yet complete")]
    WriteIncomplete,
}

impl StreamError {
    /// Returns the category of this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Closed => ErrorClass::Io,
            Self::Handle(e) => e.class(),
            Self::Verification(e) => e.class(),
            Self::Format(_) => ErrorClass::Format,
            Self::VerifierAlreadySet | Self::VerifierMissing | Self::WriteIncomplete => {
                ErrorClass::InvalidState
            }
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match err.class() {
            ErrorClass::Format => io::ErrorKind::InvalidData,
            ErrorClass::Capability => io::ErrorKind::PermissionDenied,
            ErrorClass::Io if matches!(err, StreamError::Closed) => io::ErrorKind::NotConnected,
            _ => io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

/// Result type for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_follows_source() {
        let err: StreamError = HandleError::CapabilityMismatch.into();
        assert_eq!(err.class(), ErrorClass::Capability);

        let err: StreamError = VerifyError::Premature.into();
        assert_eq!(err.class(), ErrorClass::Premature);

        assert_eq!(StreamError::WriteIncomplete.class(), ErrorClass::InvalidState);
    }

    #[test]
    fn test_io_conversion_keeps_source() {
        let err: io::Error = StreamError::Format("short".to_string()).into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<StreamError>());
        assert!(matches!(inner, Some(StreamError::Format(_))));
    }
}
