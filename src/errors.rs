//! Error types for storage-service calls and upload sessions.
//!
//! Two layers: [`StorageError`] is what a [`crate::storage::client::StorageClient`]
//! returns for a single remote call, carrying a machine-readable
//! [`ErrorKind`].  [`UploadError`] is what an upload session reports to its
//! caller once a failure has become terminal.

use std::fmt;

use thiserror::Error;

use crate::upload::MAX_PARTS;

/// Machine-readable classification of a storage-service failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The service has not yet propagated the session to the part, complete
    /// and abort endpoints.  The only transient kind.
    SessionNotYetVisible,
    /// The destination bucket does not exist.
    NoSuchBucket,
    /// Credentials were rejected or lack permission.
    AccessDenied,
    /// A non-final part was below the service's minimum size.
    EntityTooSmall,
    /// A referenced part or its token was not recognised.
    InvalidPart,
    /// Parts in the finalize request were not in ascending order.
    InvalidPartOrder,
    /// Any other error reported by the service.
    Service,
    /// The request never produced a service response (DNS, TLS, timeout...).
    Transport,
}

impl ErrorKind {
    /// Return the S3 error code string for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::SessionNotYetVisible => "NoSuchUpload",
            ErrorKind::NoSuchBucket => "NoSuchBucket",
            ErrorKind::AccessDenied => "AccessDenied",
            ErrorKind::EntityTooSmall => "EntityTooSmall",
            ErrorKind::InvalidPart => "InvalidPart",
            ErrorKind::InvalidPartOrder => "InvalidPartOrder",
            ErrorKind::Service => "ServiceError",
            ErrorKind::Transport => "TransportError",
        }
    }

    /// Classify an S3 error code.  Unknown codes map to [`ErrorKind::Service`].
    pub fn from_code(code: &str) -> Self {
        match code {
            "NoSuchUpload" => ErrorKind::SessionNotYetVisible,
            "NoSuchBucket" => ErrorKind::NoSuchBucket,
            "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" => {
                ErrorKind::AccessDenied
            }
            "EntityTooSmall" => ErrorKind::EntityTooSmall,
            "InvalidPart" => ErrorKind::InvalidPart,
            "InvalidPartOrder" => ErrorKind::InvalidPartOrder,
            _ => ErrorKind::Service,
        }
    }

    /// Whether the failed call should be retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::SessionNotYetVisible)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// The remote operations an upload session performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateSession,
    UploadPart,
    CompleteSession,
    AbortSession,
    ListParts,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::CreateSession => "create_session",
            Operation::UploadPart => "upload_part",
            Operation::CompleteSession => "complete_session",
            Operation::AbortSession => "abort_session",
            Operation::ListParts => "list_parts",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failed remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed ({kind}): {message}")]
pub struct StorageError {
    pub kind: ErrorKind,
    pub operation: Operation,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, operation: Operation, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Terminal failure of an upload session.
///
/// Cloneable so the same error can be published on the status channel and
/// handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// The create-session call failed.  Never retried.
    #[error("failed to create multipart upload: {0}")]
    CreateFailed(StorageError),

    /// A part, finalize, abort or visibility-check call failed with a non-transient error.
    #[error(transparent)]
    Storage(StorageError),

    /// A transient error persisted past the retry budget.
    #[error("{operation} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: Operation,
        attempts: u32,
        last: StorageError,
    },

    /// The session was aborted; no further parts or completion are accepted.
    #[error("upload was aborted")]
    Aborted,

    /// `complete` was requested a second time.
    #[error("completion was already requested for this upload")]
    AlreadyCompleting,

    /// `abort` was requested after the object had already been finalized.
    #[error("upload already completed; nothing to abort")]
    AlreadyCompleted,

    /// The service limit on part count was exceeded.
    #[error("part number {0} exceeds the limit of {} parts", MAX_PARTS)]
    TooManyParts(u32),

    /// Rejected upload settings.
    #[error("invalid upload configuration: {0}")]
    InvalidConfig(String),

    /// The session was constructed outside a tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// The session went away before reporting an outcome.
    #[error("upload session ended before reporting an outcome")]
    SessionDropped,
}

impl UploadError {
    /// Short machine-readable code, used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::CreateFailed(_) => "CreateFailed",
            UploadError::Storage(err) => err.kind.code(),
            UploadError::RetriesExhausted { .. } => "RetriesExhausted",
            UploadError::Aborted => "Aborted",
            UploadError::AlreadyCompleting => "AlreadyCompleting",
            UploadError::AlreadyCompleted => "AlreadyCompleted",
            UploadError::TooManyParts(_) => "TooManyParts",
            UploadError::InvalidConfig(_) => "InvalidConfig",
            UploadError::NoRuntime(_) => "NoRuntime",
            UploadError::SessionDropped => "SessionDropped",
        }
    }

    /// The underlying storage error, if this failure came from a remote call.
    pub fn storage_error(&self) -> Option<&StorageError> {
        match self {
            UploadError::CreateFailed(err) | UploadError::Storage(err) => Some(err),
            UploadError::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }
}

impl From<UploadError> for std::io::Error {
    fn from(err: UploadError) -> Self {
        std::io::Error::other(err)
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code_no_such_upload_is_transient() {
        let kind = ErrorKind::from_code("NoSuchUpload");
        assert_eq!(kind, ErrorKind::SessionNotYetVisible);
        assert!(kind.is_transient());
    }

    #[test]
    fn test_from_code_known_fatal_codes() {
        assert_eq!(ErrorKind::from_code("NoSuchBucket"), ErrorKind::NoSuchBucket);
        assert_eq!(ErrorKind::from_code("AccessDenied"), ErrorKind::AccessDenied);
        assert_eq!(
            ErrorKind::from_code("SignatureDoesNotMatch"),
            ErrorKind::AccessDenied
        );
        assert_eq!(
            ErrorKind::from_code("EntityTooSmall"),
            ErrorKind::EntityTooSmall
        );
        assert!(!ErrorKind::from_code("EntityTooSmall").is_transient());
    }

    #[test]
    fn test_from_code_unknown_is_service() {
        assert_eq!(ErrorKind::from_code("SlowDown"), ErrorKind::Service);
        assert_eq!(ErrorKind::from_code(""), ErrorKind::Service);
    }

    #[test]
    fn test_code_round_trips_for_named_kinds() {
        for kind in [
            ErrorKind::SessionNotYetVisible,
            ErrorKind::NoSuchBucket,
            ErrorKind::AccessDenied,
            ErrorKind::EntityTooSmall,
            ErrorKind::InvalidPart,
            ErrorKind::InvalidPartOrder,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::new(ErrorKind::AccessDenied, Operation::UploadPart, "nope");
        assert_eq!(err.to_string(), "upload_part failed (AccessDenied): nope");
    }

    #[test]
    fn test_upload_error_storage_error_accessor() {
        let storage = StorageError::new(ErrorKind::Service, Operation::CreateSession, "boom");
        let err = UploadError::CreateFailed(storage.clone());
        assert_eq!(err.storage_error(), Some(&storage));
        assert_eq!(err.code(), "CreateFailed");
        assert!(UploadError::Aborted.storage_error().is_none());
    }

    #[test]
    fn test_too_many_parts_message() {
        let err = UploadError::TooManyParts(10_001);
        assert_eq!(
            err.to_string(),
            "part number 10001 exceeds the limit of 10000 parts"
        );
    }
}
