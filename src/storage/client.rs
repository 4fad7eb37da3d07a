//! Abstract storage-service client trait.
//!
//! Every service an upload can target must implement [`StorageClient`].
//! The trait covers exactly the multipart-upload calls a session makes, so
//! the coordinator never needs to know which service it is talking to.

use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::errors::StorageError;

/// Where an object lands: bucket plus key, fixed for a session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub bucket: String,
    pub key: String,
}

impl Destination {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Service-assigned identifier of a multipart upload (S3 `UploadId`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque per-part acknowledgment returned by the service (S3 `ETag`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartToken(String);

impl PartToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of a finalize request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub token: PartToken,
}

/// What the service reports after stitching the parts together.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompletedObject {
    /// Entity tag of the assembled object, when the service returns one.
    pub etag: Option<String>,
}

/// Async multipart-upload contract.
pub trait StorageClient: Send + Sync + 'static {
    /// Start a multipart upload for `destination`, returning its session id.
    fn create_session(
        &self,
        destination: &Destination,
    ) -> Pin<Box<dyn Future<Output = Result<SessionId, StorageError>> + Send + '_>>;

    /// Upload one part, returning its acknowledgment token.
    fn upload_part(
        &self,
        destination: &Destination,
        session_id: &SessionId,
        part_number: u32,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<PartToken, StorageError>> + Send + '_>>;

    /// Finalize the upload from `parts`, which must be sorted by part number.
    fn complete_session(
        &self,
        destination: &Destination,
        session_id: &SessionId,
        parts: &[CompletedPart],
    ) -> Pin<Box<dyn Future<Output = Result<CompletedObject, StorageError>> + Send + '_>>;

    /// Abandon the upload and discard any uploaded parts.
    fn abort_session(
        &self,
        destination: &Destination,
        session_id: &SessionId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>>;

    /// List the parts the service holds for a session, returning how many.
    ///
    /// Used as a visibility check right after creation.
    fn list_parts(
        &self,
        destination: &Destination,
        session_id: &SessionId,
    ) -> Pin<Box<dyn Future<Output = Result<usize, StorageError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_display() {
        let dest = Destination::new("my-bucket", "path/to/object.bin");
        assert_eq!(dest.to_string(), "my-bucket/path/to/object.bin");
    }

    #[test]
    fn test_session_id_and_token_accessors() {
        let id = SessionId::new("abc-123");
        assert_eq!(id.as_str(), "abc-123");
        assert_eq!(id.to_string(), "abc-123");

        let token = PartToken::new("\"d41d8cd98f00b204e9800998ecf8427e\"");
        assert_eq!(token.as_str(), "\"d41d8cd98f00b204e9800998ecf8427e\"");
    }
}
