//! s3stream library -- stream bytes into S3-compatible object storage.
//!
//! This crate uploads data that only becomes available incrementally,
//! using the storage service's multipart-upload protocol without buffering
//! the whole object in memory.  [`writer::ObjectWriter`] is the byte sink;
//! [`upload::MultipartUpload`] coordinates one session (part numbering,
//! creation gating, completion gating, abort and transient-error retry);
//! [`storage::client::StorageClient`] abstracts the remote service.

pub mod activation;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod retry;
pub mod storage;
pub mod upload;
pub mod writer;

pub use errors::{ErrorKind, Operation, StorageError, UploadError};
pub use storage::client::{Destination, StorageClient};
pub use upload::{CompletedUpload, MultipartUpload, SessionStatus};
pub use writer::ObjectWriter;
