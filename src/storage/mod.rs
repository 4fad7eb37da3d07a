//! Storage-service clients.
//!
//! The [`client::StorageClient`] trait abstracts over the service that
//! receives multipart uploads.  Implementations include an AWS S3 client and
//! an in-process memory service used by tests and dry runs.

pub mod aws;
pub mod client;
pub mod memory;
