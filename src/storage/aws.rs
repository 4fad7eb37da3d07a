//! AWS S3 storage client.
//!
//! Issues the multipart-upload calls against a real S3 (or S3-compatible)
//! endpoint.  Credentials are resolved via the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role, etc.) unless explicit keys are
//! configured.
//!
//! S3 answers `NoSuchUpload` for a freshly created upload until creation has
//! propagated, so that code is classified as
//! [`ErrorKind::SessionNotYetVisible`].

use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::CompletedMultipartUpload;
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info};

use super::client::{
    CompletedObject, CompletedPart, Destination, PartToken, SessionId, StorageClient,
};
use crate::errors::{ErrorKind, Operation, StorageError};

/// Storage client backed by the AWS SDK.
pub struct AwsS3Client {
    /// AWS S3 SDK client.
    client: Client,
}

impl AwsS3Client {
    /// Create a new AWS S3 client for `region`.
    ///
    /// `endpoint_url` points at an S3-compatible service (MinIO, LocalStack).
    pub async fn new(
        region: String,
        endpoint_url: Option<String>,
        use_path_style: bool,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()));

        if let Some(ref endpoint) = endpoint_url {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        // If explicit credentials are provided, inject them as static credentials.
        if let (Some(ref ak), Some(ref sk)) = (&access_key_id, &secret_access_key) {
            let creds = aws_sdk_s3::config::Credentials::new(
                ak,
                sk,
                None, // session_token
                None, // expiry
                "s3stream-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;

        let s3_config_builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(use_path_style);

        let client = Client::from_conf(s3_config_builder.build());

        info!(
            "AWS S3 client initialized: region={} endpoint={}",
            region,
            endpoint_url.as_deref().unwrap_or("default")
        );

        Ok(Self { client })
    }

    /// Map an AWS SDK error to a classified [`StorageError`].
    fn map_sdk_error<E, R>(operation: Operation, err: SdkError<E, R>) -> StorageError
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        let kind = match &err {
            SdkError::ServiceError(context) => context
                .err()
                .code()
                .map(ErrorKind::from_code)
                .unwrap_or(ErrorKind::Service),
            SdkError::TimeoutError(_)
            | SdkError::DispatchFailure(_)
            | SdkError::ResponseError(_) => ErrorKind::Transport,
            _ => ErrorKind::Service,
        };
        StorageError::new(kind, operation, DisplayErrorContext(&err).to_string())
    }
}

/// S3 part numbers are `i32` on the wire.
fn sdk_part_number(operation: Operation, part_number: u32) -> Result<i32, StorageError> {
    i32::try_from(part_number).map_err(|_| {
        StorageError::new(
            ErrorKind::InvalidPart,
            operation,
            format!("part number {part_number} out of range"),
        )
    })
}

/// Convert a finalize list into SDK `CompletedPart`s, preserving order.
fn sdk_completed_parts(
    parts: &[CompletedPart],
) -> Result<Vec<aws_sdk_s3::types::CompletedPart>, StorageError> {
    parts
        .iter()
        .map(|part| {
            let number = sdk_part_number(Operation::CompleteSession, part.part_number)?;
            Ok(aws_sdk_s3::types::CompletedPart::builder()
                .e_tag(part.token.as_str())
                .part_number(number)
                .build())
        })
        .collect()
}

impl StorageClient for AwsS3Client {
    fn create_session(
        &self,
        destination: &Destination,
    ) -> Pin<Box<dyn Future<Output = Result<SessionId, StorageError>> + Send + '_>> {
        let destination = destination.clone();
        Box::pin(async move {
            debug!(
                "AWS create_multipart_upload: bucket={} key={}",
                destination.bucket, destination.key
            );

            let resp = self
                .client
                .create_multipart_upload()
                .bucket(&destination.bucket)
                .key(&destination.key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(Operation::CreateSession, e))?;

            let upload_id = resp.upload_id().ok_or_else(|| {
                StorageError::new(
                    ErrorKind::Service,
                    Operation::CreateSession,
                    "AWS did not return upload ID",
                )
            })?;

            Ok(SessionId::new(upload_id))
        })
    }

    fn upload_part(
        &self,
        destination: &Destination,
        session_id: &SessionId,
        part_number: u32,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<PartToken, StorageError>> + Send + '_>> {
        let destination = destination.clone();
        let session_id = session_id.clone();
        Box::pin(async move {
            let number = sdk_part_number(Operation::UploadPart, part_number)?;

            debug!(
                "AWS upload_part: bucket={} key={} upload={} part={} size={}",
                destination.bucket,
                destination.key,
                session_id,
                part_number,
                data.len()
            );

            let resp = self
                .client
                .upload_part()
                .bucket(&destination.bucket)
                .key(&destination.key)
                .upload_id(session_id.as_str())
                .part_number(number)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(Operation::UploadPart, e))?;

            let etag = resp.e_tag().ok_or_else(|| {
                StorageError::new(
                    ErrorKind::Service,
                    Operation::UploadPart,
                    format!("AWS did not return an ETag for part {part_number}"),
                )
            })?;

            Ok(PartToken::new(etag))
        })
    }

    fn complete_session(
        &self,
        destination: &Destination,
        session_id: &SessionId,
        parts: &[CompletedPart],
    ) -> Pin<Box<dyn Future<Output = Result<CompletedObject, StorageError>> + Send + '_>> {
        let destination = destination.clone();
        let session_id = session_id.clone();
        let parts = sdk_completed_parts(parts);
        Box::pin(async move {
            let parts = parts?;

            debug!(
                "AWS complete_multipart_upload: bucket={} key={} upload={} parts={}",
                destination.bucket,
                destination.key,
                session_id,
                parts.len()
            );

            let completed_upload = CompletedMultipartUpload::builder()
                .set_parts(Some(parts))
                .build();

            let resp = self
                .client
                .complete_multipart_upload()
                .bucket(&destination.bucket)
                .key(&destination.key)
                .upload_id(session_id.as_str())
                .multipart_upload(completed_upload)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(Operation::CompleteSession, e))?;

            Ok(CompletedObject {
                etag: resp.e_tag().map(|s| s.to_string()),
            })
        })
    }

    fn abort_session(
        &self,
        destination: &Destination,
        session_id: &SessionId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let destination = destination.clone();
        let session_id = session_id.clone();
        Box::pin(async move {
            debug!(
                "AWS abort_multipart_upload: bucket={} key={} upload={}",
                destination.bucket, destination.key, session_id
            );

            self.client
                .abort_multipart_upload()
                .bucket(&destination.bucket)
                .key(&destination.key)
                .upload_id(session_id.as_str())
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(Operation::AbortSession, e))?;

            Ok(())
        })
    }

    fn list_parts(
        &self,
        destination: &Destination,
        session_id: &SessionId,
    ) -> Pin<Box<dyn Future<Output = Result<usize, StorageError>> + Send + '_>> {
        let destination = destination.clone();
        let session_id = session_id.clone();
        Box::pin(async move {
            debug!(
                "AWS list_parts: bucket={} key={} upload={}",
                destination.bucket, destination.key, session_id
            );

            let resp = self
                .client
                .list_parts()
                .bucket(&destination.bucket)
                .key(&destination.key)
                .upload_id(session_id.as_str())
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(Operation::ListParts, e))?;

            Ok(resp.parts().len())
        })
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdk_part_number_in_range() {
        assert_eq!(sdk_part_number(Operation::UploadPart, 1).unwrap(), 1);
        assert_eq!(sdk_part_number(Operation::UploadPart, 10_000).unwrap(), 10_000);
    }

    #[test]
    fn test_sdk_part_number_out_of_range() {
        let err = sdk_part_number(Operation::UploadPart, u32::MAX).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidPart);
        assert_eq!(err.operation, Operation::UploadPart);
    }

    #[test]
    fn test_sdk_completed_parts_preserves_order_and_tokens() {
        let parts = vec![
            CompletedPart {
                part_number: 1,
                token: PartToken::new("\"aaa\""),
            },
            CompletedPart {
                part_number: 2,
                token: PartToken::new("\"bbb\""),
            },
        ];

        let converted = sdk_completed_parts(&parts).unwrap();
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0].part_number(), Some(1));
        assert_eq!(converted[0].e_tag(), Some("\"aaa\""));
        assert_eq!(converted[1].part_number(), Some(2));
        assert_eq!(converted[1].e_tag(), Some("\"bbb\""));
    }

    #[test]
    fn test_sdk_completed_parts_empty() {
        assert!(sdk_completed_parts(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_map_timeout_error_is_transport() {
        let err: SdkError<
            aws_sdk_s3::operation::upload_part::UploadPartError,
            aws_sdk_s3::config::http::HttpResponse,
        > = SdkError::timeout_error("request timed out");
        let mapped = AwsS3Client::map_sdk_error(Operation::UploadPart, err);
        assert_eq!(mapped.kind, ErrorKind::Transport);
        assert!(!mapped.is_transient());
    }
}
