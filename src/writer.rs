//! Streaming writer that turns a byte stream into multipart-upload parts.
//!
//! [`ObjectWriter`] buffers incoming bytes and hands the whole buffer to its
//! [`MultipartUpload`] as one part whenever the buffer reaches the part-size
//! threshold.  Whatever is left when the stream ends becomes the final part,
//! which the storage service allows to be smaller than the minimum (even
//! empty).
//!
//! The writer also implements [`tokio::io::AsyncWrite`], so it can be the
//! sink of `tokio::io::copy`; shutting it down finishes the upload.

use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::config::UploadConfig;
use crate::errors::UploadError;
use crate::storage::client::{Destination, StorageClient};
use crate::upload::{CompletedUpload, MultipartUpload, SessionStatus};

type Completion = Pin<Box<dyn Future<Output = Result<CompletedUpload, UploadError>> + Send>>;

enum Closing {
    Open,
    /// The final part is queued and completion requested.
    Finishing(Completion),
    Closed(Result<CompletedUpload, UploadError>),
}

/// Writable byte sink backed by one multipart-upload session.
pub struct ObjectWriter {
    upload: MultipartUpload,
    buffer: BytesMut,
    part_size: usize,
    closing: Closing,
}

impl ObjectWriter {
    /// Open a session for `destination` and return a writer feeding it.
    ///
    /// The create call goes out immediately; writes are accepted before it
    /// resolves.
    pub fn new(
        client: Arc<dyn StorageClient>,
        destination: Destination,
        config: &UploadConfig,
    ) -> Result<Self, UploadError> {
        let upload = MultipartUpload::start(client, destination, config)?;
        Ok(Self {
            upload,
            buffer: BytesMut::new(),
            part_size: config.part_size,
            closing: Closing::Open,
        })
    }

    /// The session behind this writer.
    pub fn upload(&self) -> &MultipartUpload {
        &self.upload
    }

    /// Watch the session's lifecycle, including fatal errors.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.upload.subscribe()
    }

    /// Bytes written but not yet handed over as a part.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Parts handed to the session so far.
    pub fn parts_dispatched(&self) -> u32 {
        self.upload.part_count()
    }

    /// Append `data`, flushing the buffer as a part once it reaches the
    /// part-size threshold.
    ///
    /// A part may exceed the threshold by up to one chunk; chunks are never
    /// split.
    pub fn write(&mut self, data: &[u8]) -> Result<(), UploadError> {
        if !matches!(self.closing, Closing::Open) {
            return Err(UploadError::AlreadyCompleting);
        }
        if self.upload.is_aborted() {
            return Err(UploadError::Aborted);
        }
        if let SessionStatus::Failed(err) = self.upload.status() {
            return Err(err);
        }

        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= self.part_size {
            let part = mem::take(&mut self.buffer);
            self.dispatch(part.freeze())?;
        }
        Ok(())
    }

    fn dispatch(&mut self, part: Bytes) -> Result<u32, UploadError> {
        let size = part.len();
        let part_number = self.upload.upload(part)?;
        debug!(
            "Flushed part {} ({} bytes) for {}",
            part_number,
            size,
            self.upload.destination()
        );
        Ok(part_number)
    }

    /// Flush the remainder as the final part and request completion.
    fn begin_finish(&mut self) -> Completion {
        let remainder = mem::take(&mut self.buffer).freeze();
        match self.dispatch(remainder) {
            Ok(_) => Box::pin(self.upload.complete()),
            Err(err) => Box::pin(async move { Err(err) }),
        }
    }

    /// End the stream: flush the remainder as the final part and wait for
    /// the object to be finalized.
    pub async fn finish(mut self) -> Result<CompletedUpload, UploadError> {
        match mem::replace(&mut self.closing, Closing::Open) {
            Closing::Open => self.begin_finish().await,
            Closing::Finishing(completion) => completion.await,
            Closing::Closed(result) => result,
        }
    }

    /// Copy `reader` to the end and finish the upload.
    ///
    /// If reading or finishing fails the upload is aborted, so no parts are
    /// left behind on the service, and the original error is returned.
    pub async fn copy_from<R>(&mut self, reader: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let result = match tokio::io::copy(reader, self).await {
            Ok(copied) => self.shutdown().await.map(|()| copied),
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            warn!(
                "Streaming to {} failed, aborting: {}",
                self.upload.destination(),
                err
            );
            if let Err(abort_err) = self.upload.abort().await {
                error!(
                    "Abort of {} failed: {}",
                    self.upload.destination(),
                    abort_err
                );
            }
        }
        result
    }

    /// Abort the upload, discarding any buffered bytes.
    pub async fn abort(mut self) -> Result<(), UploadError> {
        let discarded = self.buffer.len();
        self.buffer.clear();
        if discarded > 0 {
            debug!(
                "Discarding {} buffered bytes for {}",
                discarded,
                self.upload.destination()
            );
        }
        self.upload.abort().await
    }

    /// Result of a shutdown driven through [`AsyncWrite`], once known.
    pub fn outcome(&self) -> Option<&Result<CompletedUpload, UploadError>> {
        match &self.closing {
            Closing::Closed(result) => Some(result),
            _ => None,
        }
    }
}

impl AsyncWrite for ObjectWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.write(buf)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Parts are handed over as soon as they fill; a partial buffer
        // cannot be sent early without breaking the minimum part size.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.closing {
                Closing::Open => {
                    let completion = this.begin_finish();
                    this.closing = Closing::Finishing(completion);
                }
                Closing::Finishing(completion) => {
                    let result = ready!(completion.as_mut().poll(cx));
                    this.closing = Closing::Closed(result);
                }
                Closing::Closed(Ok(_)) => return Poll::Ready(Ok(())),
                Closing::Closed(Err(err)) => return Poll::Ready(Err(err.clone().into())),
            }
        }
    }
}

// -- Tests -------------------------------------------------------------------
