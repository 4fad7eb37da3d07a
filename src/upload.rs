//! Multipart-upload session coordinator.
//!
//! A [`MultipartUpload`] owns one session on the storage service.  It fires
//! the create call as soon as it is constructed and accepts parts right away:
//! anything that needs the session id is parked in an [`Activation`] queue
//! and released, in order, when creation resolves.
//!
//! Parts are numbered when they are handed over, not when they are sent, so
//! numbering follows flush order regardless of network timing.  Each part is
//! sent from its own task; acknowledgments may arrive in any order and are
//! matched back to their record by part number.  Finalization starts only
//! once a completion has been requested and no dispatched part is still
//! waiting for its token.
//!
//! Every terminal outcome (completed, aborted, failed) is published on a
//! `tokio::sync::watch` channel; see [`MultipartUpload::subscribe`].

use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::activation::Activation;
use crate::config::UploadConfig;
use crate::errors::{Operation, UploadError};
use crate::metrics::{
    BYTES_UPLOADED_TOTAL, PARTS_UPLOADED_TOTAL, PART_UPLOAD_DURATION_SECONDS, SESSIONS_TOTAL,
};
use crate::retry::RetryPolicy;
use crate::storage::client::{
    CompletedObject, CompletedPart, Destination, PartToken, SessionId, StorageClient,
};

/// Smallest size the service accepts for any part but the last (5 MiB).
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Largest size the service accepts for a single part (5 GiB).
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Most parts a single upload may have.
pub const MAX_PARTS: u32 = 10_000;

/// Sessions created before giving up on one the service never confirms.
pub const MAX_SESSION_CREATES: u32 = 3;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone)]
pub enum SessionStatus {
    /// The create call has not resolved yet.
    Creating,
    /// The service assigned this session id.
    Active(SessionId),
    Completed(CompletedUpload),
    Aborted,
    /// A fatal error ended the session.
    Failed(UploadError),
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed(_) | SessionStatus::Aborted | SessionStatus::Failed(_)
        )
    }
}

/// Summary of a finalized upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub destination: Destination,
    pub session_id: SessionId,
    /// Entity tag of the assembled object, when the service returned one.
    pub etag: Option<String>,
    pub parts: u32,
    pub bytes: u64,
}

/// One part handed to the session.
#[derive(Debug)]
struct PartRecord {
    part_number: u32,
    size: usize,
    /// Released once the part is acknowledged.
    payload: Option<Bytes>,
    token: Option<PartToken>,
}

/// Mutable session state.  Never held across an `.await`.
#[derive(Debug, Default)]
struct UploadSession {
    parts: Vec<PartRecord>,
    /// Pending completion callback.
    completion: Option<oneshot::Sender<Result<CompletedUpload, UploadError>>>,
    completion_requested: bool,
    /// The finalize call has been scheduled.
    finalizing: bool,
    /// Completed, aborted or failed.
    terminal: bool,
}

impl UploadSession {
    /// True while some dispatched part has no acknowledgment token.
    fn is_waiting_for_uploads(&self) -> bool {
        self.parts.iter().any(|part| part.token.is_none())
    }

    /// Finalize list: every part's (number, token), sorted by part number.
    fn completed_parts(&self) -> Vec<CompletedPart> {
        let mut parts: Vec<CompletedPart> = self
            .parts
            .iter()
            .filter_map(|part| {
                part.token.as_ref().map(|token| CompletedPart {
                    part_number: part.part_number,
                    token: token.clone(),
                })
            })
            .collect();
        parts.sort_by_key(|part| part.part_number);
        parts
    }

    fn total_bytes(&self) -> u64 {
        self.parts.iter().map(|part| part.size as u64).sum()
    }
}

struct Inner {
    client: Arc<dyn StorageClient>,
    destination: Destination,
    retry: RetryPolicy,
    probe_visibility: bool,
    runtime: Handle,
    activation: Activation,
    aborted: AtomicBool,
    session: Mutex<UploadSession>,
    status: watch::Sender<SessionStatus>,
    /// Outcome of the first `abort`, shared by every caller.
    abort_outcome: watch::Sender<Option<Result<(), UploadError>>>,
}

/// Handle to one multipart-upload session.
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct MultipartUpload {
    inner: Arc<Inner>,
}

impl MultipartUpload {
    /// Open a session for `destination` and fire the create call.
    ///
    /// Must be called from within a tokio runtime; every remote call is
    /// spawned on it.
    pub fn start(
        client: Arc<dyn StorageClient>,
        destination: Destination,
        config: &UploadConfig,
    ) -> Result<Self, UploadError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| UploadError::NoRuntime(e.to_string()))?;
        let (status, _) = watch::channel(SessionStatus::Creating);
        let (abort_outcome, _) = watch::channel(None);

        let inner = Arc::new(Inner {
            client,
            destination,
            retry: config.retry_policy(),
            probe_visibility: config.probe_visibility,
            runtime,
            activation: Activation::new(),
            aborted: AtomicBool::new(false),
            session: Mutex::new(UploadSession::default()),
            status,
            abort_outcome,
        });

        info!("Starting multipart upload to {}", inner.destination);
        let task = Arc::clone(&inner);
        inner.runtime.spawn(task.create());

        Ok(Self { inner })
    }

    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    /// The session id, once creation has resolved.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.activation.session_id()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    /// Watch lifecycle changes.  A fatal error shows up as
    /// [`SessionStatus::Failed`].
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.is_aborted()
    }

    /// Parts handed to the session so far.
    pub fn part_count(&self) -> u32 {
        self.inner.lock().parts.len() as u32
    }

    /// Parts dispatched but not yet acknowledged.
    pub fn pending_parts(&self) -> usize {
        self.inner
            .lock()
            .parts
            .iter()
            .filter(|part| part.token.is_none())
            .count()
    }

    /// Hand `data` to the session as the next part, returning its number.
    ///
    /// The send starts immediately if the session is active, otherwise as
    /// soon as creation resolves.  Never waits on the network.
    pub fn upload(&self, data: Bytes) -> Result<u32, UploadError> {
        let part_number = {
            let mut session = self.inner.lock();
            if self.inner.is_aborted() {
                return Err(UploadError::Aborted);
            }
            if let Some(err) = self.inner.failure() {
                return Err(err);
            }
            if session.completion_requested {
                return Err(UploadError::AlreadyCompleting);
            }

            let part_number = session.parts.len() as u32 + 1;
            if part_number > MAX_PARTS {
                Err(part_number)
            } else {
                session.parts.push(PartRecord {
                    part_number,
                    size: data.len(),
                    payload: Some(data),
                    token: None,
                });
                Ok(part_number)
            }
        };

        let part_number = match part_number {
            Ok(number) => number,
            Err(number) => {
                let err = UploadError::TooManyParts(number);
                self.inner.fail(err.clone());
                return Err(err);
            }
        };

        debug!(
            "Queued part {} for {}",
            part_number, self.inner.destination
        );
        let inner = Arc::clone(&self.inner);
        self.inner
            .activation
            .on_active(move |id| inner.spawn_part(id.clone(), part_number));

        Ok(part_number)
    }

    /// Request finalization once every dispatched part is acknowledged.
    ///
    /// The request is registered immediately; the returned future resolves
    /// exactly once, with the finalized object or the error that ended the
    /// session.
    pub fn complete(
        &self,
    ) -> impl Future<Output = Result<CompletedUpload, UploadError>> + Send + 'static {
        let requested = self.request_completion();
        async move {
            let receiver = requested?;
            receiver.await.unwrap_or(Err(UploadError::SessionDropped))
        }
    }

    fn request_completion(
        &self,
    ) -> Result<oneshot::Receiver<Result<CompletedUpload, UploadError>>, UploadError> {
        let (sender, receiver) = oneshot::channel();
        let finalize_now = {
            let mut session = self.inner.lock();
            if self.inner.is_aborted() {
                return Err(UploadError::Aborted);
            }
            if let Some(err) = self.inner.failure() {
                return Err(err);
            }
            if session.completion_requested {
                return Err(UploadError::AlreadyCompleting);
            }
            session.completion = Some(sender);
            session.completion_requested = true;

            let ready = !session.is_waiting_for_uploads();
            if ready {
                session.finalizing = true;
            }
            ready
        };

        if finalize_now {
            let inner = Arc::clone(&self.inner);
            self.inner
                .activation
                .on_active(move |id| inner.spawn_finalize(id.clone()));
        } else {
            debug!(
                "Completion of {} waiting for {} part(s)",
                self.inner.destination,
                self.pending_parts()
            );
        }

        Ok(receiver)
    }

    /// Abort the session.
    ///
    /// Marks the session aborted right away, resolves a pending completion
    /// with [`UploadError::Aborted`], and issues the abort call once the
    /// session id is known.  Also releases the remote parts of a session
    /// that already failed.  Safe to call repeatedly: the remote call goes
    /// out at most once and every caller observes the same outcome.
    pub fn abort(&self) -> impl Future<Output = Result<(), UploadError>> + Send + 'static {
        let mut outcome = self.inner.abort_outcome.subscribe();

        if !self.inner.aborted.swap(true, Ordering::SeqCst) {
            let completion = {
                let mut session = self.inner.lock();
                // A finalize already under way reports its own outcome.
                if session.finalizing {
                    None
                } else {
                    session.completion.take()
                }
            };
            if let Some(sender) = completion {
                let _ = sender.send(Err(UploadError::Aborted));
            }

            if self.inner.is_completed() {
                self.inner
                    .resolve_abort(Err(UploadError::AlreadyCompleted));
            } else {
                info!("Aborting multipart upload to {}", self.inner.destination);
                let inner = Arc::clone(&self.inner);
                let queued = self
                    .inner
                    .activation
                    .on_active(move |id| inner.spawn_abort(id.clone()));
                if !queued {
                    // No session was ever created; nothing to release.
                    self.inner.resolve_abort(Ok(()));
                }
            }
        }

        async move {
            match outcome.wait_for(Option::is_some).await {
                Ok(resolved) => resolved.clone().unwrap_or(Err(UploadError::SessionDropped)),
                Err(_) => Err(UploadError::SessionDropped),
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, UploadSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn is_terminal(&self) -> bool {
        self.lock().terminal
    }

    fn is_completed(&self) -> bool {
        matches!(&*self.status.borrow(), SessionStatus::Completed(_))
    }

    /// Record the abort outcome.  Only the first resolution counts.
    fn resolve_abort(&self, result: Result<(), UploadError>) {
        self.abort_outcome.send_if_modified(|outcome| {
            if outcome.is_none() {
                *outcome = Some(result);
                true
            } else {
                false
            }
        });
    }

    /// Creation (or its visibility check) failed: drop queued work and end
    /// the session.
    fn creation_failed(&self, err: UploadError) {
        let dropped = self.activation.fail();
        debug!(
            "Dropped {} queued operation(s) for {}",
            dropped, self.destination
        );
        self.fail(err);
        if self.is_aborted() {
            self.resolve_abort(Ok(()));
        }
    }

    fn failure(&self) -> Option<UploadError> {
        match &*self.status.borrow() {
            SessionStatus::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    async fn create(self: Arc<Self>) {
        let mut creates = 0;
        let id = loop {
            creates += 1;
            let id = match self.client.create_session(&self.destination).await {
                Ok(id) => id,
                Err(err) => {
                    self.creation_failed(UploadError::CreateFailed(err));
                    return;
                }
            };
            debug!("Created multipart upload {} for {}", id, self.destination);

            if !self.probe_visibility {
                break id;
            }
            match self.confirm_visible(&id).await {
                // An abort still needs the id to release the session.
                Ok(()) | Err(UploadError::Aborted) => break id,
                Err(UploadError::RetriesExhausted { .. }) if creates < MAX_SESSION_CREATES => {
                    warn!(
                        "Multipart upload {} for {} never became visible, creating another",
                        id, self.destination
                    );
                }
                Err(err) => {
                    self.creation_failed(err);
                    return;
                }
            }
        };

        self.status.send_if_modified(|status| {
            if matches!(status, SessionStatus::Creating) {
                *status = SessionStatus::Active(id.clone());
                true
            } else {
                false
            }
        });

        let fired = self.activation.activate(id.clone());
        info!(
            "Multipart upload {} active for {} ({} queued operation(s))",
            id, self.destination, fired
        );
    }

    /// List the session's parts until the service admits it exists.
    async fn confirm_visible(&self, id: &SessionId) -> Result<(), UploadError> {
        self.retry
            .run(
                Operation::ListParts,
                || self.is_aborted(),
                || self.client.list_parts(&self.destination, id),
            )
            .await
            .map(|_| ())
    }

    fn spawn_part(self: &Arc<Self>, id: SessionId, part_number: u32) {
        let inner = Arc::clone(self);
        self.runtime.spawn(inner.send_part(id, part_number));
    }

    async fn send_part(self: Arc<Self>, id: SessionId, part_number: u32) {
        let payload = {
            let session = self.lock();
            if session.terminal {
                return;
            }
            session
                .parts
                .iter()
                .find(|part| part.part_number == part_number)
                .and_then(|part| part.payload.clone())
        };
        let Some(payload) = payload else {
            return;
        };

        let started = Instant::now();
        let result = self
            .retry
            .run(
                Operation::UploadPart,
                || self.is_aborted() || self.is_terminal(),
                || {
                    self.client
                        .upload_part(&self.destination, &id, part_number, payload.clone())
                },
            )
            .await;

        match result {
            Ok(token) => self.on_part_uploaded(&id, part_number, token, started.elapsed()),
            Err(UploadError::Aborted) => {
                debug!("Part {} of {} dropped", part_number, id);
            }
            Err(err) => self.fail(err),
        }
    }

    fn on_part_uploaded(
        self: &Arc<Self>,
        id: &SessionId,
        part_number: u32,
        token: PartToken,
        elapsed: Duration,
    ) {
        let (size, finalize) = {
            let mut session = self.lock();
            let mut size = 0;
            if let Some(part) = session
                .parts
                .iter_mut()
                .find(|part| part.part_number == part_number)
            {
                part.token = Some(token);
                part.payload = None;
                size = part.size;
            }

            let finalize = session.completion_requested
                && !session.finalizing
                && !session.terminal
                && !self.is_aborted()
                && !session.is_waiting_for_uploads();
            if finalize {
                session.finalizing = true;
            }
            (size, finalize)
        };

        debug!(
            "Part {} of {} acknowledged ({} bytes in {:?})",
            part_number, id, size, elapsed
        );
        metrics::counter!(PARTS_UPLOADED_TOTAL).increment(1);
        metrics::counter!(BYTES_UPLOADED_TOTAL).increment(size as u64);
        metrics::histogram!(PART_UPLOAD_DURATION_SECONDS).record(elapsed.as_secs_f64());

        if finalize {
            self.spawn_finalize(id.clone());
        }
    }

    fn spawn_finalize(self: &Arc<Self>, id: SessionId) {
        let inner = Arc::clone(self);
        self.runtime.spawn(inner.finalize(id));
    }

    async fn finalize(self: Arc<Self>, id: SessionId) {
        let (parts, bytes) = {
            let session = self.lock();
            (session.completed_parts(), session.total_bytes())
        };
        debug!(
            "Completing multipart upload {} with {} part(s)",
            id,
            parts.len()
        );

        let result = self
            .retry
            .run(
                Operation::CompleteSession,
                || self.is_aborted(),
                || self.client.complete_session(&self.destination, &id, &parts),
            )
            .await;

        match result {
            Ok(object) => self.on_completed(id, object, parts.len() as u32, bytes),
            Err(UploadError::Aborted) => {
                debug!("Completion of {} dropped after abort", id);
                let completion = self.lock().completion.take();
                if let Some(sender) = completion {
                    let _ = sender.send(Err(UploadError::Aborted));
                }
            }
            Err(err) => self.fail(err),
        }
    }

    fn on_completed(&self, id: SessionId, object: CompletedObject, parts: u32, bytes: u64) {
        let completion = {
            let mut session = self.lock();
            if session.terminal {
                warn!(
                    "Multipart upload {} completed remotely after the session ended",
                    id
                );
                return;
            }
            session.terminal = true;
            session.completion.take()
        };

        let summary = CompletedUpload {
            destination: self.destination.clone(),
            session_id: id,
            etag: object.etag,
            parts,
            bytes,
        };
        info!(
            "Completed multipart upload {} to {} ({} parts, {} bytes)",
            summary.session_id, summary.destination, parts, bytes
        );
        metrics::counter!(SESSIONS_TOTAL, "outcome" => "completed").increment(1);

        self.status
            .send_replace(SessionStatus::Completed(summary.clone()));
        if let Some(sender) = completion {
            let _ = sender.send(Ok(summary));
        }
    }

    fn spawn_abort(self: &Arc<Self>, id: SessionId) {
        let inner = Arc::clone(self);
        self.runtime.spawn(inner.send_abort(id));
    }

    async fn send_abort(self: Arc<Self>, id: SessionId) {
        // A finalize that was already on the wire may still win.
        let result = self
            .retry
            .run(
                Operation::AbortSession,
                || self.is_completed(),
                || self.client.abort_session(&self.destination, &id),
            )
            .await;

        match result {
            Ok(()) => {
                self.on_aborted(&id);
                self.resolve_abort(Ok(()));
            }
            Err(UploadError::Aborted) => self.resolve_abort(Err(UploadError::AlreadyCompleted)),
            Err(err) => {
                self.fail(err.clone());
                self.resolve_abort(Err(err));
            }
        }
    }

    fn on_aborted(&self, id: &SessionId) {
        {
            let mut session = self.lock();
            if session.terminal {
                debug!("Released parts of ended upload {}", id);
                return;
            }
            session.terminal = true;
        }
        info!("Aborted multipart upload {} to {}", id, self.destination);
        metrics::counter!(SESSIONS_TOTAL, "outcome" => "aborted").increment(1);
        self.status.send_replace(SessionStatus::Aborted);
    }

    /// End the session with a fatal error.  Later failures are ignored.
    fn fail(&self, err: UploadError) {
        let completion = {
            let mut session = self.lock();
            if session.terminal {
                debug!(
                    "Ignoring error after {} ended: {}",
                    self.destination, err
                );
                return;
            }
            session.terminal = true;
            session.completion.take()
        };

        error!("Multipart upload to {} failed: {}", self.destination, err);
        metrics::counter!(SESSIONS_TOTAL, "outcome" => "failed").increment(1);

        self.status.send_replace(SessionStatus::Failed(err.clone()));
        if let Some(sender) = completion {
            let _ = sender.send(Err(err));
        }
    }
}

// -- Tests -------------------------------------------------------------------
