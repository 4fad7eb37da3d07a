//! In-memory multipart-upload service.
//!
//! Sessions and their parts are held in a `tokio::sync::Mutex<MemoryState>`.
//! Completion validates the finalize list the way an S3 server does
//! (ascending order, matching ETags, 5 MiB minimum for non-final parts) and
//! stores the assembled object so callers can read it back.
//!
//! A configurable memory limit (`max_size_bytes`) caps total stored bytes.
//!
//! The client also carries the hooks tests and dry runs need: scripted
//! failures per operation, gates that hold creation or a given part until
//! released, and a log of every call attempt.

use bytes::Bytes;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{watch, Mutex};

use super::client::{
    CompletedObject, CompletedPart, Destination, PartToken, SessionId, StorageClient,
};
use crate::errors::{ErrorKind, Operation, StorageError};
use crate::upload::MIN_PART_SIZE;

/// One remote call as seen by the memory service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateSession {
        destination: Destination,
    },
    UploadPart {
        session_id: SessionId,
        part_number: u32,
        data: Bytes,
    },
    CompleteSession {
        session_id: SessionId,
        parts: Vec<CompletedPart>,
    },
    AbortSession {
        session_id: SessionId,
    },
    ListParts {
        session_id: SessionId,
    },
}

impl Call {
    pub fn operation(&self) -> Operation {
        match self {
            Call::CreateSession { .. } => Operation::CreateSession,
            Call::UploadPart { .. } => Operation::UploadPart,
            Call::CompleteSession { .. } => Operation::CompleteSession,
            Call::AbortSession { .. } => Operation::AbortSession,
            Call::ListParts { .. } => Operation::ListParts,
        }
    }
}

/// A logged call attempt and whether it succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub call: Call,
    pub succeeded: bool,
}

/// An assembled object.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Concatenated part data.
    pub data: Bytes,
    /// Composite ETag: MD5 of the concatenated binary part MD5s + `-{count}`.
    pub etag: String,
    /// Size of each part, in part-number order.
    pub part_sizes: Vec<usize>,
}

/// An open multipart upload.
#[derive(Debug)]
struct MemorySession {
    destination: Destination,
    /// part_number -> (data, etag).
    parts: BTreeMap<u32, (Bytes, String)>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sessions: HashMap<SessionId, MemorySession>,
    objects: HashMap<Destination, StoredObject>,
    /// Failures to return, front first, for each operation.
    faults: HashMap<Operation, VecDeque<ErrorKind>>,
    calls: Vec<CallRecord>,
    /// Bytes held in open sessions plus assembled objects.
    current_size: u64,
}

impl MemoryState {
    /// Pop the next scripted failure for `call`, logging the attempt either way.
    fn take_fault(&mut self, call: &Call) -> Option<StorageError> {
        let operation = call.operation();
        let fault = self
            .faults
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front());
        self.calls.push(CallRecord {
            call: call.clone(),
            succeeded: fault.is_none(),
        });
        fault.map(|kind| StorageError::new(kind, operation, "scripted failure"))
    }

    /// Mark the most recent log entry as failed.
    fn mark_last_failed(&mut self) {
        if let Some(last) = self.calls.last_mut() {
            last.succeeded = false;
        }
    }
}

/// In-process storage service.
pub struct MemoryClient {
    state: Mutex<MemoryState>,
    /// Maximum bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
    /// Held operations; `false` while held.
    op_gates: std::sync::Mutex<HashMap<Operation, watch::Sender<bool>>>,
    /// Held parts, keyed by part number.
    part_gates: std::sync::Mutex<HashMap<u32, watch::Sender<bool>>>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MemoryClient {
    /// Create a new `MemoryClient` holding at most `max_size_bytes` (0 = unlimited).
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            max_size_bytes,
            op_gates: std::sync::Mutex::new(HashMap::new()),
            part_gates: std::sync::Mutex::new(HashMap::new()),
        }
    }

    // ── ETag helpers ────────────────────────────────────────────────

    /// Compute the quoted MD5-hex ETag for a byte slice.
    fn compute_etag(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }

    // ── Test and dry-run hooks ─────────────────────────────────────

    /// Make the next `times` calls of `operation` fail with `kind`.
    pub async fn fail_next(&self, operation: Operation, kind: ErrorKind, times: usize) {
        let mut state = self.state.lock().await;
        let queue = state.faults.entry(operation).or_default();
        queue.extend(std::iter::repeat(kind).take(times));
    }

    /// Hold every call of `operation` until [`release`](Self::release).
    ///
    /// Held calls are logged once they get through.
    pub fn hold(&self, operation: Operation) {
        let mut gates = self
            .op_gates
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        gates
            .entry(operation)
            .or_insert_with(|| watch::channel(true).0)
            .send_replace(false);
    }

    pub fn release(&self, operation: Operation) {
        let gates = self
            .op_gates
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(gate) = gates.get(&operation) {
            gate.send_replace(true);
        }
    }

    pub fn hold_create(&self) {
        self.hold(Operation::CreateSession);
    }

    pub fn release_create(&self) {
        self.release(Operation::CreateSession);
    }

    /// Hold `upload_part` calls for `part_number` until released.
    pub fn hold_part(&self, part_number: u32) {
        let mut gates = self
            .part_gates
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        gates
            .entry(part_number)
            .or_insert_with(|| watch::channel(true).0)
            .send_replace(false);
    }

    pub fn release_part(&self, part_number: u32) {
        let gates = self
            .part_gates
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(gate) = gates.get(&part_number) {
            gate.send_replace(true);
        }
    }

    /// Every call attempt so far, in arrival order.
    pub async fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().await.calls.clone()
    }

    /// Attempts (successful or not) of one operation.
    pub async fn calls_for(&self, operation: Operation) -> Vec<CallRecord> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|record| record.call.operation() == operation)
            .cloned()
            .collect()
    }

    /// Number of successful calls of one operation.
    pub async fn successful(&self, operation: Operation) -> usize {
        self.calls_for(operation)
            .await
            .iter()
            .filter(|record| record.succeeded)
            .count()
    }

    /// The assembled object at `destination`, once an upload completed.
    pub async fn object(&self, destination: &Destination) -> Option<StoredObject> {
        self.state.lock().await.objects.get(destination).cloned()
    }

    /// Parts currently held for an open session, in part-number order.
    pub async fn session_parts(&self, session_id: &SessionId) -> Option<Vec<(u32, Bytes)>> {
        let state = self.state.lock().await;
        state.sessions.get(session_id).map(|session| {
            session
                .parts
                .iter()
                .map(|(number, (data, _))| (*number, data.clone()))
                .collect()
        })
    }

    /// Number of sessions neither completed nor aborted.
    pub async fn open_sessions(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    // ── Memory accounting ──────────────────────────────────────────

    /// Check whether adding `additional` bytes would exceed the memory limit.
    fn check_capacity(
        &self,
        state: &MemoryState,
        operation: Operation,
        additional: u64,
    ) -> Result<(), StorageError> {
        if self.max_size_bytes == 0 {
            return Ok(());
        }
        if state.current_size + additional > self.max_size_bytes {
            return Err(StorageError::new(
                ErrorKind::Service,
                operation,
                format!(
                    "Memory limit exceeded: current={}, additional={additional}, max={}",
                    state.current_size, self.max_size_bytes
                ),
            ));
        }
        Ok(())
    }

    fn no_such_upload(operation: Operation, session_id: &SessionId) -> StorageError {
        StorageError::new(
            ErrorKind::SessionNotYetVisible,
            operation,
            format!("The specified upload does not exist: {session_id}"),
        )
    }

    async fn pass_gate(&self, operation: Operation) {
        let gate = {
            let gates = self
                .op_gates
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            gates.get(&operation).map(|gate| gate.subscribe())
        };
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }
    }

    fn part_gate(&self, part_number: u32) -> Option<watch::Receiver<bool>> {
        let gates = self
            .part_gates
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        gates.get(&part_number).map(|gate| gate.subscribe())
    }
}

/// Validate a finalize list against stored parts and assemble the object.
fn assemble(
    stored: &BTreeMap<u32, (Bytes, String)>,
    requested: &[CompletedPart],
) -> Result<StoredObject, StorageError> {
    let invalid_part = || {
        StorageError::new(
            ErrorKind::InvalidPart,
            Operation::CompleteSession,
            "One or more of the specified parts could not be found. The part may not have been uploaded, or the specified entity tag may not match the part's entity tag.",
        )
    };

    // Validate ascending part order.
    for pair in requested.windows(2) {
        if pair[1].part_number <= pair[0].part_number {
            return Err(StorageError::new(
                ErrorKind::InvalidPartOrder,
                Operation::CompleteSession,
                "The list of parts was not in ascending order.",
            ));
        }
    }

    let mut data: Vec<u8> = Vec::new();
    let mut combined_md5_bytes: Vec<u8> = Vec::new();
    let mut part_sizes = Vec::with_capacity(requested.len());

    for (i, part) in requested.iter().enumerate() {
        let (part_data, etag) = stored.get(&part.part_number).ok_or_else(invalid_part)?;

        if part.token.as_str().trim_matches('"') != etag.trim_matches('"') {
            return Err(invalid_part());
        }

        // Validate minimum part size (5 MiB) for all parts except the last.
        let is_last = i == requested.len() - 1;
        if !is_last && part_data.len() < MIN_PART_SIZE {
            return Err(StorageError::new(
                ErrorKind::EntityTooSmall,
                Operation::CompleteSession,
                format!(
                    "Part {} is {} bytes, smaller than the minimum allowed size",
                    part.part_number,
                    part_data.len()
                ),
            ));
        }

        let hex_str = etag.trim_matches('"');
        if let Ok(bytes) = hex::decode(hex_str) {
            combined_md5_bytes.extend_from_slice(&bytes);
        }
        data.extend_from_slice(part_data);
        part_sizes.push(part_data.len());
    }

    let mut composite_hasher = Md5::new();
    composite_hasher.update(&combined_md5_bytes);
    let etag = format!(
        "\"{}-{}\"",
        hex::encode(composite_hasher.finalize()),
        requested.len()
    );

    Ok(StoredObject {
        data: Bytes::from(data),
        etag,
        part_sizes,
    })
}

impl StorageClient for MemoryClient {
    fn create_session(
        &self,
        destination: &Destination,
    ) -> Pin<Box<dyn Future<Output = Result<SessionId, StorageError>> + Send + '_>> {
        let destination = destination.clone();
        Box::pin(async move {
            self.pass_gate(Operation::CreateSession).await;

            let mut state = self.state.lock().await;
            let call = Call::CreateSession {
                destination: destination.clone(),
            };
            if let Some(err) = state.take_fault(&call) {
                return Err(err);
            }

            let session_id = SessionId::new(uuid::Uuid::new_v4().to_string());
            state.sessions.insert(
                session_id.clone(),
                MemorySession {
                    destination,
                    parts: BTreeMap::new(),
                },
            );
            tracing::debug!("Memory create_session: upload={}", session_id);
            Ok(session_id)
        })
    }

    fn upload_part(
        &self,
        _destination: &Destination,
        session_id: &SessionId,
        part_number: u32,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<PartToken, StorageError>> + Send + '_>> {
        let session_id = session_id.clone();
        Box::pin(async move {
            if let Some(mut gate) = self.part_gate(part_number) {
                let _ = gate.wait_for(|open| *open).await;
            }

            let mut state = self.state.lock().await;
            let call = Call::UploadPart {
                session_id: session_id.clone(),
                part_number,
                data: data.clone(),
            };
            if let Some(err) = state.take_fault(&call) {
                return Err(err);
            }

            let existing = state.sessions.get(&session_id).map(|session| {
                session
                    .parts
                    .get(&part_number)
                    .map(|(d, _)| d.len() as u64)
                    .unwrap_or(0)
            });
            let Some(old_len) = existing else {
                state.mark_last_failed();
                return Err(Self::no_such_upload(Operation::UploadPart, &session_id));
            };

            let new_len = data.len() as u64;
            if new_len > old_len {
                if let Err(err) =
                    self.check_capacity(&state, Operation::UploadPart, new_len - old_len)
                {
                    state.mark_last_failed();
                    return Err(err);
                }
            }

            let etag = Self::compute_etag(&data);
            if let Some(session) = state.sessions.get_mut(&session_id) {
                session.parts.insert(part_number, (data, etag.clone()));
            }
            state.current_size = state.current_size - old_len + new_len;

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
        let parts = parts.to_vec();
        Box::pin(async move {
            self.pass_gate(Operation::CompleteSession).await;
            let mut state = self.state.lock().await;
            let call = Call::CompleteSession {
                session_id: session_id.clone(),
                parts: parts.clone(),
            };
            if let Some(err) = state.take_fault(&call) {
                return Err(err);
            }

            let assembled = match state.sessions.get(&session_id) {
                Some(session) if session.destination == destination => {
                    assemble(&session.parts, &parts)
                }
                _ => Err(Self::no_such_upload(Operation::CompleteSession, &session_id)),
            };
            let object = match assembled {
                Ok(object) => object,
                Err(err) => {
                    state.mark_last_failed();
                    return Err(err);
                }
            };

            // Part data moves into the object; only a replaced object frees space.
            if let Some(session) = state.sessions.remove(&session_id) {
                let held: u64 = session.parts.values().map(|(d, _)| d.len() as u64).sum();
                state.current_size = state.current_size.saturating_sub(held);
            }
            let replaced = state
                .objects
                .get(&destination)
                .map(|o| o.data.len() as u64)
                .unwrap_or(0);
            state.current_size =
                state.current_size.saturating_sub(replaced) + object.data.len() as u64;

            let etag = object.etag.clone();
            tracing::debug!(
                "Memory complete_session: upload={} object={} size={}",
                session_id,
                destination,
                object.data.len()
            );
            state.objects.insert(destination, object);

            Ok(CompletedObject { etag: Some(etag) })
        })
    }

    fn abort_session(
        &self,
        _destination: &Destination,
        session_id: &SessionId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let session_id = session_id.clone();
        Box::pin(async move {
            self.pass_gate(Operation::AbortSession).await;
            let mut state = self.state.lock().await;
            let call = Call::AbortSession {
                session_id: session_id.clone(),
            };
            if let Some(err) = state.take_fault(&call) {
                return Err(err);
            }

            match state.sessions.remove(&session_id) {
                Some(session) => {
                    let held: u64 = session.parts.values().map(|(d, _)| d.len() as u64).sum();
                    state.current_size = state.current_size.saturating_sub(held);
                    Ok(())
                }
                None => {
                    state.mark_last_failed();
                    Err(Self::no_such_upload(Operation::AbortSession, &session_id))
                }
            }
        })
    }

    fn list_parts(
        &self,
        _destination: &Destination,
        session_id: &SessionId,
    ) -> Pin<Box<dyn Future<Output = Result<usize, StorageError>> + Send + '_>> {
        let session_id = session_id.clone();
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let call = Call::ListParts {
                session_id: session_id.clone(),
            };
            if let Some(err) = state.take_fault(&call) {
                return Err(err);
            }

            let count = state.sessions.get(&session_id).map(|s| s.parts.len());
            match count {
                Some(count) => Ok(count),
                None => {
                    state.mark_last_failed();
                    Err(Self::no_such_upload(Operation::ListParts, &session_id))
                }
            }
        })
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn dest() -> Destination {
        Destination::new("test-bucket", "key.bin")
    }

    fn part(number: u32, token: &PartToken) -> CompletedPart {
        CompletedPart {
            part_number: number,
            token: token.clone(),
        }
    }

    #[tokio::test]
    async fn test_single_part_roundtrip() {
        let client = MemoryClient::default();
        let id = client.create_session(&dest()).await.unwrap();

        let token = client
            .upload_part(&dest(), &id, 1, Bytes::from("hello world"))
            .await
            .unwrap();
        assert_eq!(token.as_str(), "\"5eb63bbbe01eeed093cb22bb8f5acdc3\"");

        let done = client
            .complete_session(&dest(), &id, &[part(1, &token)])
            .await
            .unwrap();
        assert!(done.etag.unwrap().ends_with("-1\""));

        let object = client.object(&dest()).await.unwrap();
        assert_eq!(object.data, Bytes::from("hello world"));
        assert_eq!(object.part_sizes, vec![11]);
        assert_eq!(client.open_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_zero_length_final_part() {
        let client = MemoryClient::default();
        let id = client.create_session(&dest()).await.unwrap();
        let token = client.upload_part(&dest(), &id, 1, Bytes::new()).await.unwrap();
        assert_eq!(token.as_str(), "\"d41d8cd98f00b204e9800998ecf8427e\"");

        client
            .complete_session(&dest(), &id, &[part(1, &token)])
            .await
            .unwrap();
        assert_eq!(client.object(&dest()).await.unwrap().data.len(), 0);
    }

    #[tokio::test]
    async fn test_complete_rejects_small_non_final_part() {
        let client = MemoryClient::default();
        let id = client.create_session(&dest()).await.unwrap();
        let t1 = client
            .upload_part(&dest(), &id, 1, Bytes::from("small"))
            .await
            .unwrap();
        let t2 = client
            .upload_part(&dest(), &id, 2, Bytes::from("tail"))
            .await
            .unwrap();

        let err = client
            .complete_session(&dest(), &id, &[part(1, &t1), part(2, &t2)])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::EntityTooSmall);
        assert_eq!(client.open_sessions().await, 1);
    }

    #[tokio::test]
    async fn test_complete_rejects_descending_order() {
        let client = MemoryClient::default();
        let id = client.create_session(&dest()).await.unwrap();
        let big = Bytes::from(vec![0u8; MIN_PART_SIZE]);
        let t1 = client.upload_part(&dest(), &id, 1, big.clone()).await.unwrap();
        let t2 = client.upload_part(&dest(), &id, 2, big).await.unwrap();

        let err = client
            .complete_session(&dest(), &id, &[part(2, &t2), part(1, &t1)])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidPartOrder);
    }

    #[tokio::test]
    async fn test_complete_rejects_wrong_token() {
        let client = MemoryClient::default();
        let id = client.create_session(&dest()).await.unwrap();
        client
            .upload_part(&dest(), &id, 1, Bytes::from("data"))
            .await
            .unwrap();

        let err = client
            .complete_session(&dest(), &id, &[part(1, &PartToken::new("\"bogus\""))])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidPart);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_yet_visible() {
        let client = MemoryClient::default();
        let id = SessionId::new("missing");
        let err = client
            .upload_part(&dest(), &id, 1, Bytes::from("x"))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let err = client.abort_session(&dest(), &id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SessionNotYetVisible);

        let calls = client.calls().await;
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|record| !record.succeeded));
    }

    #[tokio::test]
    async fn test_abort_discards_parts() {
        let client = MemoryClient::default();
        let id = client.create_session(&dest()).await.unwrap();
        client
            .upload_part(&dest(), &id, 1, Bytes::from("data"))
            .await
            .unwrap();
        assert_eq!(client.list_parts(&dest(), &id).await.unwrap(), 1);

        client.abort_session(&dest(), &id).await.unwrap();
        assert_eq!(client.open_sessions().await, 0);
        assert!(client.session_parts(&id).await.is_none());
        assert!(client.object(&dest()).await.is_none());
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let client = MemoryClient::default();
        client
            .fail_next(Operation::CreateSession, ErrorKind::AccessDenied, 1)
            .await;

        let err = client.create_session(&dest()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AccessDenied);
        assert!(client.create_session(&dest()).await.is_ok());

        assert_eq!(client.calls_for(Operation::CreateSession).await.len(), 2);
        assert_eq!(client.successful(Operation::CreateSession).await, 1);
    }

    #[tokio::test]
    async fn test_memory_limit() {
        let client = MemoryClient::new(10);
        let id = client.create_session(&dest()).await.unwrap();
        client
            .upload_part(&dest(), &id, 1, Bytes::from("12345"))
            .await
            .unwrap();

        let err = client
            .upload_part(&dest(), &id, 2, Bytes::from("1234567890"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Service);
        assert!(err.message.contains("Memory limit exceeded"));
    }

    #[tokio::test]
    async fn test_hold_create_blocks_until_released() {
        let client = Arc::new(MemoryClient::default());
        client.hold_create();

        let task = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.create_session(&dest()).await })
        };
        tokio::task::yield_now().await;
        assert!(client.calls().await.is_empty());

        client.release_create();
        let id = task.await.unwrap().unwrap();
        assert!(client.session_parts(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_hold_complete_blocks_until_released() {
        let client = Arc::new(MemoryClient::default());
        let id = client.create_session(&dest()).await.unwrap();
        client.hold(Operation::CompleteSession);

        let task = {
            let client = Arc::clone(&client);
            let id = id.clone();
            tokio::spawn(async move { client.complete_session(&dest(), &id, &[]).await })
        };
        tokio::task::yield_now().await;
        assert!(client.calls_for(Operation::CompleteSession).await.is_empty());

        client.release(Operation::CompleteSession);
        task.await.unwrap().unwrap();
        assert!(client.object(&dest()).await.is_some());
    }
}
