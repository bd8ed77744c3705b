//! Incremental multipart upload coordination
//!
//! The coordinator buffers capture fragments until they reach the minimum
//! part size, then delivers coalesced parts to the storage endpoint through
//! a single serialized queue. Exactly one worker task consumes the queue per
//! session, so at most one part transfer is in flight at a time and the
//! endpoint observes strictly increasing part numbers. Counters and the part
//! list are only mutated under one lock, from the submission path and the
//! worker.

use crate::endpoint::{PartAck, StorageEndpoint, StorageSession};
use crate::error::{UploadError, UploadResult};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Default minimum part size (5 MiB)
pub const DEFAULT_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Coalesces small capture fragments into parts large enough to satisfy the
/// storage endpoint's minimum part size. A flush always hands off the entire
/// pending buffer as one part; it is never split across two submissions.
#[derive(Debug)]
pub struct ChunkBuffer {
    pending: BytesMut,
    min_part_size: usize,
}

impl ChunkBuffer {
    /// Create a buffer that flushes once `min_part_size` bytes accumulate
    pub fn new(min_part_size: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            min_part_size,
        }
    }

    /// Append a fragment, returning the coalesced pending buffer when it
    /// has reached the minimum part size
    pub fn append(&mut self, fragment: &[u8]) -> Option<Bytes> {
        self.pending.extend_from_slice(fragment);
        if self.pending.len() >= self.min_part_size {
            Some(self.pending.split().freeze())
        } else {
            None
        }
    }

    /// Take whatever remains, even below the minimum part size
    pub fn take_remaining(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().freeze())
        }
    }

    /// Bytes currently buffered but not yet handed off
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// Discard all buffered bytes
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Upload status of one part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    /// Submitted to the queue, transfer not started
    Queued,
    /// Transfer in flight
    Uploading,
    /// Transfer finished and acknowledgement recorded
    Complete,
    /// Retry budget exhausted
    Error,
}

/// One unit of upload, tracked for progress reporting
#[derive(Debug, Clone)]
pub struct ChunkPart {
    /// Part number, positive and strictly increasing, assigned once
    pub part_number: u32,
    /// Total size of the part in bytes
    pub size_bytes: u64,
    /// Bytes transferred so far, never exceeds `size_bytes`
    pub uploaded_bytes: u64,
    /// Current status
    pub status: PartStatus,
}

/// Upload coordinator configuration
#[derive(Debug, Clone)]
pub struct UploadCoordinatorConfig {
    /// Minimum coalesced part size; the final part may be smaller
    pub min_part_size: usize,
    /// Maximum transfer attempts per part
    pub max_attempts: u32,
    /// Base delay between retry attempts, grows linearly per attempt
    pub retry_base_delay: Duration,
    /// Content type sent with each part transfer
    pub content_type: String,
}

impl Default for UploadCoordinatorConfig {
    fn default() -> Self {
        Self {
            min_part_size: DEFAULT_MIN_PART_SIZE,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            content_type: "video/webm".to_string(),
        }
    }
}

impl UploadCoordinatorConfig {
    /// Validate configuration
    pub fn validate(&self) -> UploadResult<()> {
        if self.min_part_size == 0 {
            return Err(UploadError::InvalidConfiguration {
                message: "Minimum part size must be > 0".to_string(),
            });
        }

        if self.max_attempts == 0 {
            return Err(UploadError::InvalidConfiguration {
                message: "Max attempts must be > 0".to_string(),
            });
        }

        if self.content_type.is_empty() {
            return Err(UploadError::InvalidConfiguration {
                message: "Content type must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

/// Snapshot of upload progress
#[derive(Debug, Clone)]
pub struct UploadProgress {
    /// All parts submitted so far, in submission order
    pub parts: Vec<ChunkPart>,
    /// Cumulative bytes transferred across all parts
    pub bytes_uploaded: u64,
    /// Bytes buffered but not yet submitted
    pub bytes_buffered: u64,
    /// Number of acknowledged parts
    pub acknowledged_parts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Lifecycle {
    Active,
    Finalizing,
    Finalized(String),
    Failed,
    Cancelled,
}

#[derive(Debug)]
struct CoordinatorState {
    buffer: ChunkBuffer,
    parts: Vec<ChunkPart>,
    acks: Vec<PartAck>,
    bytes_uploaded: u64,
    next_part_number: u32,
    parts_submitted: u32,
    failed_part: Option<(u32, u32)>,
    lifecycle: Lifecycle,
}

enum Job {
    Part { part_number: u32, data: Bytes },
    Drain { done: oneshot::Sender<()> },
}

struct Inner {
    endpoint: Arc<dyn StorageEndpoint>,
    storage: StorageSession,
    config: UploadCoordinatorConfig,
    state: Mutex<CoordinatorState>,
    abort_tx: watch::Sender<bool>,
}

/// Serializes part uploads against one remote session.
///
/// Parts run strictly in submission order through a single worker task;
/// failed transfers are retried with increasing backoff; `finalize` and
/// `cancel` are idempotent.
pub struct UploadCoordinator {
    inner: Arc<Inner>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl UploadCoordinator {
    /// Create a coordinator for an already-created remote session and spawn
    /// its worker task
    pub fn new(
        endpoint: Arc<dyn StorageEndpoint>,
        storage: StorageSession,
        config: UploadCoordinatorConfig,
    ) -> UploadResult<Self> {
        config.validate()?;

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (abort_tx, abort_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            endpoint,
            storage,
            state: Mutex::new(CoordinatorState {
                buffer: ChunkBuffer::new(config.min_part_size),
                parts: Vec::new(),
                acks: Vec::new(),
                bytes_uploaded: 0,
                next_part_number: 1,
                parts_submitted: 0,
                failed_part: None,
                lifecycle: Lifecycle::Active,
            }),
            config,
            abort_tx,
        });

        tokio::spawn(run_worker(inner.clone(), jobs_rx, abort_rx));

        Ok(Self {
            inner,
            jobs: jobs_tx,
        })
    }

    /// Create the remote session and a coordinator for it in one step
    pub async fn create(
        endpoint: Arc<dyn StorageEndpoint>,
        config: UploadCoordinatorConfig,
    ) -> UploadResult<Self> {
        let storage = endpoint.create().await?;
        info!(
            session_id = %storage.session_id,
            upload_id = %storage.upload_id,
            "upload session created"
        );
        Self::new(endpoint, storage, config)
    }

    /// Identifiers of the remote session this coordinator uploads into
    pub fn storage_session(&self) -> &StorageSession {
        &self.inner.storage
    }

    /// Push a capture fragment into the chunk buffer, submitting a
    /// coalesced part once the buffer crosses the minimum part size
    pub fn push_fragment(&self, fragment: Bytes) {
        let mut state = self.inner.state.lock();
        if state.lifecycle != Lifecycle::Active {
            debug!("fragment dropped; coordinator no longer active");
            return;
        }

        if let Some(part) = state.buffer.append(&fragment) {
            self.submit_part_locked(&mut state, part);
        }
    }

    fn submit_part_locked(&self, state: &mut CoordinatorState, data: Bytes) -> u32 {
        let part_number = state.next_part_number;
        state.next_part_number += 1;
        state.parts_submitted += 1;
        state.parts.push(ChunkPart {
            part_number,
            size_bytes: data.len() as u64,
            uploaded_bytes: 0,
            status: PartStatus::Queued,
        });
        debug!(part_number, size = data.len(), "part queued");
        let _ = self.jobs.send(Job::Part { part_number, data });
        part_number
    }

    async fn drain(&self) -> UploadResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.jobs
            .send(Job::Drain { done: done_tx })
            .map_err(|_| UploadError::InvalidState {
                message: "upload worker has shut down".to_string(),
            })?;
        done_rx.await.map_err(|_| UploadError::InvalidState {
            message: "upload worker exited before draining".to_string(),
        })
    }

    /// Flush remaining buffered bytes, drain the queue, and complete the
    /// remote session.
    ///
    /// When no part was ever acknowledged (short recordings that never
    /// crossed the minimum part size), the whole blob is uploaded as a
    /// single part instead. Idempotent: a second call after success returns
    /// the cached share URL without a second `complete` call.
    pub async fn finalize(
        &self,
        whole_blob: Bytes,
        thumbnail: Option<String>,
    ) -> UploadResult<String> {
        {
            let mut state = self.inner.state.lock();
            match &state.lifecycle {
                Lifecycle::Finalized(share_url) => return Ok(share_url.clone()),
                Lifecycle::Cancelled => return Err(UploadError::Cancelled),
                Lifecycle::Finalizing => {
                    return Err(UploadError::InvalidState {
                        message: "finalize already in progress".to_string(),
                    })
                }
                Lifecycle::Failed => {
                    return Err(UploadError::InvalidState {
                        message: "finalize already failed".to_string(),
                    })
                }
                Lifecycle::Active => state.lifecycle = Lifecycle::Finalizing,
            }

            if state.parts_submitted > 0 {
                if let Some(remainder) = state.buffer.take_remaining() {
                    self.submit_part_locked(&mut state, remainder);
                }
            } else {
                // The whole blob covers these bytes
                state.buffer.clear();
            }
        }

        self.drain().await?;
        self.check_failed_part()?;

        let needs_whole_blob = self.inner.state.lock().acks.is_empty();
        if needs_whole_blob {
            info!(
                size = whole_blob.len(),
                "no parts acknowledged; uploading whole blob as a single part"
            );
            {
                let mut state = self.inner.state.lock();
                self.submit_part_locked(&mut state, whole_blob);
            }
            self.drain().await?;
            self.check_failed_part()?;
        }

        let acks = {
            let mut state = self.inner.state.lock();
            state.acks.sort_by_key(|ack| ack.part_number);
            state.acks.clone()
        };

        let result = self
            .inner
            .endpoint
            .complete(&self.inner.storage, &acks, thumbnail.as_deref())
            .await;

        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Cancelled {
            return Err(UploadError::Cancelled);
        }
        match result {
            Ok(share_url) => {
                info!(
                    parts = acks.len(),
                    bytes = state.bytes_uploaded,
                    "upload session finalized"
                );
                state.lifecycle = Lifecycle::Finalized(share_url.clone());
                Ok(share_url)
            }
            Err(e) => {
                error!(error = %e, "upload session completion failed");
                state.lifecycle = Lifecycle::Failed;
                Err(UploadError::Finalize {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn check_failed_part(&self) -> UploadResult<()> {
        let mut state = self.inner.state.lock();
        if let Some((part_number, attempts)) = state.failed_part {
            state.lifecycle = Lifecycle::Failed;
            return Err(UploadError::RetriesExhausted {
                part_number,
                attempts,
            });
        }
        Ok(())
    }

    /// Abort the remote session and discard buffered state.
    ///
    /// In-flight transfers observe the abort signal and stop as soon as
    /// possible. Idempotent, and never fails: abort errors are logged and
    /// swallowed since the session is being discarded regardless.
    pub async fn cancel(&self) {
        {
            let mut state = self.inner.state.lock();
            match state.lifecycle {
                Lifecycle::Cancelled | Lifecycle::Finalized(_) => return,
                _ => state.lifecycle = Lifecycle::Cancelled,
            }
            state.buffer.clear();
            state.parts.clear();
            state.acks.clear();
        }

        let _ = self.inner.abort_tx.send(true);

        // Drain the queue, swallowing errors
        let (done_tx, done_rx) = oneshot::channel();
        if self.jobs.send(Job::Drain { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }

        if let Err(e) = self.inner.endpoint.abort(&self.inner.storage).await {
            warn!(error = %e, "abort request failed; session is being discarded anyway");
        }
        debug!(session_id = %self.inner.storage.session_id, "upload session aborted");
    }

    /// Snapshot current upload progress
    pub fn progress(&self) -> UploadProgress {
        let state = self.inner.state.lock();
        UploadProgress {
            parts: state.parts.clone(),
            bytes_uploaded: state.bytes_uploaded,
            bytes_buffered: state.buffer.pending_bytes() as u64,
            acknowledged_parts: state.acks.len() as u32,
        }
    }

    /// Whether finalize has succeeded
    pub fn is_finalized(&self) -> bool {
        matches!(self.inner.state.lock().lifecycle, Lifecycle::Finalized(_))
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    abort_rx: watch::Receiver<bool>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Part { part_number, data } => {
                upload_with_retry(&inner, &abort_rx, part_number, data).await;
            }
            Job::Drain { done } => {
                let _ = done.send(());
            }
        }
    }
    debug!("upload worker stopped");
}

async fn upload_with_retry(
    inner: &Arc<Inner>,
    abort_rx: &watch::Receiver<bool>,
    part_number: u32,
    data: Bytes,
) {
    let max_attempts = inner.config.max_attempts;
    let size = data.len() as u64;

    for attempt in 1..=max_attempts {
        if *abort_rx.borrow() {
            set_part_status(inner, part_number, PartStatus::Error);
            debug!(part_number, "part transfer skipped; upload cancelled");
            return;
        }

        reset_part_progress(inner, part_number);
        set_part_status(inner, part_number, PartStatus::Uploading);

        match attempt_transfer(inner, abort_rx, part_number, data.clone()).await {
            Ok(tag) => {
                let mut guard = inner.state.lock();
                let state = &mut *guard;
                if let Some(part) = state
                    .parts
                    .iter_mut()
                    .find(|part| part.part_number == part_number)
                {
                    state.bytes_uploaded += size - part.uploaded_bytes;
                    part.uploaded_bytes = size;
                    part.status = PartStatus::Complete;
                }
                if state.lifecycle != Lifecycle::Cancelled {
                    state.acks.push(PartAck { part_number, tag });
                }
                info!(part_number, size, attempt, "part upload complete");
                return;
            }
            Err(e) => {
                if matches!(e, UploadError::Cancelled) {
                    set_part_status(inner, part_number, PartStatus::Error);
                    return;
                }
                warn!(part_number, attempt, error = %e, "part upload attempt failed");
                if attempt < max_attempts {
                    let jitter = rand::thread_rng().gen_range(0..100);
                    let delay =
                        inner.config.retry_base_delay * attempt + Duration::from_millis(jitter);
                    tokio::time::sleep(delay).await;
                } else {
                    let mut state = inner.state.lock();
                    if let Some(part) = state
                        .parts
                        .iter_mut()
                        .find(|part| part.part_number == part_number)
                    {
                        part.status = PartStatus::Error;
                    }
                    if state.failed_part.is_none() {
                        state.failed_part = Some((part_number, max_attempts));
                    }
                    error!(part_number, attempts = max_attempts, "part upload failed");
                }
            }
        }
    }
}

async fn attempt_transfer(
    inner: &Arc<Inner>,
    abort_rx: &watch::Receiver<bool>,
    part_number: u32,
    data: Bytes,
) -> UploadResult<String> {
    let presigned = inner
        .endpoint
        .presign(&inner.storage, part_number)
        .await?;

    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(forward_progress(inner.clone(), part_number, progress_rx));

    let result = inner
        .endpoint
        .put_part(
            &presigned.presigned_url,
            part_number,
            data,
            &inner.config.content_type,
            progress_tx,
            abort_rx.clone(),
        )
        .await;

    // The endpoint dropped its progress sender; wait for the forwarder so
    // all progress deltas are applied before the part is marked
    let _ = forwarder.await;
    result
}

async fn forward_progress(
    inner: Arc<Inner>,
    part_number: u32,
    mut progress_rx: mpsc::UnboundedReceiver<u64>,
) {
    while let Some(transferred) = progress_rx.recv().await {
        let mut guard = inner.state.lock();
        let state = &mut *guard;
        if let Some(part) = state
            .parts
            .iter_mut()
            .find(|part| part.part_number == part_number)
        {
            let transferred = transferred.min(part.size_bytes);
            if transferred > part.uploaded_bytes {
                state.bytes_uploaded += transferred - part.uploaded_bytes;
                part.uploaded_bytes = transferred;
            }
        }
    }
}

fn set_part_status(inner: &Arc<Inner>, part_number: u32, status: PartStatus) {
    let mut state = inner.state.lock();
    if let Some(part) = state
        .parts
        .iter_mut()
        .find(|part| part.part_number == part_number)
    {
        part.status = status;
    }
}

fn reset_part_progress(inner: &Arc<Inner>, part_number: u32) {
    let mut guard = inner.state.lock();
    let state = &mut *guard;
    if let Some(part) = state
        .parts
        .iter_mut()
        .find(|part| part.part_number == part_number)
    {
        state.bytes_uploaded -= part.uploaded_bytes;
        part.uploaded_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_flushes_at_threshold() {
        let mut buffer = ChunkBuffer::new(1024);

        assert!(buffer.append(&[0u8; 512]).is_none());
        assert_eq!(buffer.pending_bytes(), 512);

        let part = buffer.append(&[1u8; 512]).expect("buffer should flush");
        assert_eq!(part.len(), 1024);
        assert_eq!(buffer.pending_bytes(), 0);
    }

    #[test]
    fn test_buffer_never_splits_a_flush() {
        let mut buffer = ChunkBuffer::new(1024);

        // A large fragment flushes in full, not trimmed to the threshold
        let part = buffer.append(&[0u8; 3000]).expect("buffer should flush");
        assert_eq!(part.len(), 3000);
        assert_eq!(buffer.pending_bytes(), 0);
    }

    #[test]
    fn test_buffer_take_remaining() {
        let mut buffer = ChunkBuffer::new(1024);
        assert!(buffer.take_remaining().is_none());

        buffer.append(&[0u8; 100]);
        let remainder = buffer.take_remaining().expect("remainder expected");
        assert_eq!(remainder.len(), 100);
        assert!(buffer.take_remaining().is_none());
    }

    #[test]
    fn test_config_validation() {
        assert!(UploadCoordinatorConfig::default().validate().is_ok());

        let config = UploadCoordinatorConfig {
            min_part_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = UploadCoordinatorConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = UploadCoordinatorConfig {
            content_type: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
