//! Capture session state machine
//!
//! A session owns one attempt to record and persist media. It reconciles
//! three independent processes: the capture source (which emits fragments
//! on its own schedule), the upload coordinator (which can fail, stall, and
//! retry), and user-driven control actions (pause/resume/stop/cancel).
//!
//! Lifecycle: `idle → creating → recording ⇄ paused → stopping → uploading
//! → completed | error`. `restart` tears the current session down and
//! re-enters `creating`; `cancel` aborts the upload and returns to `idle`.

use crate::config::{PauseBehavior, SessionConfig};
use crate::event::SessionEvent;
use bytes::Bytes;
use castvault_core::{
    StorageEndpoint, StorageSession, UploadCoordinator, UploadError, UploadProgress,
};
use castvault_media::{
    CaptureError, CaptureRequest, CaptureSource, SourceEvent, ThumbnailGenerator,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error type for capture session operations
#[derive(Error, Debug)]
pub enum RecorderError {
    /// Upload pipeline failure
    #[error(transparent)]
    Upload(#[from] UploadError),

    /// Capture source failure
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Invalid state for operation
    #[error("Invalid state: {message}")]
    InvalidState {
        /// State error message
        message: String,
    },

    /// Invalid configuration provided
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// Error message
        message: String,
    },
}

/// Result type alias for session operations
pub type RecorderResult<T> = Result<T, RecorderError>;

/// Phase of a capture session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderPhase {
    /// No session in progress
    Idle,
    /// Remote session and capture source being acquired
    Creating,
    /// Capturing and streaming parts
    Recording,
    /// Recording is paused
    Paused,
    /// Stop requested, waiting for the capture source
    Stopping,
    /// Awaiting flush and finalize
    Uploading,
    /// Recording persisted
    Completed,
    /// Session failed
    Error {
        /// User-facing reason
        reason: String,
    },
}

impl RecorderPhase {
    /// Whether a recording attempt is in progress
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RecorderPhase::Creating
                | RecorderPhase::Recording
                | RecorderPhase::Paused
                | RecorderPhase::Stopping
                | RecorderPhase::Uploading
        )
    }
}

/// Outcome of a completed recording
#[derive(Debug, Clone)]
pub struct RecordingResult {
    /// Durable share URL
    pub share_url: String,
    /// Recorded duration, excluding paused intervals
    pub duration: Duration,
    /// Total bytes the capture source emitted
    pub total_bytes: u64,
    /// Number of parts acknowledged by the storage endpoint
    pub parts_uploaded: u32,
}

struct SessionShared {
    phase: RwLock<RecorderPhase>,
    fragments: Mutex<Vec<Bytes>>,
    stop_ack: Mutex<Option<oneshot::Sender<()>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_phase(&self, phase: RecorderPhase) {
        *self.phase.write() = phase.clone();
        self.emit(SessionEvent::PhaseChanged { phase });
    }
}

/// One end-to-end attempt to capture and persist a recording
pub struct CaptureSession {
    config: SessionConfig,
    endpoint: Arc<dyn StorageEndpoint>,
    thumbnailer: Arc<dyn ThumbnailGenerator>,
    source: Arc<tokio::sync::Mutex<Box<dyn CaptureSource>>>,
    shared: Arc<SessionShared>,
    coordinator: Option<Arc<UploadCoordinator>>,
    pump_task: Option<JoinHandle<()>>,
    attempt_id: Option<Uuid>,
    last_request: Option<CaptureRequest>,
    started_at: Option<Instant>,
    started_wall: Option<DateTime<Utc>>,
    paused_accumulated: Duration,
    pause_started: Option<Instant>,
    has_audio_track: bool,
}

impl CaptureSession {
    /// Create a new idle session
    pub fn new(
        config: SessionConfig,
        endpoint: Arc<dyn StorageEndpoint>,
        source: Box<dyn CaptureSource>,
        thumbnailer: Arc<dyn ThumbnailGenerator>,
    ) -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            config,
            endpoint,
            thumbnailer,
            source: Arc::new(tokio::sync::Mutex::new(source)),
            shared: Arc::new(SessionShared {
                phase: RwLock::new(RecorderPhase::Idle),
                fragments: Mutex::new(Vec::new()),
                stop_ack: Mutex::new(None),
                events,
            }),
            coordinator: None,
            pump_task: None,
            attempt_id: None,
            last_request: None,
            started_at: None,
            started_wall: None,
            paused_accumulated: Duration::ZERO,
            pause_started: None,
            has_audio_track: false,
        }
    }

    /// Current phase
    pub fn phase(&self) -> RecorderPhase {
        self.shared.phase.read().clone()
    }

    /// Whether the acquired capture source carries an audio track
    pub fn has_audio_track(&self) -> bool {
        self.has_audio_track
    }

    /// Wall-clock time recording started, if a session is or was active
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_wall
    }

    /// Identifier of the current recording attempt, if any. Useful for
    /// correlating application logs with session logs.
    pub fn attempt_id(&self) -> Option<Uuid> {
        self.attempt_id
    }

    /// Elapsed recording time, excluding paused intervals
    pub fn elapsed(&self) -> Duration {
        let Some(started) = self.started_at else {
            return Duration::ZERO;
        };
        let mut paused = self.paused_accumulated;
        if let Some(pause_started) = self.pause_started {
            paused += pause_started.elapsed();
        }
        started.elapsed().saturating_sub(paused)
    }

    /// Identifiers of the active remote session, if any
    pub fn storage_session(&self) -> Option<StorageSession> {
        self.coordinator
            .as_ref()
            .map(|coordinator| coordinator.storage_session().clone())
    }

    /// Snapshot of upload progress, if an upload is active
    pub fn upload_progress(&self) -> Option<UploadProgress> {
        self.coordinator
            .as_ref()
            .map(|coordinator| coordinator.progress())
    }

    /// Subscribe to session events
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Start recording.
    ///
    /// Creates the remote upload session, acquires the capture source, and
    /// begins requesting fragments on the configured interval. Failure
    /// leaves no partial state behind: the remote session is aborted and
    /// the source released before the error is returned.
    pub async fn start(&mut self, request: CaptureRequest) -> RecorderResult<()> {
        {
            let phase = self.shared.phase.read().clone();
            if phase.is_active() {
                return Err(RecorderError::InvalidState {
                    message: format!("cannot start while {:?}", phase),
                });
            }
        }
        self.config.validate()?;
        self.clear_bookkeeping();

        let attempt_id = Uuid::new_v4();
        self.attempt_id = Some(attempt_id);
        self.last_request = Some(request.clone());
        self.shared.set_phase(RecorderPhase::Creating);
        info!(attempt = %attempt_id, mode = ?request.mode, "starting capture session");

        let coordinator = match UploadCoordinator::create(
            self.endpoint.clone(),
            self.config.upload_config(),
        )
        .await
        {
            Ok(coordinator) => Arc::new(coordinator),
            Err(e) => {
                let reason = e.to_string();
                self.fail(&reason);
                return Err(e.into());
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let info = {
            let mut source = self.source.lock().await;
            match source.start(&request, events_tx).await {
                Ok(info) => info,
                Err(e) => {
                    source.release();
                    drop(source);
                    // The remote session exists; abort it so nothing leaks
                    coordinator.cancel().await;
                    let reason = e.to_string();
                    self.fail(&reason);
                    return Err(e.into());
                }
            }
        };

        self.has_audio_track = info.has_audio;
        self.started_at = Some(Instant::now());
        self.started_wall = Some(Utc::now());
        self.coordinator = Some(coordinator.clone());
        self.pump_task = Some(tokio::spawn(run_pump(
            self.shared.clone(),
            self.source.clone(),
            coordinator,
            events_rx,
            self.config.fragment_interval,
            self.config.pause_behavior,
        )));

        self.shared.set_phase(RecorderPhase::Recording);
        debug!(source = %info.description, has_audio = info.has_audio, "capture source acquired");
        Ok(())
    }

    /// Pause recording. Affects elapsed-time accounting and, depending on
    /// the configured pause behavior, the capture source itself.
    pub async fn pause(&mut self) -> RecorderResult<()> {
        if self.phase() != RecorderPhase::Recording {
            return Err(RecorderError::InvalidState {
                message: "can only pause while recording".to_string(),
            });
        }

        if self.config.pause_behavior == PauseBehavior::SuspendFragments {
            self.source.lock().await.pause().await?;
        }
        self.pause_started = Some(Instant::now());
        self.shared.set_phase(RecorderPhase::Paused);
        Ok(())
    }

    /// Resume a paused recording
    pub async fn resume(&mut self) -> RecorderResult<()> {
        if self.phase() != RecorderPhase::Paused {
            return Err(RecorderError::InvalidState {
                message: "can only resume while paused".to_string(),
            });
        }

        if self.config.pause_behavior == PauseBehavior::SuspendFragments {
            self.source.lock().await.resume().await?;
        }
        if let Some(pause_started) = self.pause_started.take() {
            self.paused_accumulated += pause_started.elapsed();
        }
        self.shared.set_phase(RecorderPhase::Recording);
        Ok(())
    }

    /// Stop recording and finalize the upload.
    ///
    /// Requests one final fragment, signals the source to stop, and waits
    /// for its acknowledgement with a bounded timeout. If the
    /// acknowledgement never arrives but fragments were received, the
    /// session synthesizes completion from what is buffered. The capture
    /// device is only released once the final media blob is in hand.
    pub async fn stop(&mut self) -> RecorderResult<RecordingResult> {
        {
            let phase = self.phase();
            if !matches!(phase, RecorderPhase::Recording | RecorderPhase::Paused) {
                return Err(RecorderError::InvalidState {
                    message: format!("cannot stop while {:?}", phase),
                });
            }
        }

        // Fold an open pause interval into the accumulated total
        if let Some(pause_started) = self.pause_started.take() {
            self.paused_accumulated += pause_started.elapsed();
        }
        let duration = self.elapsed();
        self.shared.set_phase(RecorderPhase::Stopping);

        let (ack_tx, ack_rx) = oneshot::channel();
        *self.shared.stop_ack.lock() = Some(ack_tx);

        // Pull trailing bytes before signalling stop
        {
            let mut source = self.source.lock().await;
            if let Err(e) = source.request_fragment().await {
                debug!(error = %e, "final fragment request failed");
            }
        }
        tokio::time::sleep(self.config.final_fragment_grace).await;
        {
            let mut source = self.source.lock().await;
            if let Err(e) = source.stop().await {
                warn!(error = %e, "capture source stop failed");
            }
        }

        match tokio::time::timeout(self.config.stop_ack_timeout, ack_rx).await {
            Ok(Ok(())) => debug!("capture source acknowledged stop"),
            _ => {
                let have_fragments = !self.shared.fragments.lock().is_empty();
                if have_fragments {
                    warn!(
                        timeout = ?self.config.stop_ack_timeout,
                        "stop acknowledgement timed out; synthesizing completion from buffered fragments"
                    );
                } else {
                    let reason = "capture source produced no data".to_string();
                    self.teardown(true).await;
                    self.fail(&reason);
                    return Err(CaptureError::StopTimeout {
                        duration: self.config.stop_ack_timeout,
                    }
                    .into());
                }
            }
        }

        // Fragment requests end here; the final blob is being assembled
        if let Some(pump) = self.pump_task.take() {
            pump.abort();
        }

        let blob = {
            let fragments = self.shared.fragments.lock();
            let mut blob = Vec::with_capacity(
                fragments.iter().map(|fragment| fragment.len()).sum(),
            );
            for fragment in fragments.iter() {
                blob.extend_from_slice(fragment);
            }
            Bytes::from(blob)
        };
        let total_bytes = blob.len() as u64;

        // Only now is it safe to close the device handles
        self.source.lock().await.release();

        self.shared.set_phase(RecorderPhase::Uploading);

        let thumbnail = match self.thumbnailer.generate(&blob).await {
            Ok(thumbnail) => thumbnail,
            Err(e) => {
                warn!(error = %e, "thumbnail generation failed; continuing without one");
                None
            }
        };

        let coordinator =
            self.coordinator
                .clone()
                .ok_or_else(|| RecorderError::InvalidState {
                    message: "no upload coordinator for active session".to_string(),
                })?;

        match coordinator.finalize(blob, thumbnail).await {
            Ok(share_url) => {
                let parts_uploaded = coordinator.progress().acknowledged_parts;
                self.shared.set_phase(RecorderPhase::Completed);
                self.shared.emit(SessionEvent::Completed {
                    share_url: share_url.clone(),
                });
                info!(
                    share_url = %share_url,
                    ?duration,
                    total_bytes,
                    parts_uploaded,
                    "capture session completed"
                );
                Ok(RecordingResult {
                    share_url,
                    duration,
                    total_bytes,
                    parts_uploaded,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                self.fail(&reason);
                Err(e.into())
            }
        }
    }

    /// Cancel the session, aborting the upload and returning to idle
    /// without emitting a result. Idempotent, and never fails.
    pub async fn cancel(&mut self) {
        if self.phase() == RecorderPhase::Idle {
            return;
        }
        info!("cancelling capture session");
        self.teardown(true).await;
        self.shared.set_phase(RecorderPhase::Idle);
        self.attempt_id = None;
    }

    /// Tear down the current session and start a fresh one with the same
    /// capture request
    pub async fn restart(&mut self) -> RecorderResult<()> {
        let request = self
            .last_request
            .clone()
            .ok_or_else(|| RecorderError::InvalidState {
                message: "no previous capture request to restart".to_string(),
            })?;
        info!("restarting capture session");
        self.cancel().await;
        self.start(request).await
    }

    /// Return the session to idle, aborting any active upload
    pub async fn reset(&mut self) {
        self.cancel().await;
    }

    fn fail(&mut self, reason: &str) {
        self.shared.set_phase(RecorderPhase::Error {
            reason: reason.to_string(),
        });
        self.shared.emit(SessionEvent::Failed {
            reason: reason.to_string(),
        });
    }

    fn clear_bookkeeping(&mut self) {
        self.shared.fragments.lock().clear();
        *self.shared.stop_ack.lock() = None;
        self.started_at = None;
        self.started_wall = None;
        self.paused_accumulated = Duration::ZERO;
        self.pause_started = None;
        self.has_audio_track = false;
    }

    /// Unconditional cleanup used by every exit path: the pump stops, the
    /// source is released, and buffered state is dropped.
    async fn teardown(&mut self, abort_upload: bool) {
        if let Some(pump) = self.pump_task.take() {
            pump.abort();
        }
        if let Some(coordinator) = self.coordinator.take() {
            if abort_upload {
                coordinator.cancel().await;
            }
        }
        {
            let mut source = self.source.lock().await;
            let _ = source.stop().await;
            source.release();
        }
        self.clear_bookkeeping();
    }
}

async fn run_pump(
    shared: Arc<SessionShared>,
    source: Arc<tokio::sync::Mutex<Box<dyn CaptureSource>>>,
    coordinator: Arc<UploadCoordinator>,
    mut events: mpsc::UnboundedReceiver<SourceEvent>,
    fragment_interval: Duration,
    pause_behavior: PauseBehavior,
) {
    let mut interval = tokio::time::interval(fragment_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let phase = shared.phase.read().clone();
                let suspended = phase == RecorderPhase::Paused
                    && pause_behavior == PauseBehavior::SuspendFragments;
                if suspended
                    || !matches!(phase, RecorderPhase::Recording | RecorderPhase::Paused)
                {
                    continue;
                }
                let mut source = source.lock().await;
                if let Err(e) = source.request_fragment().await {
                    debug!(error = %e, "fragment request failed");
                }
            }
            event = events.recv() => match event {
                Some(SourceEvent::Fragment(fragment)) => {
                    shared.fragments.lock().push(fragment.data.clone());
                    shared.emit(SessionEvent::FragmentCaptured {
                        sequence: fragment.sequence,
                        size_bytes: fragment.data.len() as u64,
                    });
                    coordinator.push_fragment(fragment.data);
                    shared.emit(SessionEvent::UploadProgressed {
                        bytes_uploaded: coordinator.progress().bytes_uploaded,
                    });
                }
                Some(SourceEvent::Stopped { .. }) => {
                    if let Some(ack) = shared.stop_ack.lock().take() {
                        let _ = ack.send(());
                    }
                }
                Some(SourceEvent::Error { message }) => {
                    warn!(message = %message, "capture source reported an error");
                }
                None => break,
            }
        }
    }
    debug!("session pump stopped");
}
