//! Capture source abstraction
//!
//! A capture source is the live audio/video producer (screen, window, tab,
//! or camera) external to the upload pipeline. Sources deliver fragments
//! over an event channel handed in at start; the session drives the
//! fragment cadence by calling `request_fragment` on a timer, so a source
//! only emits when asked (plus one final fragment on stop).

use crate::error::{CaptureError, CaptureResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

/// What to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureMode {
    /// Entire screen
    Screen,
    /// Single application window
    Window,
    /// Single browser tab
    Tab,
    /// Camera device
    Camera,
}

/// Optional device selectors for a capture request
#[derive(Debug, Clone, Default)]
pub struct DeviceSelectors {
    /// Preferred video input device
    pub video_device: Option<String>,
    /// Preferred audio input device
    pub audio_device: Option<String>,
}

/// One capture request
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    /// Capture mode
    pub mode: CaptureMode,
    /// Device selectors
    pub selectors: DeviceSelectors,
}

impl CaptureRequest {
    /// Capture request for the given mode with default selectors
    pub fn new(mode: CaptureMode) -> Self {
        Self {
            mode,
            selectors: DeviceSelectors::default(),
        }
    }
}

/// Information about an acquired capture source
#[derive(Debug, Clone)]
pub struct SourceInfo {
    /// Human-readable description of the source
    pub description: String,
    /// Whether the source carries an audio track
    pub has_audio: bool,
}

/// One emitted piece of captured media
#[derive(Debug, Clone)]
pub struct MediaFragment {
    /// Fragment sequence number, starting at 0
    pub sequence: u64,
    /// Raw fragment bytes
    pub data: Bytes,
    /// When the fragment was captured
    pub captured_at: Instant,
}

/// Events emitted by a capture source
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// A media fragment was captured
    Fragment(MediaFragment),
    /// The source acknowledged a stop request
    Stopped {
        /// Whether a final fragment was emitted before the acknowledgement
        final_fragment_sent: bool,
    },
    /// The source hit an error
    Error {
        /// Error description
        message: String,
    },
}

/// Live media producer behind the capture session.
///
/// `stop` triggers the `Stopped` acknowledgement on the event channel;
/// `release` closes device handles and must only be called once the final
/// media bytes are in hand, closing earlier would truncate mid-flight reads.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Acquire the source and begin accepting fragment requests
    async fn start(
        &mut self,
        request: &CaptureRequest,
        events: mpsc::UnboundedSender<SourceEvent>,
    ) -> CaptureResult<SourceInfo>;

    /// Ask the source to emit whatever it has buffered as one fragment
    async fn request_fragment(&mut self) -> CaptureResult<()>;

    /// Pause fragment emission
    async fn pause(&mut self) -> CaptureResult<()>;

    /// Resume fragment emission
    async fn resume(&mut self) -> CaptureResult<()>;

    /// Request stop; the source acknowledges via `SourceEvent::Stopped`
    async fn stop(&mut self) -> CaptureResult<()>;

    /// Close device/display handles
    fn release(&mut self);
}

/// Configuration for the synthetic capture source
#[derive(Debug, Clone)]
pub struct SyntheticSourceConfig {
    /// Bytes emitted per requested fragment
    pub fragment_size: usize,
    /// Whether the synthetic source reports an audio track
    pub has_audio: bool,
    /// Never emit the stop acknowledgement (exercises timeout synthesis)
    pub suppress_stop_ack: bool,
    /// Fail acquisition with a permission error
    pub deny_permission: bool,
}

impl Default for SyntheticSourceConfig {
    fn default() -> Self {
        Self {
            fragment_size: 2 * 1024,
            has_audio: true,
            suppress_stop_ack: false,
            deny_permission: false,
        }
    }
}

#[derive(Debug, Default)]
struct SyntheticState {
    capturing: bool,
    paused: bool,
    sequence: u64,
    events: Option<mpsc::UnboundedSender<SourceEvent>>,
}

/// Deterministic capture source for testing and local development
///
/// Emits a fixed-size fragment per request; pausing suppresses emission
/// while leaving requests harmless.
#[derive(Debug, Default)]
pub struct SyntheticCaptureSource {
    config: SyntheticSourceConfig,
    state: Mutex<SyntheticState>,
}

impl SyntheticCaptureSource {
    /// Create a synthetic source with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a synthetic source with the given configuration
    pub fn with_config(config: SyntheticSourceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SyntheticState::default()),
        }
    }

    fn emit_fragment(&self, state: &mut SyntheticState) -> bool {
        let Some(events) = state.events.as_ref() else {
            return false;
        };
        let fill = (state.sequence % 251) as u8;
        let fragment = MediaFragment {
            sequence: state.sequence,
            data: Bytes::from(vec![fill; self.config.fragment_size]),
            captured_at: Instant::now(),
        };
        state.sequence += 1;
        events.send(SourceEvent::Fragment(fragment)).is_ok()
    }
}

#[async_trait]
impl CaptureSource for SyntheticCaptureSource {
    async fn start(
        &mut self,
        request: &CaptureRequest,
        events: mpsc::UnboundedSender<SourceEvent>,
    ) -> CaptureResult<SourceInfo> {
        if self.config.deny_permission {
            return Err(CaptureError::PermissionDenied {
                operation: format!("{:?} capture", request.mode),
            });
        }

        let mut state = self.state.lock();
        state.capturing = true;
        state.paused = false;
        state.sequence = 0;
        state.events = Some(events);

        Ok(SourceInfo {
            description: format!("synthetic {:?} source", request.mode),
            has_audio: self.config.has_audio,
        })
    }

    async fn request_fragment(&mut self) -> CaptureResult<()> {
        let mut state = self.state.lock();
        if !state.capturing {
            return Err(CaptureError::NotCapturing);
        }
        if state.paused {
            return Ok(());
        }
        self.emit_fragment(&mut state);
        Ok(())
    }

    async fn pause(&mut self) -> CaptureResult<()> {
        let mut state = self.state.lock();
        if !state.capturing {
            return Err(CaptureError::NotCapturing);
        }
        state.paused = true;
        Ok(())
    }

    async fn resume(&mut self) -> CaptureResult<()> {
        let mut state = self.state.lock();
        if !state.capturing {
            return Err(CaptureError::NotCapturing);
        }
        state.paused = false;
        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<()> {
        let mut state = self.state.lock();
        if !state.capturing {
            return Err(CaptureError::NotCapturing);
        }
        state.capturing = false;

        if self.config.suppress_stop_ack {
            debug!("synthetic source suppressing stop acknowledgement");
            return Ok(());
        }

        let final_fragment_sent = self.emit_fragment(&mut state);
        if let Some(events) = state.events.as_ref() {
            let _ = events.send(SourceEvent::Stopped {
                final_fragment_sent,
            });
        }
        Ok(())
    }

    fn release(&mut self) {
        let mut state = self.state.lock();
        state.capturing = false;
        state.events = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_request() -> CaptureRequest {
        CaptureRequest::new(CaptureMode::Screen)
    }

    #[tokio::test]
    async fn test_fragments_emitted_on_request() {
        let mut source = SyntheticCaptureSource::with_config(SyntheticSourceConfig {
            fragment_size: 128,
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        source.start(&start_request(), tx).await.unwrap();

        source.request_fragment().await.unwrap();
        source.request_fragment().await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (first, second) {
            (SourceEvent::Fragment(a), SourceEvent::Fragment(b)) => {
                assert_eq!(a.sequence, 0);
                assert_eq!(b.sequence, 1);
                assert_eq!(a.data.len(), 128);
            }
            other => panic!("expected fragments, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pause_suppresses_emission() {
        let mut source = SyntheticCaptureSource::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        source.start(&start_request(), tx).await.unwrap();

        source.pause().await.unwrap();
        source.request_fragment().await.unwrap();
        assert!(rx.try_recv().is_err());

        source.resume().await.unwrap();
        source.request_fragment().await.unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            SourceEvent::Fragment(_)
        ));
    }

    #[tokio::test]
    async fn test_stop_emits_final_fragment_and_ack() {
        let mut source = SyntheticCaptureSource::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        source.start(&start_request(), tx).await.unwrap();
        source.stop().await.unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            SourceEvent::Fragment(_)
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            SourceEvent::Stopped {
                final_fragment_sent: true
            }
        ));
    }

    #[tokio::test]
    async fn test_suppressed_stop_ack() {
        let mut source = SyntheticCaptureSource::with_config(SyntheticSourceConfig {
            suppress_stop_ack: true,
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        source.start(&start_request(), tx).await.unwrap();
        source.stop().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let mut source = SyntheticCaptureSource::with_config(SyntheticSourceConfig {
            deny_permission: true,
            ..Default::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = source.start(&start_request(), tx).await;
        assert!(matches!(
            result,
            Err(CaptureError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_request_fragment_requires_capture() {
        let mut source = SyntheticCaptureSource::new();
        assert!(matches!(
            source.request_fragment().await,
            Err(CaptureError::NotCapturing)
        ));
    }
}
