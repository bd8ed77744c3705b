//! # Castvault - Capture-to-Storage Streaming Upload
//!
//! Castvault records a live media stream (screen, window, tab, or camera)
//! and durably persists it to remote object storage *while still
//! recording*: fragments are coalesced into multipart-upload parts and
//! streamed out as capture progresses, so stopping only requires a short
//! finalization step.
//!
//! ## Key Properties
//!
//! - **Streaming persistence**: parts upload during capture, not after
//! - **Serialized part queue**: at most one transfer in flight, strictly
//!   increasing part numbers
//! - **Automatic retries**: transient part failures retried with backoff
//! - **Resumable control surface**: pause/resume/cancel/restart at any time
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use castvault::{
//!     CaptureMode, CaptureRequest, CaptureSession, HttpStorageEndpoint,
//!     NullThumbnailGenerator, SessionConfig, SyntheticCaptureSource,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint = Arc::new(HttpStorageEndpoint::new(
//!         "https://api.example.com/recordings",
//!     ));
//!     let mut session = CaptureSession::new(
//!         SessionConfig::default(),
//!         endpoint,
//!         Box::new(SyntheticCaptureSource::new()),
//!         Arc::new(NullThumbnailGenerator),
//!     );
//!
//!     session.start(CaptureRequest::new(CaptureMode::Screen)).await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     let result = session.stop().await?;
//!     println!("recording available at {}", result.share_url);
//!
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use castvault_core::{
    ChunkBuffer, ChunkPart, ErrorCategory, HttpStorageEndpoint, MemoryStorageEndpoint, PartAck,
    PartStatus, PresignedPart, StorageEndpoint, StorageSession, UploadCoordinator,
    UploadCoordinatorConfig, UploadError, UploadProgress, UploadResult,
};

pub use castvault_media::{
    CaptureError, CaptureMode, CaptureRequest, CaptureResult, CaptureSource, DeviceSelectors,
    MediaFragment, NullThumbnailGenerator, SourceEvent, SourceInfo, StaticThumbnailGenerator,
    SyntheticCaptureSource, SyntheticSourceConfig, ThumbnailGenerator,
};

// Public API modules
pub mod config;
pub mod event;
pub mod session;

// Re-export main API types
pub use config::{PauseBehavior, SessionConfig};
pub use event::SessionEvent;
pub use session::{
    CaptureSession, RecorderError, RecorderPhase, RecorderResult, RecordingResult,
};
