//! # Castvault Media
//!
//! Capture source abstraction and thumbnail generation for Castvault.
//! This crate defines the seam between the upload pipeline and the live
//! media producers (screen, window, tab, or camera) that feed it.

#![warn(clippy::all)]

pub mod error;
pub mod source;
pub mod thumbnail;

// Re-export main types
pub use error::{CaptureError, CaptureResult};
pub use source::{
    CaptureMode, CaptureRequest, CaptureSource, DeviceSelectors, MediaFragment, SourceEvent,
    SourceInfo, SyntheticCaptureSource, SyntheticSourceConfig,
};
pub use thumbnail::{NullThumbnailGenerator, StaticThumbnailGenerator, ThumbnailGenerator};
