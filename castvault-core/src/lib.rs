//! # Castvault Core
//!
//! Storage endpoint protocol and incremental multipart upload coordination
//! for the Castvault capture-to-storage pipeline. This crate provides the
//! remote storage contract, the chunk buffer, and the serialized upload
//! coordinator that delivers capture fragments to remote object storage
//! while recording is still in progress.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod endpoint;
pub mod error;

// Re-export main types
pub use coordinator::{
    ChunkBuffer, ChunkPart, PartStatus, UploadCoordinator, UploadCoordinatorConfig,
    UploadProgress, DEFAULT_MIN_PART_SIZE,
};
pub use endpoint::{
    HttpStorageEndpoint, MemoryStorageEndpoint, PartAck, PresignedPart, StorageEndpoint,
    StorageSession,
};
pub use error::{ErrorCategory, UploadError, UploadResult};
