//! Capture error types and handling

use thiserror::Error;

/// Main error type for capture operations
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Permission to the capture device or display was denied
    #[error("Permission denied: {operation}")]
    PermissionDenied {
        /// Operation that was denied
        operation: String,
    },

    /// No capture source is available for the requested mode
    #[error("Capture source unavailable: {reason}")]
    SourceUnavailable {
        /// Failure reason
        reason: String,
    },

    /// Capture not active error
    #[error("Capture not active")]
    NotCapturing,

    /// Invalid state for operation
    #[error("Invalid state: {message}")]
    InvalidState {
        /// State error message
        message: String,
    },

    /// The capture source never acknowledged a stop request
    #[error("Stop acknowledgement timed out after {duration:?}")]
    StopTimeout {
        /// Duration after which timeout occurred
        duration: std::time::Duration,
    },

    /// Fragment delivery failed
    #[error("Fragment error: {reason}")]
    Fragment {
        /// Failure reason
        reason: String,
    },

    /// Thumbnail generation failed
    #[error("Thumbnail generation failed: {reason}")]
    Thumbnail {
        /// Failure reason
        reason: String,
    },
}

/// Result type alias for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

impl CaptureError {
    /// Check if error is recoverable by starting a new capture attempt
    pub fn is_recoverable(&self) -> bool {
        match self {
            CaptureError::PermissionDenied { .. } => true,
            CaptureError::SourceUnavailable { .. } => true,
            CaptureError::StopTimeout { .. } => true,
            CaptureError::Fragment { .. } => true,
            CaptureError::Thumbnail { .. } => true,
            CaptureError::NotCapturing => false,
            CaptureError::InvalidState { .. } => false,
        }
    }
}
