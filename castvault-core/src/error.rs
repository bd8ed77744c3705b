//! Upload pipeline error types and handling
//!
//! This module defines all error types used by the storage endpoint client
//! and the upload coordinator, providing clear error messages and context
//! for debugging and error handling.

use thiserror::Error;

/// Main error type for upload operations
#[derive(Error, Debug)]
pub enum UploadError {
    /// Remote session creation failed
    #[error("Session creation failed: {reason}")]
    SessionCreation {
        /// Failure reason
        reason: String,
    },

    /// Presigning a part write URL failed
    #[error("Presign failed for part {part_number}: {reason}")]
    Presign {
        /// Part number the presign request was for
        part_number: u32,
        /// Failure reason
        reason: String,
    },

    /// A single part byte transfer failed
    #[error("Transfer failed for part {part_number}: {reason}")]
    Transfer {
        /// Part number being transferred
        part_number: u32,
        /// Failure reason
        reason: String,
    },

    /// A part exhausted its retry budget
    #[error("Part {part_number} failed after {attempts} attempts")]
    RetriesExhausted {
        /// Part number that exhausted retries
        part_number: u32,
        /// Number of attempts made
        attempts: u32,
    },

    /// Remote session completion failed
    #[error("Finalize failed: {reason}")]
    Finalize {
        /// Failure reason
        reason: String,
    },

    /// Part list passed to complete was not contiguous ascending
    #[error("Invalid part list: {reason}")]
    InvalidPartList {
        /// Description of the violation
        reason: String,
    },

    /// Operation was cancelled via the abort signal
    #[error("Upload cancelled")]
    Cancelled,

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

    /// HTTP transport error
    #[error("HTTP error: {source}")]
    Http {
        /// Underlying reqwest error
        #[from]
        source: reqwest::Error,
    },

    /// Operation timed out
    #[error("Operation timed out after {duration:?}")]
    Timeout {
        /// Duration after which timeout occurred
        duration: std::time::Duration,
    },
}

/// Result type alias for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

impl UploadError {
    /// Check if error is recoverable by retrying the same operation
    pub fn is_recoverable(&self) -> bool {
        match self {
            UploadError::SessionCreation { .. } => true,
            UploadError::Presign { .. } => true,
            UploadError::Transfer { .. } => true,
            UploadError::Http { .. } => true,
            UploadError::Timeout { .. } => true,
            UploadError::RetriesExhausted { .. } => false,
            UploadError::Finalize { .. } => false,
            UploadError::InvalidPartList { .. } => false,
            UploadError::Cancelled => false,
            UploadError::InvalidState { .. } => false,
            UploadError::InvalidConfiguration { .. } => false,
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            UploadError::SessionCreation { .. } => ErrorCategory::Session,
            UploadError::Presign { .. } => ErrorCategory::Transfer,
            UploadError::Transfer { .. } => ErrorCategory::Transfer,
            UploadError::RetriesExhausted { .. } => ErrorCategory::Transfer,
            UploadError::Finalize { .. } => ErrorCategory::Finalization,
            UploadError::InvalidPartList { .. } => ErrorCategory::Finalization,
            UploadError::Cancelled => ErrorCategory::State,
            UploadError::InvalidState { .. } => ErrorCategory::State,
            UploadError::InvalidConfiguration { .. } => ErrorCategory::Configuration,
            UploadError::Http { .. } => ErrorCategory::Network,
            UploadError::Timeout { .. } => ErrorCategory::Network,
        }
    }
}

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Remote session lifecycle errors
    Session,
    /// Part transfer errors
    Transfer,
    /// Session finalization errors
    Finalization,
    /// Configuration and parameter errors
    Configuration,
    /// State management errors
    State,
    /// Network-related errors
    Network,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let transfer_error = UploadError::Transfer {
            part_number: 3,
            reason: "connection reset".to_string(),
        };
        assert_eq!(transfer_error.category(), ErrorCategory::Transfer);
        assert!(transfer_error.is_recoverable());

        let exhausted = UploadError::RetriesExhausted {
            part_number: 3,
            attempts: 3,
        };
        assert_eq!(exhausted.category(), ErrorCategory::Transfer);
        assert!(!exhausted.is_recoverable());

        let finalize_error = UploadError::Finalize {
            reason: "remote rejected part list".to_string(),
        };
        assert_eq!(finalize_error.category(), ErrorCategory::Finalization);
        assert!(!finalize_error.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = UploadError::RetriesExhausted {
            part_number: 2,
            attempts: 3,
        };
        assert_eq!(error.to_string(), "Part 2 failed after 3 attempts");
    }
}
