//! Session event stream
//!
//! The session broadcasts progress signals so the surrounding application
//! can render phase, capture, and upload feedback without polling.

use crate::session::RecorderPhase;

/// Events emitted by a capture session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session transitioned to a new phase
    PhaseChanged {
        /// New phase
        phase: RecorderPhase,
    },
    /// A capture fragment was received
    FragmentCaptured {
        /// Fragment sequence number
        sequence: u64,
        /// Fragment size in bytes
        size_bytes: u64,
    },
    /// Cumulative upload progress changed
    UploadProgressed {
        /// Total bytes transferred so far
        bytes_uploaded: u64,
    },
    /// Recording was persisted
    Completed {
        /// Durable share URL
        share_url: String,
    },
    /// The session failed
    Failed {
        /// User-facing reason
        reason: String,
    },
}
