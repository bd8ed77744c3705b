//! Session configuration

use crate::session::{RecorderError, RecorderResult};
use castvault_core::{UploadCoordinatorConfig, DEFAULT_MIN_PART_SIZE};
use std::time::Duration;

/// What pausing a recording does beyond freezing elapsed-time accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseBehavior {
    /// Invoke the capture source's pause primitive and stop requesting
    /// fragments while paused
    SuspendFragments,
    /// Freeze the elapsed timer only; fragments keep flowing
    TimerOnly,
}

/// Capture session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Content type sent with each part transfer
    pub content_type: String,
    /// Minimum coalesced part size; the final part may be smaller
    pub min_part_size: usize,
    /// How often the session requests a fragment from the capture source
    pub fragment_interval: Duration,
    /// Grace period between requesting the final fragment and signalling
    /// the capture source to stop
    pub final_fragment_grace: Duration,
    /// How long to wait for the capture source's stop acknowledgement
    /// before synthesizing completion from buffered fragments
    pub stop_ack_timeout: Duration,
    /// Maximum transfer attempts per part
    pub max_upload_attempts: u32,
    /// Base delay between part retry attempts
    pub retry_base_delay: Duration,
    /// Pause semantics
    pub pause_behavior: PauseBehavior,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            content_type: "video/webm".to_string(),
            min_part_size: DEFAULT_MIN_PART_SIZE,
            fragment_interval: Duration::from_secs(1),
            final_fragment_grace: Duration::from_millis(250),
            stop_ack_timeout: Duration::from_secs(10),
            max_upload_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            pause_behavior: PauseBehavior::SuspendFragments,
        }
    }
}

impl SessionConfig {
    /// Validate configuration
    pub fn validate(&self) -> RecorderResult<()> {
        if self.fragment_interval.is_zero() {
            return Err(RecorderError::InvalidConfiguration {
                message: "Fragment interval must be > 0".to_string(),
            });
        }

        if self.stop_ack_timeout.is_zero() {
            return Err(RecorderError::InvalidConfiguration {
                message: "Stop acknowledgement timeout must be > 0".to_string(),
            });
        }

        self.upload_config().validate()?;
        Ok(())
    }

    /// Derive the upload coordinator configuration
    pub fn upload_config(&self) -> UploadCoordinatorConfig {
        UploadCoordinatorConfig {
            min_part_size: self.min_part_size,
            max_attempts: self.max_upload_attempts,
            retry_base_delay: self.retry_base_delay,
            content_type: self.content_type.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_intervals_rejected() {
        let config = SessionConfig {
            fragment_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            stop_ack_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            max_upload_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
