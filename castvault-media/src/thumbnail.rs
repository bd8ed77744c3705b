//! Thumbnail generation
//!
//! Invoked once at finalization with the complete captured media. Failures
//! are non-fatal at the call site; the recording is persisted either way.

use crate::error::CaptureResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Produces a single preview image for a finished recording
#[async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    /// Generate a thumbnail data URL from the complete captured media.
    /// Returns `Ok(None)` when thumbnailing is disabled.
    async fn generate(&self, media: &Bytes) -> CaptureResult<Option<String>>;
}

/// Thumbnail generator that produces nothing
#[derive(Debug, Default, Clone)]
pub struct NullThumbnailGenerator;

#[async_trait]
impl ThumbnailGenerator for NullThumbnailGenerator {
    async fn generate(&self, _media: &Bytes) -> CaptureResult<Option<String>> {
        Ok(None)
    }
}

/// Thumbnail generator that returns a fixed data URL, for tests and demos
#[derive(Debug, Clone)]
pub struct StaticThumbnailGenerator {
    data_url: String,
}

impl StaticThumbnailGenerator {
    /// Create a generator that always returns `data_url`
    pub fn new(data_url: impl Into<String>) -> Self {
        Self {
            data_url: data_url.into(),
        }
    }
}

#[async_trait]
impl ThumbnailGenerator for StaticThumbnailGenerator {
    async fn generate(&self, _media: &Bytes) -> CaptureResult<Option<String>> {
        Ok(Some(self.data_url.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_generator_produces_nothing() {
        let generator = NullThumbnailGenerator;
        let result = generator.generate(&Bytes::from_static(b"media")).await;
        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn test_static_generator() {
        let generator = StaticThumbnailGenerator::new("data:image/png;base64,AAAA");
        let result = generator.generate(&Bytes::new()).await.unwrap();
        assert_eq!(result.as_deref(), Some("data:image/png;base64,AAAA"));
    }
}
