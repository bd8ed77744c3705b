//! Remote storage endpoint contract and clients
//!
//! The storage endpoint exposes four control operations (create, presign,
//! complete, abort) behind a single action-dispatched request shape, plus a
//! direct byte transfer against a presigned write URL. This module defines
//! the trait seam, the HTTP implementation, and an in-memory implementation
//! used for testing and local development.

use crate::error::{UploadError, UploadResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, ETAG};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifiers returned by the storage endpoint when an upload session is
/// created. Required for every subsequent call against the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSession {
    /// Remote session identifier
    pub session_id: String,
    /// Multipart upload identifier
    pub upload_id: String,
    /// Owner identifier
    pub owner_id: String,
    /// Durable share URL for the finished object
    pub share_url: String,
}

/// Single-use write URL for one part number
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedPart {
    /// URL the part bytes are written to
    pub presigned_url: String,
}

/// Acknowledgement recorded for a successfully stored part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartAck {
    /// Part number the acknowledgement belongs to
    pub part_number: u32,
    /// Opaque tag returned by the storage endpoint
    pub tag: String,
}

/// Remote storage endpoint operations.
///
/// The byte transfer reports cumulative progress through `progress` and
/// observes the `abort` signal cooperatively: implementations stop the
/// transfer as soon as the signal flips to `true`.
#[async_trait]
pub trait StorageEndpoint: Send + Sync {
    /// Create a new upload session
    async fn create(&self) -> UploadResult<StorageSession>;

    /// Issue a single-use write URL for the given part number
    async fn presign(
        &self,
        session: &StorageSession,
        part_number: u32,
    ) -> UploadResult<PresignedPart>;

    /// Transfer raw part bytes to a presigned URL, returning the
    /// acknowledgement tag for the part
    async fn put_part(
        &self,
        presigned_url: &str,
        part_number: u32,
        data: Bytes,
        content_type: &str,
        progress: mpsc::UnboundedSender<u64>,
        abort: watch::Receiver<bool>,
    ) -> UploadResult<String>;

    /// Complete the session from an ascending, contiguous list of part
    /// acknowledgements, returning the durable share URL
    async fn complete(
        &self,
        session: &StorageSession,
        parts: &[PartAck],
        thumbnail: Option<&str>,
    ) -> UploadResult<String>;

    /// Abort the session, releasing remote resources. Best effort.
    async fn abort(&self, session: &StorageSession) -> UploadResult<()>;
}

/// Action-dispatched control request sent to the endpoint base URL
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "lowercase", rename_all_fields = "camelCase")]
enum EndpointRequest<'a> {
    Create,
    Presign {
        session_id: &'a str,
        upload_id: &'a str,
        owner_id: &'a str,
        part_number: u32,
    },
    Complete {
        session_id: &'a str,
        upload_id: &'a str,
        owner_id: &'a str,
        parts: &'a [PartAck],
        #[serde(skip_serializing_if = "Option::is_none")]
        thumbnail: Option<&'a str>,
    },
    Abort {
        session_id: &'a str,
        upload_id: &'a str,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteResponse {
    share_url: Option<String>,
}

/// HTTP storage endpoint client
///
/// Control operations are POSTed to the configured base URL as JSON; the
/// part transfer is a direct PUT against the presigned URL. The transfer
/// response's `ETag` header is taken as the part's acknowledgement tag,
/// with a synthetic `part-<n>` fallback when the header is absent.
#[derive(Debug, Clone)]
pub struct HttpStorageEndpoint {
    client: reqwest::Client,
    base_url: String,
}

/// Transfer chunk granularity for progress reporting
const TRANSFER_CHUNK_BYTES: usize = 64 * 1024;

impl HttpStorageEndpoint {
    /// Create a new client for the given endpoint base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Create a client reusing an existing reqwest client
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn dispatch<T: serde::de::DeserializeOwned>(
        &self,
        request: &EndpointRequest<'_>,
    ) -> Result<T, reqwest::Error> {
        let response = self
            .client
            .post(&self.base_url)
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        response.json::<T>().await
    }
}

#[async_trait]
impl StorageEndpoint for HttpStorageEndpoint {
    async fn create(&self) -> UploadResult<StorageSession> {
        self.dispatch::<StorageSession>(&EndpointRequest::Create)
            .await
            .map_err(|e| UploadError::SessionCreation {
                reason: e.to_string(),
            })
    }

    async fn presign(
        &self,
        session: &StorageSession,
        part_number: u32,
    ) -> UploadResult<PresignedPart> {
        self.dispatch::<PresignedPart>(&EndpointRequest::Presign {
            session_id: &session.session_id,
            upload_id: &session.upload_id,
            owner_id: &session.owner_id,
            part_number,
        })
        .await
        .map_err(|e| UploadError::Presign {
            part_number,
            reason: e.to_string(),
        })
    }

    async fn put_part(
        &self,
        presigned_url: &str,
        part_number: u32,
        data: Bytes,
        content_type: &str,
        progress: mpsc::UnboundedSender<u64>,
        mut abort: watch::Receiver<bool>,
    ) -> UploadResult<String> {
        if *abort.borrow() {
            return Err(UploadError::Cancelled);
        }

        // Chunk the payload so progress is observable mid-transfer
        let mut chunks = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + TRANSFER_CHUNK_BYTES).min(data.len());
            chunks.push(data.slice(offset..end));
            offset = end;
        }

        let mut sent = 0u64;
        let body_stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len() as u64;
            let _ = progress.send(sent);
            Ok::<Bytes, std::io::Error>(chunk)
        }));

        let request = self
            .client
            .put(presigned_url)
            .header(CONTENT_TYPE, content_type)
            .body(reqwest::Body::wrap_stream(body_stream))
            .send();

        let response = tokio::select! {
            result = request => result.and_then(|r| r.error_for_status()).map_err(|e| {
                UploadError::Transfer {
                    part_number,
                    reason: e.to_string(),
                }
            })?,
            _ = abort.wait_for(|aborted| *aborted) => {
                debug!(part_number, "part transfer aborted");
                return Err(UploadError::Cancelled);
            }
        };

        let tag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_matches('"').to_string())
            .filter(|value| !value.is_empty());

        match tag {
            Some(tag) => Ok(tag),
            None => {
                warn!(
                    part_number,
                    "transfer response carried no ETag; falling back to synthetic tag"
                );
                Ok(format!("part-{}", part_number))
            }
        }
    }

    async fn complete(
        &self,
        session: &StorageSession,
        parts: &[PartAck],
        thumbnail: Option<&str>,
    ) -> UploadResult<String> {
        validate_part_list(parts)?;

        let response = self
            .dispatch::<CompleteResponse>(&EndpointRequest::Complete {
                session_id: &session.session_id,
                upload_id: &session.upload_id,
                owner_id: &session.owner_id,
                parts,
                thumbnail,
            })
            .await
            .map_err(|e| UploadError::Finalize {
                reason: e.to_string(),
            })?;

        Ok(response
            .share_url
            .unwrap_or_else(|| session.share_url.clone()))
    }

    async fn abort(&self, session: &StorageSession) -> UploadResult<()> {
        self.client
            .post(&self.base_url)
            .json(&EndpointRequest::Abort {
                session_id: &session.session_id,
                upload_id: &session.upload_id,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Check that a part list is sorted ascending starting at 1 with no gaps
/// and no duplicates
pub fn validate_part_list(parts: &[PartAck]) -> UploadResult<()> {
    for (index, part) in parts.iter().enumerate() {
        let expected = index as u32 + 1;
        if part.part_number != expected {
            return Err(UploadError::InvalidPartList {
                reason: format!(
                    "expected part {} at position {}, got part {}",
                    expected, index, part.part_number
                ),
            });
        }
    }
    Ok(())
}

/// In-memory storage endpoint for testing and local development
///
/// Supports programmable per-part transfer failures and a missing-tag mode
/// so the synthetic tag fallback path can be exercised. Records every call
/// so tests can assert exact call counts.
#[derive(Debug, Default)]
pub struct MemoryStorageEndpoint {
    state: Mutex<MemoryEndpointState>,
}

#[derive(Debug, Default)]
struct MemoryEndpointState {
    create_calls: u32,
    complete_calls: u32,
    abort_calls: u32,
    put_attempts: HashMap<u32, u32>,
    remaining_failures: HashMap<u32, u32>,
    omit_tags: bool,
    parts: Vec<(u32, Bytes)>,
    completed_parts: Option<Vec<PartAck>>,
    completed_thumbnail: Option<Option<String>>,
}

impl MemoryStorageEndpoint {
    /// Create a new empty endpoint
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` transfers of `part_number` fail
    pub fn fail_part(&self, part_number: u32, times: u32) {
        self.state
            .lock()
            .remaining_failures
            .insert(part_number, times);
    }

    /// Omit acknowledgement tags from transfer responses
    pub fn omit_tags(&self, omit: bool) {
        self.state.lock().omit_tags = omit;
    }

    /// Number of times `create` was called
    pub fn create_calls(&self) -> u32 {
        self.state.lock().create_calls
    }

    /// Number of times `complete` was called
    pub fn complete_calls(&self) -> u32 {
        self.state.lock().complete_calls
    }

    /// Number of times `abort` was called
    pub fn abort_calls(&self) -> u32 {
        self.state.lock().abort_calls
    }

    /// Number of transfer attempts observed for the given part
    pub fn put_attempts(&self, part_number: u32) -> u32 {
        self.state
            .lock()
            .put_attempts
            .get(&part_number)
            .copied()
            .unwrap_or(0)
    }

    /// Part list the session was completed with, if completed
    pub fn completed_parts(&self) -> Option<Vec<PartAck>> {
        self.state.lock().completed_parts.clone()
    }

    /// Thumbnail the session was completed with, if completed
    pub fn completed_thumbnail(&self) -> Option<Option<String>> {
        self.state.lock().completed_thumbnail.clone()
    }

    /// All stored bytes concatenated in part-number order
    pub fn stored_bytes(&self) -> Vec<u8> {
        let state = self.state.lock();
        let mut parts = state.parts.clone();
        parts.sort_by_key(|(part_number, _)| *part_number);
        let mut out = Vec::new();
        for (_, data) in parts {
            out.extend_from_slice(&data);
        }
        out
    }
}

#[async_trait]
impl StorageEndpoint for MemoryStorageEndpoint {
    async fn create(&self) -> UploadResult<StorageSession> {
        let mut state = self.state.lock();
        state.create_calls += 1;
        let session_id = Uuid::new_v4().to_string();
        Ok(StorageSession {
            share_url: format!("https://share.test/{}", session_id),
            session_id,
            upload_id: Uuid::new_v4().to_string(),
            owner_id: "owner-test".to_string(),
        })
    }

    async fn presign(
        &self,
        session: &StorageSession,
        part_number: u32,
    ) -> UploadResult<PresignedPart> {
        Ok(PresignedPart {
            presigned_url: format!(
                "https://store.test/{}/{}",
                session.upload_id, part_number
            ),
        })
    }

    async fn put_part(
        &self,
        _presigned_url: &str,
        part_number: u32,
        data: Bytes,
        _content_type: &str,
        progress: mpsc::UnboundedSender<u64>,
        abort: watch::Receiver<bool>,
    ) -> UploadResult<String> {
        if *abort.borrow() {
            return Err(UploadError::Cancelled);
        }

        let mut state = self.state.lock();
        *state.put_attempts.entry(part_number).or_insert(0) += 1;

        if let Some(remaining) = state.remaining_failures.get_mut(&part_number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(UploadError::Transfer {
                    part_number,
                    reason: "injected failure".to_string(),
                });
            }
        }

        let _ = progress.send(data.len() as u64);
        state.parts.retain(|(existing, _)| *existing != part_number);
        state.parts.push((part_number, data));

        if state.omit_tags {
            Ok(format!("part-{}", part_number))
        } else {
            Ok(format!("etag-{}", part_number))
        }
    }

    async fn complete(
        &self,
        _session: &StorageSession,
        parts: &[PartAck],
        thumbnail: Option<&str>,
    ) -> UploadResult<String> {
        validate_part_list(parts)?;

        let mut state = self.state.lock();
        state.complete_calls += 1;

        let stored: Vec<u32> = state.parts.iter().map(|(number, _)| *number).collect();
        for part in parts {
            if !stored.contains(&part.part_number) {
                return Err(UploadError::Finalize {
                    reason: format!("part {} was never stored", part.part_number),
                });
            }
        }

        state.completed_parts = Some(parts.to_vec());
        state.completed_thumbnail = Some(thumbnail.map(|t| t.to_string()));
        Ok("https://share.test/completed".to_string())
    }

    async fn abort(&self, _session: &StorageSession) -> UploadResult<()> {
        let mut state = self.state.lock();
        state.abort_calls += 1;
        state.parts.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_request_wire_shape() {
        let request = EndpointRequest::Presign {
            session_id: "s1",
            upload_id: "u1",
            owner_id: "o1",
            part_number: 4,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["action"], "presign");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["uploadId"], "u1");
        assert_eq!(json["ownerId"], "o1");
        assert_eq!(json["partNumber"], 4);

        let create = serde_json::to_value(&EndpointRequest::Create).unwrap();
        assert_eq!(create["action"], "create");
    }

    #[test]
    fn test_complete_omits_missing_thumbnail() {
        let parts = vec![PartAck {
            part_number: 1,
            tag: "etag-1".to_string(),
        }];
        let request = EndpointRequest::Complete {
            session_id: "s1",
            upload_id: "u1",
            owner_id: "o1",
            parts: &parts,
            thumbnail: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["action"], "complete");
        assert!(json.get("thumbnail").is_none());
        assert_eq!(json["parts"][0]["partNumber"], 1);
        assert_eq!(json["parts"][0]["tag"], "etag-1");
    }

    #[test]
    fn test_part_list_validation() {
        let ack = |part_number: u32| PartAck {
            part_number,
            tag: format!("etag-{}", part_number),
        };

        assert!(validate_part_list(&[]).is_ok());
        assert!(validate_part_list(&[ack(1), ack(2), ack(3)]).is_ok());
        assert!(validate_part_list(&[ack(2)]).is_err());
        assert!(validate_part_list(&[ack(1), ack(3)]).is_err());
        assert!(validate_part_list(&[ack(1), ack(1)]).is_err());
        assert!(validate_part_list(&[ack(2), ack(1)]).is_err());
    }

    #[tokio::test]
    async fn test_memory_endpoint_records_calls() {
        let endpoint = MemoryStorageEndpoint::new();
        let session = endpoint.create().await.unwrap();
        assert_eq!(endpoint.create_calls(), 1);

        let (progress, _rx) = mpsc::unbounded_channel();
        let (_abort_tx, abort_rx) = watch::channel(false);
        let tag = endpoint
            .put_part(
                "url",
                1,
                Bytes::from_static(b"hello"),
                "video/webm",
                progress,
                abort_rx,
            )
            .await
            .unwrap();
        assert_eq!(tag, "etag-1");
        assert_eq!(endpoint.put_attempts(1), 1);

        endpoint.abort(&session).await.unwrap();
        assert_eq!(endpoint.abort_calls(), 1);
    }
}
