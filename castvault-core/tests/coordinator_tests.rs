//! Integration tests for the upload coordinator
//!
//! These tests drive the coordinator against the in-memory storage endpoint
//! and cover byte conservation, part ordering, retry behavior, and the
//! idempotence guarantees of finalize and cancel.

use bytes::Bytes;
use castvault_core::{
    MemoryStorageEndpoint, PartStatus, UploadCoordinator, UploadCoordinatorConfig, UploadError,
};
use std::sync::Arc;
use std::time::Duration;

const KIB: usize = 1024;

fn test_config() -> UploadCoordinatorConfig {
    UploadCoordinatorConfig {
        min_part_size: 5 * KIB,
        max_attempts: 3,
        retry_base_delay: Duration::from_millis(5),
        content_type: "video/webm".to_string(),
    }
}

async fn coordinator_with(
    endpoint: &Arc<MemoryStorageEndpoint>,
    config: UploadCoordinatorConfig,
) -> UploadCoordinator {
    let endpoint: Arc<dyn castvault_core::StorageEndpoint> = endpoint.clone();
    UploadCoordinator::create(endpoint, config)
        .await
        .expect("coordinator creation should succeed")
}

fn fragment(size: usize, fill: u8) -> Bytes {
    Bytes::from(vec![fill; size])
}

/// Concatenation of a fragment sequence, used as the whole-blob argument
/// finalize receives from the capture side
fn whole_blob(fragments: &[Bytes]) -> Bytes {
    let mut blob = Vec::new();
    for fragment in fragments {
        blob.extend_from_slice(fragment);
    }
    Bytes::from(blob)
}

#[tokio::test]
async fn test_threshold_crossing_queues_one_coalesced_part() {
    let endpoint = Arc::new(MemoryStorageEndpoint::new());
    let coordinator = coordinator_with(&endpoint, test_config()).await;

    // 2 KiB + 2 KiB stays buffered; the third fragment crosses 5 KiB
    coordinator.push_fragment(fragment(2 * KIB, 1));
    coordinator.push_fragment(fragment(2 * KIB, 2));
    let progress = coordinator.progress();
    assert!(progress.parts.is_empty());
    assert_eq!(progress.bytes_buffered, 4 * KIB as u64);

    coordinator.push_fragment(fragment(2 * KIB, 3));
    let progress = coordinator.progress();
    assert_eq!(progress.parts.len(), 1);
    assert_eq!(progress.parts[0].part_number, 1);
    assert_eq!(progress.parts[0].size_bytes, 6 * KIB as u64);
    assert_eq!(progress.bytes_buffered, 0);

    // Buffer already empty, so finalize flushes no additional parts
    let fragments = [fragment(2 * KIB, 1), fragment(2 * KIB, 2), fragment(2 * KIB, 3)];
    coordinator
        .finalize(whole_blob(&fragments), None)
        .await
        .expect("finalize should succeed");

    let completed = endpoint.completed_parts().expect("session completed");
    assert_eq!(completed.len(), 1);
    assert_eq!(endpoint.stored_bytes().len(), 6 * KIB);
}

#[tokio::test]
async fn test_byte_totals_conserved_across_parts() {
    let endpoint = Arc::new(MemoryStorageEndpoint::new());
    let coordinator = coordinator_with(&endpoint, test_config()).await;

    let sizes = [3 * KIB, 4 * KIB, KIB, 7 * KIB, 512, 2 * KIB];
    let fragments: Vec<Bytes> = sizes
        .iter()
        .enumerate()
        .map(|(index, size)| fragment(*size, index as u8))
        .collect();
    let total: usize = sizes.iter().sum();

    for fragment in &fragments {
        coordinator.push_fragment(fragment.clone());
    }
    coordinator
        .finalize(whole_blob(&fragments), None)
        .await
        .expect("finalize should succeed");

    let progress = coordinator.progress();
    let uploaded: u64 = progress.parts.iter().map(|part| part.uploaded_bytes).sum();
    assert_eq!(uploaded, total as u64);
    assert_eq!(progress.bytes_uploaded, total as u64);
    assert_eq!(endpoint.stored_bytes(), whole_blob(&fragments).to_vec());
}

#[tokio::test]
async fn test_part_numbers_contiguous_ascending() {
    let endpoint = Arc::new(MemoryStorageEndpoint::new());
    let coordinator = coordinator_with(&endpoint, test_config()).await;

    let fragments: Vec<Bytes> = (0..8).map(|index| fragment(3 * KIB, index)).collect();
    for fragment in &fragments {
        coordinator.push_fragment(fragment.clone());
    }
    coordinator
        .finalize(whole_blob(&fragments), None)
        .await
        .expect("finalize should succeed");

    let completed = endpoint.completed_parts().expect("session completed");
    for (index, ack) in completed.iter().enumerate() {
        assert_eq!(ack.part_number, index as u32 + 1);
    }
    assert!(completed.len() >= 2);
}

#[tokio::test]
async fn test_short_recording_uploads_whole_blob_as_part_one() {
    let endpoint = Arc::new(MemoryStorageEndpoint::new());
    let coordinator = coordinator_with(&endpoint, test_config()).await;

    // A single 1 KiB fragment never crosses the threshold
    let small = fragment(KIB, 7);
    coordinator.push_fragment(small.clone());
    assert!(coordinator.progress().parts.is_empty());

    coordinator
        .finalize(small.clone(), None)
        .await
        .expect("finalize should succeed");

    let completed = endpoint.completed_parts().expect("session completed");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].part_number, 1);
    assert_eq!(endpoint.stored_bytes(), small.to_vec());
}

#[tokio::test]
async fn test_finalize_is_idempotent() {
    let endpoint = Arc::new(MemoryStorageEndpoint::new());
    let coordinator = coordinator_with(&endpoint, test_config()).await;

    let blob = fragment(6 * KIB, 9);
    coordinator.push_fragment(blob.clone());

    let first = coordinator
        .finalize(blob.clone(), None)
        .await
        .expect("finalize should succeed");
    let second = coordinator
        .finalize(blob, None)
        .await
        .expect("second finalize should return cached result");

    assert_eq!(first, second);
    assert_eq!(endpoint.complete_calls(), 1);
    assert!(coordinator.is_finalized());
}

#[tokio::test]
async fn test_cancel_is_idempotent_and_aborts_once() {
    let endpoint = Arc::new(MemoryStorageEndpoint::new());
    let coordinator = coordinator_with(&endpoint, test_config()).await;

    coordinator.push_fragment(fragment(6 * KIB, 1));
    coordinator.cancel().await;
    coordinator.cancel().await;

    assert_eq!(endpoint.abort_calls(), 1);
    let progress = coordinator.progress();
    assert!(progress.parts.is_empty());
    assert_eq!(progress.bytes_buffered, 0);

    // A finalize after cancel reports the cancellation
    let result = coordinator.finalize(Bytes::new(), None).await;
    assert!(matches!(result, Err(UploadError::Cancelled)));
    assert_eq!(endpoint.complete_calls(), 0);
}

#[tokio::test]
async fn test_transient_failures_recovered_by_retry() {
    let endpoint = Arc::new(MemoryStorageEndpoint::new());
    endpoint.fail_part(1, 2);
    let coordinator = coordinator_with(&endpoint, test_config()).await;

    let blob = fragment(6 * KIB, 5);
    coordinator.push_fragment(blob.clone());
    coordinator
        .finalize(blob.clone(), None)
        .await
        .expect("finalize should succeed after retries");

    // Two injected failures plus the successful attempt
    assert_eq!(endpoint.put_attempts(1), 3);
    let progress = coordinator.progress();
    assert_eq!(progress.parts[0].status, PartStatus::Complete);
    assert_eq!(progress.parts[0].uploaded_bytes, 6 * KIB as u64);
    assert_eq!(endpoint.stored_bytes(), blob.to_vec());
}

#[tokio::test]
async fn test_exhausted_retries_surface_error_without_further_attempts() {
    let endpoint = Arc::new(MemoryStorageEndpoint::new());
    endpoint.fail_part(1, 5);
    let coordinator = coordinator_with(&endpoint, test_config()).await;

    let blob = fragment(6 * KIB, 5);
    coordinator.push_fragment(blob.clone());

    let result = coordinator.finalize(blob, None).await;
    match result {
        Err(UploadError::RetriesExhausted {
            part_number,
            attempts,
        }) => {
            assert_eq!(part_number, 1);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected RetriesExhausted, got {:?}", other.map(|_| ())),
    }

    // Exactly max_attempts transfers, no automatic retry afterwards
    assert_eq!(endpoint.put_attempts(1), 3);
    assert_eq!(endpoint.complete_calls(), 0);
    let progress = coordinator.progress();
    assert_eq!(progress.parts[0].status, PartStatus::Error);
}

#[tokio::test]
async fn test_later_part_failure_keeps_earlier_parts() {
    let endpoint = Arc::new(MemoryStorageEndpoint::new());
    endpoint.fail_part(2, 5);
    let coordinator = coordinator_with(&endpoint, test_config()).await;

    let first = fragment(6 * KIB, 1);
    let second = fragment(6 * KIB, 2);
    coordinator.push_fragment(first.clone());
    coordinator.push_fragment(second.clone());

    let result = coordinator.finalize(whole_blob(&[first, second]), None).await;
    assert!(matches!(
        result,
        Err(UploadError::RetriesExhausted { part_number: 2, .. })
    ));

    // The first part completed before the second failed
    let progress = coordinator.progress();
    assert_eq!(progress.parts[0].status, PartStatus::Complete);
    assert_eq!(progress.acknowledged_parts, 1);
}

#[tokio::test]
async fn test_missing_tag_falls_back_to_synthetic() {
    let endpoint = Arc::new(MemoryStorageEndpoint::new());
    endpoint.omit_tags(true);
    let coordinator = coordinator_with(&endpoint, test_config()).await;

    let blob = fragment(6 * KIB, 4);
    coordinator.push_fragment(blob.clone());
    coordinator
        .finalize(blob, None)
        .await
        .expect("finalize should succeed");

    let completed = endpoint.completed_parts().expect("session completed");
    assert_eq!(completed[0].tag, "part-1");
}

#[tokio::test]
async fn test_thumbnail_forwarded_to_complete() {
    let endpoint = Arc::new(MemoryStorageEndpoint::new());
    let coordinator = coordinator_with(&endpoint, test_config()).await;

    let blob = fragment(KIB, 3);
    coordinator.push_fragment(blob.clone());
    coordinator
        .finalize(blob, Some("data:image/png;base64,AAAA".to_string()))
        .await
        .expect("finalize should succeed");

    assert_eq!(
        endpoint.completed_thumbnail(),
        Some(Some("data:image/png;base64,AAAA".to_string()))
    );
}

#[tokio::test]
async fn test_empty_recording_finalizes_as_empty_part() {
    let endpoint = Arc::new(MemoryStorageEndpoint::new());
    let coordinator = coordinator_with(&endpoint, test_config()).await;

    coordinator
        .finalize(Bytes::new(), None)
        .await
        .expect("finalize should succeed");

    let completed = endpoint.completed_parts().expect("session completed");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].part_number, 1);
    assert!(endpoint.stored_bytes().is_empty());
}
