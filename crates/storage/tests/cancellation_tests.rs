// Cancellation tests: an abandoned range write never publishes a part.

mod common;

use bytes::Bytes;
use common::seeded_bytes;
use depot_core::{ByteRange, UploadId};
use depot_storage::error::StorageResult;
use depot_storage::traits::{ArtifactStore, ByteStream, bytes_stream, collect_stream, staging_prefix};
use depot_storage::{FilesystemBackend, StorageError};
use futures::StreamExt;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::Duration;

/// A body that sends one chunk and then stalls, like a dropped connection.
fn stalled_body(first: Bytes) -> ByteStream {
    let head = futures::stream::once(async move { Ok::<_, StorageError>(first) });
    let tail = futures::stream::pending::<StorageResult<Bytes>>();
    Box::pin(head.chain(tail))
}

fn published_parts(root: &std::path::Path, upload: UploadId) -> usize {
    std::fs::read_dir(root.join(staging_prefix(upload)))
        .map(|dir| {
            dir.filter_map(Result::ok)
                .filter(|e| !e.file_name().to_string_lossy().contains(".tmp."))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn aborted_write_publishes_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FilesystemBackend::new(temp_dir.path()).await.unwrap());
    let upload = UploadId::new();

    let task = {
        let backend = backend.clone();
        tokio::spawn(async move {
            backend
                .write_range(upload, 0, stalled_body(seeded_bytes(1, 1024)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert_eq!(published_parts(temp_dir.path(), upload), 0);
}

#[tokio::test]
async fn retry_after_abort_completes_the_upload() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FilesystemBackend::new(temp_dir.path()).await.unwrap());
    let upload = UploadId::new();

    let task = {
        let backend = backend.clone();
        tokio::spawn(async move {
            backend
                .write_range(upload, 0, stalled_body(Bytes::from_static(b"half")))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    task.abort();
    let _ = task.await;

    backend
        .write_range(upload, 0, bytes_stream("complete"))
        .await
        .unwrap();
    backend
        .finalize(upload, 1, &[ByteRange::new(0, 8).unwrap()])
        .await
        .unwrap();
    let stored = collect_stream(backend.read(1).await.unwrap()).await.unwrap();
    assert_eq!(&stored[..], b"complete");
}

#[tokio::test]
async fn discard_removes_abandoned_staging() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(temp_dir.path()).await.unwrap();
    let upload = UploadId::new();

    backend.write_range(upload, 0, bytes_stream("abc")).await.unwrap();
    backend.write_range(upload, 3, bytes_stream("def")).await.unwrap();
    assert_eq!(published_parts(temp_dir.path(), upload), 2);

    backend.discard_upload(upload).await.unwrap();
    assert_eq!(published_parts(temp_dir.path(), upload), 0);
    assert!(!temp_dir.path().join(staging_prefix(upload)).exists());
}
