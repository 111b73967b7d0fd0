// Assembly tests: staged ranges written in any order finalize to the same bytes.

mod common;

use common::{chunked_stream, seeded_bytes, sha256_hex};
use depot_core::{ByteRange, UploadId};
use depot_storage::traits::{ArtifactStore, collect_stream};
use depot_storage::FilesystemBackend;
use std::sync::Arc;
use tempfile::TempDir;

const CHUNK: usize = 64 * 1024;

fn ranges_for(total: usize, chunk: usize) -> Vec<ByteRange> {
    (0..total)
        .step_by(chunk)
        .map(|start| ByteRange::new(start as u64, (chunk.min(total - start)) as u64).unwrap())
        .collect()
}

async fn upload_in_order(
    backend: &FilesystemBackend,
    data: &bytes::Bytes,
    order: &[usize],
    entry_id: i64,
) -> String {
    let upload = UploadId::new();
    let ranges = ranges_for(data.len(), CHUNK);
    for &index in order {
        let range = ranges[index];
        let body = data.slice(range.offset as usize..range.end() as usize);
        let written = backend
            .write_range(upload, range.offset, chunked_stream(body, 4096))
            .await
            .unwrap();
        assert_eq!(written, range.len);
    }
    let object = backend.finalize(upload, entry_id, &ranges).await.unwrap();
    assert_eq!(object.size, data.len() as u64);

    let stored = collect_stream(backend.read(entry_id).await.unwrap())
        .await
        .unwrap();
    sha256_hex(&stored)
}

#[tokio::test]
async fn permuted_chunks_match_in_order_upload() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(temp_dir.path()).await.unwrap();

    // Five full chunks plus a short tail.
    let data = seeded_bytes(42, CHUNK * 5 + 1234);
    let expected = sha256_hex(&data);

    let in_order = upload_in_order(&backend, &data, &[0, 1, 2, 3, 4, 5], 1).await;
    let reversed = upload_in_order(&backend, &data, &[5, 4, 3, 2, 1, 0], 2).await;
    let shuffled = upload_in_order(&backend, &data, &[3, 0, 5, 1, 4, 2], 3).await;

    assert_eq!(in_order, expected);
    assert_eq!(reversed, expected);
    assert_eq!(shuffled, expected);
}

#[tokio::test]
async fn resent_chunks_do_not_change_the_object() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(temp_dir.path()).await.unwrap();
    let data = seeded_bytes(9, CHUNK * 3);

    let hash = upload_in_order(&backend, &data, &[0, 1, 1, 2, 0, 2], 1).await;
    assert_eq!(hash, sha256_hex(&data));
}

#[tokio::test]
async fn concurrent_range_writes_assemble_correctly() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FilesystemBackend::new(temp_dir.path()).await.unwrap());
    let data = seeded_bytes(3, CHUNK * 8);
    let ranges = ranges_for(data.len(), CHUNK);
    let upload = UploadId::new();

    let mut handles = Vec::new();
    for range in ranges.iter().copied() {
        let backend = backend.clone();
        let body = data.slice(range.offset as usize..range.end() as usize);
        handles.push(tokio::spawn(async move {
            backend
                .write_range(upload, range.offset, chunked_stream(body, 1000))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    backend.finalize(upload, 10, &ranges).await.unwrap();
    let stored = collect_stream(backend.read(10).await.unwrap()).await.unwrap();
    assert_eq!(stored, data);
}

#[tokio::test]
async fn empty_upload_finalizes_to_empty_object() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(temp_dir.path()).await.unwrap();

    let object = backend.finalize(UploadId::new(), 5, &[]).await.unwrap();
    assert_eq!(object.size, 0);
    let stored = collect_stream(backend.read(5).await.unwrap()).await.unwrap();
    assert!(stored.is_empty());
}
