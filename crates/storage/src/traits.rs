//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use depot_core::{ByteRange, UploadId};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use time::OffsetDateTime;

/// A boxed stream of bytes, used for both chunk ingestion and reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Where a finalized object lives and how large it is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    pub key: String,
    pub size: u64,
}

/// Backend key of the committed object for an entry.
pub fn entry_key(entry_id: i64) -> String {
    format!("entries/{entry_id}")
}

/// Backend prefix holding the staged parts of one upload.
pub fn staging_prefix(upload_id: UploadId) -> String {
    format!("staging/{upload_id}/")
}

/// Backend key of one staged part. Offsets are zero padded so keys sort
/// in byte order.
pub fn staging_key(upload_id: UploadId, offset: u64) -> String {
    format!("staging/{upload_id}/{offset:020}")
}

/// Durable storage for cache artifacts.
///
/// Uploads are staged as one part per byte range and only become visible
/// under the owning entry's id once [`ArtifactStore::finalize`] succeeds.
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    /// Write `body` as the range starting at `offset` of an in-progress upload.
    ///
    /// Writing the same offset again replaces the earlier bytes. Returns the
    /// number of bytes written.
    async fn write_range(
        &self,
        upload_id: UploadId,
        offset: u64,
        body: ByteStream,
    ) -> StorageResult<u64>;

    /// Assemble the staged `ranges` (sorted, contiguous from 0) into the
    /// committed object for `entry_id`.
    ///
    /// Readers either see no object or the complete one. Staged parts are
    /// removed once the object is in place.
    async fn finalize(
        &self,
        upload_id: UploadId,
        entry_id: i64,
        ranges: &[ByteRange],
    ) -> StorageResult<ObjectRef>;

    /// Stream a committed object.
    async fn read(&self, entry_id: i64) -> StorageResult<ByteStream>;

    /// Remove a committed object. Missing objects are not an error.
    async fn delete(&self, entry_id: i64) -> StorageResult<()>;

    /// Drop every staged part of an upload. Missing uploads are not an error.
    async fn discard_upload(&self, upload_id: UploadId) -> StorageResult<()>;

    /// Backend-local cleanup hook run after the age sweep.
    ///
    /// Returns ids of committed objects the backend removed on its own.
    /// Backends without bulk-delete support only tidy leftover staging data.
    async fn prune(&self, _cutoff: OffsetDateTime) -> StorageResult<Vec<i64>> {
        Ok(Vec::new())
    }

    /// A time-limited URL clients can download from directly, if supported.
    async fn presigned_url(&self, _entry_id: i64, _ttl: Duration) -> StorageResult<Option<String>> {
        Ok(None)
    }

    /// Get the name of this storage backend, for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Wrap a byte stream so it fails once more than `limit` bytes have passed.
pub fn limit_stream(body: ByteStream, limit: u64) -> ByteStream {
    let mut seen: u64 = 0;
    Box::pin(body.map(move |item| {
        let chunk = item?;
        seen = seen.saturating_add(chunk.len() as u64);
        if seen > limit {
            return Err(StorageError::TooLarge { limit });
        }
        Ok(chunk)
    }))
}

/// Wrap a byte stream so it fails unless exactly `expected` bytes pass.
///
/// The error surfaces before the stream ends, so a backend never publishes
/// a part whose length disagrees with what the client announced.
pub fn exact_length_stream(mut body: ByteStream, expected: u64) -> ByteStream {
    Box::pin(async_stream::try_stream! {
        let mut seen: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            seen = seen.saturating_add(chunk.len() as u64);
            if seen > expected {
                Err::<(), _>(StorageError::LengthMismatch { expected, actual: seen })?;
            }
            yield chunk;
        }
        if seen != expected {
            Err::<(), _>(StorageError::LengthMismatch { expected, actual: seen })?;
        }
    })
}

/// Build a [`ByteStream`] from in-memory bytes.
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Drain a stream into memory. Intended for tests and small objects.
pub async fn collect_stream(mut stream: ByteStream) -> StorageResult<Bytes> {
    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}
