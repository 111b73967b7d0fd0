//! Upload coordinator: reservation, chunk ingestion and commit.
//!
//! All cross-request state lives in the metadata store. The coordinator
//! holds no per-upload memory, so any worker can serve any request of an
//! upload.

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use depot_core::config::AppConfig;
use depot_core::{ByteRange, ChunkAddress, Clock, EntryKey, UploadId, UploadState, check_coverage};
use depot_metadata::models::{CommitClaim, ReserveOutcome, UploadChunkRow, UploadSessionRow};
use depot_metadata::repos::ReserveRequest;
use depot_metadata::{MetadataError, MetadataStore};
use depot_storage::traits::{exact_length_stream, limit_stream};
use depot_storage::{ArtifactStore, ByteStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

/// How often a waiting committer re-reads the session.
const COMMIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Identifiers handed out by [`UploadCoordinator::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub entry_id: i64,
    pub upload_id: UploadId,
    /// The triple was already pending and its session was handed back.
    pub reused: bool,
}

/// Acknowledgement of one stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAck {
    pub index: u64,
    pub offset: u64,
    pub bytes: u64,
}

/// Result of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub entry_id: i64,
    pub size: u64,
    /// Another call had already committed this upload.
    pub already_committed: bool,
}

/// Coordinates reservations, chunk writes and commits.
pub struct UploadCoordinator {
    storage: Arc<dyn ArtifactStore>,
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    reserve_reuse_window: time::Duration,
    commit_wait: Duration,
    max_chunk_bytes: u64,
}

impl UploadCoordinator {
    pub fn new(
        config: &AppConfig,
        storage: Arc<dyn ArtifactStore>,
        metadata: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            metadata,
            clock,
            reserve_reuse_window: config.cleanup.reserve_reuse_window(),
            commit_wait: config.cleanup.commit_wait(),
            max_chunk_bytes: config.server.max_chunk_bytes,
        }
    }

    /// Reserve a (key, version, scope) triple for upload.
    ///
    /// Re-reserving a pending triple inside the reuse window returns the
    /// same session. A committed triple, or a pending one outside the
    /// window, is a conflict.
    #[instrument(skip(self), fields(key = %key.key, version = %key.version, scope = %key.scope))]
    pub async fn reserve(
        &self,
        key: &EntryKey,
        declared_size: Option<u64>,
    ) -> ApiResult<Reservation> {
        let declared_size = declared_size
            .map(|size| {
                i64::try_from(size)
                    .map_err(|_| ApiError::InvalidRequest(format!("cache size {size} is too large")))
            })
            .transpose()?;

        let mut retried = false;
        let outcome = loop {
            let now = self.clock.now();
            let request = ReserveRequest {
                key,
                upload_id: *UploadId::new().as_uuid(),
                declared_size,
                now,
                reuse_after: now - self.reserve_reuse_window,
            };
            match self.metadata.reserve_entry(&request).await {
                // Lost an insert race against another worker; the retry sees its row.
                Err(MetadataError::Constraint(_)) if !retried => retried = true,
                other => break other?,
            }
        };

        match outcome {
            ReserveOutcome::Created { entry, session } => {
                metrics::RESERVATIONS.with_label_values(&["created"]).inc();
                tracing::debug!(entry_id = entry.id, upload_id = %session.upload_id, "Reserved cache entry");
                Ok(Reservation {
                    entry_id: entry.id,
                    upload_id: UploadId::from_uuid(session.upload_id),
                    reused: false,
                })
            }
            ReserveOutcome::Reused { entry, session } => {
                metrics::RESERVATIONS.with_label_values(&["reused"]).inc();
                tracing::debug!(entry_id = entry.id, upload_id = %session.upload_id, "Reused pending reservation");
                Ok(Reservation {
                    entry_id: entry.id,
                    upload_id: UploadId::from_uuid(session.upload_id),
                    reused: true,
                })
            }
            ReserveOutcome::Committed(entry) => {
                metrics::RESERVATIONS.with_label_values(&["conflict"]).inc();
                Err(ApiError::Conflict(format!(
                    "cache entry {} is already committed as {}",
                    key, entry.id
                )))
            }
            ReserveOutcome::InProgress(entry) => {
                metrics::RESERVATIONS.with_label_values(&["conflict"]).inc();
                Err(ApiError::Conflict(format!(
                    "cache entry {} is being uploaded as {}",
                    key, entry.id
                )))
            }
        }
    }

    /// Upload session created with the entry `entry_id`.
    pub async fn upload_for_entry(&self, entry_id: i64) -> ApiResult<UploadId> {
        let session = self
            .metadata
            .get_session_for_entry(entry_id)
            .await?
            .ok_or_else(|| ApiError::UnknownUpload(format!("no upload for cache {entry_id}")))?;
        Ok(UploadId::from_uuid(session.upload_id))
    }

    /// Store one chunk of an open upload.
    ///
    /// Chunks may arrive in any order, concurrently, and more than once. A
    /// repeated offset replaces the earlier bytes.
    ///
    /// With `expected_len`, a body of any other length is rejected before
    /// the part is stored or recorded, and an earlier part at the same
    /// offset stays in place.
    #[instrument(skip(self, body), fields(upload_id = %upload_id, index = address.index, offset = address.offset))]
    pub async fn write_chunk(
        &self,
        upload_id: UploadId,
        address: ChunkAddress,
        body: ByteStream,
        expected_len: Option<u64>,
    ) -> ApiResult<ChunkAck> {
        let session = self.open_session(upload_id).await?;

        let byte_offset = to_i64(address.offset, "offset")?;
        let chunk_index = to_i64(address.index, "chunk index")?;
        let mut body = limit_stream(body, self.max_chunk_bytes);
        if let Some(len) = expected_len {
            body = exact_length_stream(body, len);
        }
        let written = self
            .storage
            .write_range(upload_id, address.offset, body)
            .await?;
        if let Some(len) = expected_len
            && written != len
        {
            return Err(ApiError::InvalidRequest(format!(
                "chunk at offset {} has {written} bytes, expected {len}",
                address.offset
            )));
        }

        let recorded = self
            .metadata
            .record_chunk(&UploadChunkRow {
                upload_id: session.upload_id,
                byte_offset,
                chunk_index,
                byte_length: to_i64(written, "chunk length")?,
                received_at: self.clock.now(),
            })
            .await?;
        if !recorded {
            return Err(ApiError::UnknownUpload(format!(
                "upload {upload_id} closed while the chunk was written"
            )));
        }

        metrics::CHUNKS_WRITTEN.inc();
        metrics::BYTES_WRITTEN.inc_by(written);
        Ok(ChunkAck {
            index: address.index,
            offset: address.offset,
            bytes: written,
        })
    }

    /// Commit an upload into its cache entry.
    ///
    /// Exactly one caller finalizes the stored object. A concurrent caller
    /// waits for that commit to finish, and a caller arriving after it gets
    /// the committed result back.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn commit(
        &self,
        upload_id: UploadId,
        declared_size: Option<u64>,
    ) -> ApiResult<CommitOutcome> {
        let deadline = Instant::now() + self.commit_wait;
        loop {
            let claim = self
                .metadata
                .begin_commit(*upload_id.as_uuid(), self.clock.now())
                .await?
                .ok_or_else(|| ApiError::UnknownUpload(upload_id.to_string()))?;

            let session = match claim {
                CommitClaim::Claimed(session) => {
                    return self.finish_commit(upload_id, session, declared_size).await;
                }
                CommitClaim::Unavailable(session) => session,
            };

            match session.upload_state() {
                UploadState::Committed => return self.committed_outcome(&session).await,
                UploadState::Abandoned => {
                    return Err(ApiError::UnknownUpload(format!(
                        "upload {upload_id} was abandoned"
                    )));
                }
                UploadState::Committing if Instant::now() >= deadline => {
                    return Err(ApiError::Conflict(format!(
                        "upload {upload_id} is still being committed"
                    )));
                }
                UploadState::Committing | UploadState::Open => {
                    tokio::time::sleep(COMMIT_POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn finish_commit(
        &self,
        upload_id: UploadId,
        session: UploadSessionRow,
        declared_size: Option<u64>,
    ) -> ApiResult<CommitOutcome> {
        let started = std::time::Instant::now();

        let ranges = match self.received_ranges(upload_id).await {
            Ok(ranges) => ranges,
            Err(e) => {
                self.release(upload_id).await;
                return Err(e);
            }
        };

        let declared = match declared_size {
            Some(size) => Some(size),
            None => session.declared_size.map(|size| to_u64(size, "declared size")).transpose()?,
        };
        let size = match check_coverage(&ranges, declared) {
            Ok(size) => size,
            Err(e) => {
                metrics::record_commit_failure("incomplete");
                self.release(upload_id).await;
                return Err(ApiError::IncompleteUpload(format!("upload {upload_id}: {e}")));
            }
        };

        let object = match self.storage.finalize(upload_id, session.entry_id, &ranges).await {
            Ok(object) => object,
            Err(e) => {
                metrics::record_commit_failure("storage");
                self.release(upload_id).await;
                return Err(e.into());
            }
        };

        // Staged parts are gone from here on, so a failed commit is not
        // reopened. The stale-upload sweep reclaims the session.
        match self
            .metadata
            .complete_commit(*upload_id.as_uuid(), to_i64(size, "size")?, self.clock.now())
            .await
        {
            Ok(()) => {}
            Err(e @ (MetadataError::InvalidStateTransition { .. } | MetadataError::NotFound(_))) => {
                metrics::record_commit_failure("superseded");
                if let Err(delete_err) = self.storage.delete(session.entry_id).await {
                    tracing::warn!(entry_id = session.entry_id, error = %delete_err, "Failed to remove object of superseded commit");
                }
                return Err(ApiError::UnknownUpload(format!("upload {upload_id}: {e}")));
            }
            Err(e) => {
                metrics::record_commit_failure("metadata");
                return Err(e.into());
            }
        }

        metrics::COMMITS.inc();
        metrics::COMMIT_DURATION.observe(started.elapsed().as_secs_f64());
        tracing::info!(
            entry_id = session.entry_id,
            size_bytes = size,
            key = %object.key,
            "Upload committed"
        );

        Ok(CommitOutcome {
            entry_id: session.entry_id,
            size,
            already_committed: false,
        })
    }

    async fn committed_outcome(&self, session: &UploadSessionRow) -> ApiResult<CommitOutcome> {
        let entry = self
            .metadata
            .get_entry(session.entry_id)
            .await?
            .filter(|entry| entry.is_committed())
            .ok_or_else(|| ApiError::NotFound(format!("cache {} is gone", session.entry_id)))?;
        Ok(CommitOutcome {
            entry_id: entry.id,
            size: entry.size(),
            already_committed: true,
        })
    }

    async fn open_session(&self, upload_id: UploadId) -> ApiResult<UploadSessionRow> {
        match self.metadata.get_session(*upload_id.as_uuid()).await? {
            Some(session) if session.upload_state() == UploadState::Open => Ok(session),
            Some(session) => Err(ApiError::UnknownUpload(format!(
                "upload {upload_id} is {}",
                session.state
            ))),
            None => Err(ApiError::UnknownUpload(upload_id.to_string())),
        }
    }

    async fn received_ranges(&self, upload_id: UploadId) -> ApiResult<Vec<ByteRange>> {
        let chunks = self.metadata.list_chunks(*upload_id.as_uuid()).await?;
        chunks
            .iter()
            .map(|chunk| {
                let offset = to_u64(chunk.byte_offset, "offset")?;
                let len = to_u64(chunk.byte_length, "chunk length")?;
                Ok(ByteRange::new(offset, len)?)
            })
            .collect()
    }

    /// Hand a claimed session back so the client can retry the commit.
    async fn release(&self, upload_id: UploadId) {
        if let Err(e) = self
            .metadata
            .abort_commit(*upload_id.as_uuid(), self.clock.now())
            .await
        {
            tracing::warn!(upload_id = %upload_id, error = %e, "Failed to reopen upload after commit failure");
        }
    }
}

fn to_i64(value: u64, what: &str) -> ApiResult<i64> {
    i64::try_from(value).map_err(|_| ApiError::InvalidRequest(format!("{what} {value} is too large")))
}

fn to_u64(value: i64, what: &str) -> ApiResult<u64> {
    u64::try_from(value).map_err(|_| ApiError::Internal(format!("stored {what} {value} is negative")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::ManualClock;
    use depot_metadata::SqliteStore;
    use depot_storage::FilesystemBackend;
    use depot_storage::traits::{bytes_stream, collect_stream};
    use tempfile::TempDir;
    use time::macros::datetime;

    async fn coordinator() -> (UploadCoordinator, Arc<dyn ArtifactStore>, TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn ArtifactStore> =
            Arc::new(FilesystemBackend::new(temp.path().join("blobs")).await.unwrap());
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(temp.path().join("meta.db"), None)
                .await
                .unwrap(),
        );
        let clock = Arc::new(ManualClock::new(datetime!(2026-03-01 12:00:00 UTC)));
        let coordinator =
            UploadCoordinator::new(&AppConfig::for_testing(), storage.clone(), metadata, clock);
        (coordinator, storage, temp)
    }

    fn key(name: &str) -> EntryKey {
        EntryKey::new(name, "v1", "main").unwrap()
    }

    #[tokio::test]
    async fn commit_rejects_gaps_and_keeps_session_open() {
        let (coordinator, _storage, _temp) = coordinator().await;
        let reservation = coordinator.reserve(&key("gappy"), None).await.unwrap();
        let upload = reservation.upload_id;

        coordinator
            .write_chunk(upload, ChunkAddress::at_offset(0), bytes_stream("abc"), None)
            .await
            .unwrap();
        coordinator
            .write_chunk(upload, ChunkAddress::at_offset(5), bytes_stream("fg"), None)
            .await
            .unwrap();

        let err = coordinator.commit(upload, None).await.unwrap_err();
        assert!(matches!(err, ApiError::IncompleteUpload(_)), "{err:?}");

        coordinator
            .write_chunk(upload, ChunkAddress::at_offset(3), bytes_stream("de"), None)
            .await
            .unwrap();
        let outcome = coordinator.commit(upload, Some(7)).await.unwrap();
        assert_eq!(outcome.size, 7);
        assert!(!outcome.already_committed);
    }

    #[tokio::test]
    async fn declared_size_must_match_received_bytes() {
        let (coordinator, _storage, _temp) = coordinator().await;
        let reservation = coordinator.reserve(&key("sized"), Some(10)).await.unwrap();

        coordinator
            .write_chunk(reservation.upload_id, ChunkAddress::WHOLE, bytes_stream("short"), None)
            .await
            .unwrap();
        let err = coordinator.commit(reservation.upload_id, None).await.unwrap_err();
        assert!(matches!(err, ApiError::IncompleteUpload(_)));
    }

    #[tokio::test]
    async fn writes_after_commit_are_rejected() {
        let (coordinator, storage, _temp) = coordinator().await;
        let reservation = coordinator.reserve(&key("closed"), None).await.unwrap();
        coordinator
            .write_chunk(reservation.upload_id, ChunkAddress::WHOLE, bytes_stream("payload"), None)
            .await
            .unwrap();
        coordinator.commit(reservation.upload_id, None).await.unwrap();

        let err = coordinator
            .write_chunk(reservation.upload_id, ChunkAddress::WHOLE, bytes_stream("other"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::UnknownUpload(_)));

        let stored = collect_stream(storage.read(reservation.entry_id).await.unwrap())
            .await
            .unwrap();
        assert_eq!(&stored[..], b"payload");
    }

    #[tokio::test]
    async fn short_bodies_leave_no_recorded_range() {
        let (coordinator, _storage, _temp) = coordinator().await;
        let reservation = coordinator.reserve(&key("truncated"), None).await.unwrap();
        let upload = reservation.upload_id;

        let err = coordinator
            .write_chunk(upload, ChunkAddress::at_offset(0), bytes_stream("abcde"), Some(10))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
        let err = coordinator.commit(upload, None).await.unwrap_err();
        assert!(matches!(err, ApiError::IncompleteUpload(_)), "{err:?}");

        // A bad retry must not clobber a range that already landed.
        coordinator
            .write_chunk(upload, ChunkAddress::at_offset(0), bytes_stream("0123456789"), Some(10))
            .await
            .unwrap();
        assert!(
            coordinator
                .write_chunk(upload, ChunkAddress::at_offset(0), bytes_stream("xyz"), Some(10))
                .await
                .is_err()
        );
        assert!(
            coordinator
                .write_chunk(
                    upload,
                    ChunkAddress::at_offset(10),
                    bytes_stream("more than four"),
                    Some(4)
                )
                .await
                .is_err()
        );

        let outcome = coordinator.commit(upload, None).await.unwrap();
        assert_eq!(outcome.size, 10);
    }

    #[tokio::test]
    async fn unknown_upload_ids_are_rejected() {
        let (coordinator, _storage, _temp) = coordinator().await;
        let stranger = UploadId::new();
        assert!(matches!(
            coordinator
                .write_chunk(stranger, ChunkAddress::WHOLE, bytes_stream("x"), None)
                .await,
            Err(ApiError::UnknownUpload(_))
        ));
        assert!(matches!(
            coordinator.commit(stranger, None).await,
            Err(ApiError::UnknownUpload(_))
        ));
        assert!(matches!(
            coordinator.upload_for_entry(404).await,
            Err(ApiError::UnknownUpload(_))
        ));
    }

    #[tokio::test]
    async fn oversized_chunks_are_refused() {
        let temp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn ArtifactStore> =
            Arc::new(FilesystemBackend::new(temp.path().join("blobs")).await.unwrap());
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(temp.path().join("meta.db"), None)
                .await
                .unwrap(),
        );
        let mut config = AppConfig::for_testing();
        config.server.max_chunk_bytes = 4;
        let coordinator = UploadCoordinator::new(
            &config,
            storage,
            metadata,
            Arc::new(ManualClock::new(datetime!(2026-03-01 12:00:00 UTC))),
        );

        let reservation = coordinator.reserve(&key("big"), None).await.unwrap();
        let err = coordinator
            .write_chunk(reservation.upload_id, ChunkAddress::WHOLE, bytes_stream("too long"), None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::PAYLOAD_TOO_LARGE);
    }
}
