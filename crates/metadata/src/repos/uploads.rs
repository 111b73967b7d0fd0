//! Upload session repository.

use crate::error::MetadataResult;
use crate::models::{CommitClaim, UploadChunkRow, UploadSessionRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for upload session operations.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Get an upload session by ID.
    async fn get_session(&self, upload_id: Uuid) -> MetadataResult<Option<UploadSessionRow>>;

    /// Get the session that was created with an entry.
    async fn get_session_for_entry(&self, entry_id: i64)
    -> MetadataResult<Option<UploadSessionRow>>;

    /// Record a received chunk and bump the session's `updated_at`.
    ///
    /// A chunk at an offset that was already recorded replaces the earlier
    /// record. Returns false without writing if the session is not open.
    async fn record_chunk(&self, chunk: &UploadChunkRow) -> MetadataResult<bool>;

    /// All recorded chunks of a session, ordered by byte offset.
    async fn list_chunks(&self, upload_id: Uuid) -> MetadataResult<Vec<UploadChunkRow>>;

    /// Atomically transition a session from 'open' to 'committing'.
    ///
    /// Returns None if the session doesn't exist. Exactly one concurrent
    /// caller gets [`CommitClaim::Claimed`].
    async fn begin_commit(
        &self,
        upload_id: Uuid,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<Option<CommitClaim>>;

    /// Hand a 'committing' session back to 'open' after a failed commit.
    async fn abort_commit(&self, upload_id: Uuid, updated_at: OffsetDateTime)
    -> MetadataResult<bool>;

    /// Mark session and entry committed in one transaction.
    ///
    /// The session must be 'committing' and the entry 'pending'; otherwise
    /// nothing changes and an invalid-transition error is returned. Chunk
    /// records are dropped.
    async fn complete_commit(
        &self,
        upload_id: Uuid,
        size_bytes: i64,
        committed_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Sessions needing the stale-upload sweep: 'open' or 'committing' and
    /// idle since before `stale_before`, or 'abandoned' while their entry is
    /// still pending.
    async fn list_stale_sessions(
        &self,
        stale_before: OffsetDateTime,
        limit: i64,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Compare-and-swap a stale session to 'abandoned' and drop its chunks.
    ///
    /// Only applies while the session is 'open' or 'committing' and idle
    /// since before `stale_before`.
    async fn abandon_session(
        &self,
        upload_id: Uuid,
        stale_before: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;
}
