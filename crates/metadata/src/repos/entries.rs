//! Cache entry repository.

use crate::error::MetadataResult;
use crate::models::{CacheEntryRow, EntryQuery, EntryUsage, ReserveOutcome};
use async_trait::async_trait;
use depot_core::{EntryKey, EntryState};
use time::OffsetDateTime;
use uuid::Uuid;

/// Parameters for reserving a (key, version, scope) triple.
#[derive(Debug, Clone)]
pub struct ReserveRequest<'a> {
    pub key: &'a EntryKey,
    /// Id for the session if a new one is created.
    pub upload_id: Uuid,
    pub declared_size: Option<i64>,
    pub now: OffsetDateTime,
    /// Pending reservations created at or after this instant are reused.
    pub reuse_after: OffsetDateTime,
}

/// Repository for cache entry operations.
#[async_trait]
pub trait EntryRepo: Send + Sync {
    /// Reserve a triple in one transaction.
    ///
    /// Creates a pending entry plus open session unless the triple is
    /// already committed, or pending. A pending reservation whose session is
    /// still open and whose entry was created no earlier than
    /// `reuse_after` is returned as [`ReserveOutcome::Reused`].
    async fn reserve_entry(&self, request: &ReserveRequest<'_>) -> MetadataResult<ReserveOutcome>;

    /// Get an entry by id, in any state.
    async fn get_entry(&self, id: i64) -> MetadataResult<Option<CacheEntryRow>>;

    /// Find the committed entry for an exact triple.
    async fn find_committed(&self, key: &EntryKey) -> MetadataResult<Option<CacheEntryRow>>;

    /// Find the most recently updated committed entry in `scope` whose key
    /// starts with `prefix`. Version is not considered.
    async fn find_committed_by_prefix(
        &self,
        scope: &str,
        prefix: &str,
    ) -> MetadataResult<Option<CacheEntryRow>>;

    /// Record a lookup hit. Returns false if the entry is no longer committed.
    async fn touch_entry(&self, id: i64, accessed_at: OffsetDateTime) -> MetadataResult<bool>;

    /// Compare-and-swap an entry into `expired`.
    ///
    /// Only succeeds while the entry is in `expected` and, when
    /// `accessed_before` is set, its last access is older than that instant.
    async fn expire_entry(
        &self,
        id: i64,
        expected: EntryState,
        accessed_before: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Remove an expired entry row with its sessions and chunks.
    async fn delete_expired_entry(&self, id: i64) -> MetadataResult<bool>;

    /// Committed entries in ascending (accessed_at, id) order.
    ///
    /// `after` continues a previous page. `accessed_before` restricts the
    /// listing to entries idle since before that instant and `scope` to one
    /// scope.
    async fn list_entries_by_access(
        &self,
        after: Option<(OffsetDateTime, i64)>,
        accessed_before: Option<OffsetDateTime>,
        scope: Option<&str>,
        limit: i64,
    ) -> MetadataResult<Vec<CacheEntryRow>>;

    /// Expired rows left behind by an interrupted deletion.
    async fn list_expired_entries(&self, limit: i64) -> MetadataResult<Vec<CacheEntryRow>>;

    /// Committed entries matching `query`, most recently accessed first.
    async fn query_entries(&self, query: &EntryQuery) -> MetadataResult<Vec<CacheEntryRow>>;

    /// Aggregate entry counts and committed bytes.
    async fn entry_usage(&self) -> MetadataResult<EntryUsage>;

    /// Number of committed entries accessed at or after `since`.
    async fn count_accessed_since(&self, since: OffsetDateTime) -> MetadataResult<i64>;
}
