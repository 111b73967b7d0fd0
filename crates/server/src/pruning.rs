//! Eviction and stale-upload sweeps.
//!
//! Every sweep is safe to run next to live traffic and on several workers
//! at once. An entry is first moved to `expired` with a compare-and-swap,
//! which makes lookups miss it, then its object is deleted, and only then
//! is the row removed. A crash between those steps leaves an expired row
//! that [`Pruner::purge_expired`] finishes later.

use crate::error::ApiResult;
use crate::metrics;
use depot_core::config::AppConfig;
use depot_core::{Clock, EntryState, UploadId, UploadState};
use depot_metadata::MetadataStore;
use depot_metadata::models::{CacheEntryRow, UploadSessionRow};
use depot_storage::ArtifactStore;
use serde::Serialize;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

/// An entry an age sweep would evict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneCandidate {
    pub id: i64,
    pub key: String,
    pub version: String,
    pub scope: String,
    pub size_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub accessed_at: OffsetDateTime,
}

impl From<&CacheEntryRow> for PruneCandidate {
    fn from(entry: &CacheEntryRow) -> Self {
        Self {
            id: entry.id,
            key: entry.key.clone(),
            version: entry.version.clone(),
            scope: entry.scope.clone(),
            size_bytes: entry.size(),
            accessed_at: entry.accessed_at,
        }
    }
}

/// Counts reported by one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: u64,
    pub deleted: u64,
    /// Bytes released, or that would be released on a dry run.
    pub bytes_freed: u64,
    pub errors: u64,
    pub dry_run: bool,
    /// Entries a dry run would evict.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<PruneCandidate>,
}

impl SweepReport {
    fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    fn log(&self, sweep: &'static str) {
        tracing::info!(
            sweep,
            scanned = self.scanned,
            deleted = self.deleted,
            bytes_freed = self.bytes_freed,
            errors = self.errors,
            dry_run = self.dry_run,
            "Sweep finished"
        );
        if !self.dry_run {
            metrics::ENTRIES_PRUNED
                .with_label_values(&[sweep])
                .inc_by(self.deleted);
            metrics::BYTES_FREED.inc_by(self.bytes_freed);
        }
        metrics::SWEEP_ERRORS
            .with_label_values(&[sweep])
            .inc_by(self.errors);
    }
}

/// Combined result of a scheduled cache sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheSweepReport {
    pub age: SweepReport,
    pub capacity: SweepReport,
    pub expired: SweepReport,
}

/// Runs the eviction sweeps against one storage backend and metadata store.
pub struct Pruner {
    storage: Arc<dyn ArtifactStore>,
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    max_cache_bytes: u64,
    upload_ttl: Duration,
    batch_size: i64,
}

impl Pruner {
    /// Build a pruner from the cleanup section of `config`.
    pub fn new(
        config: &AppConfig,
        storage: Arc<dyn ArtifactStore>,
        metadata: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
    ) -> depot_core::Result<Self> {
        Ok(Self {
            storage,
            metadata,
            clock,
            retention: config.cleanup.retention(),
            max_cache_bytes: config.cleanup.max_cache_bytes()?,
            upload_ttl: config.cleanup.upload_ttl(),
            batch_size: i64::from(config.cleanup.batch_size),
        })
    }

    /// Configured retention horizon.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Age, capacity and leftover-row passes, in that order.
    pub async fn run_cache_sweep(&self) -> ApiResult<CacheSweepReport> {
        let age = self.age_sweep(self.retention, None, false).await?;
        let capacity = self.capacity_sweep().await?;
        let expired = self.purge_expired().await?;
        Ok(CacheSweepReport {
            age,
            capacity,
            expired,
        })
    }

    /// Evict committed entries not accessed within `older_than`.
    ///
    /// A dry run lists the candidates and the bytes they hold without
    /// changing anything.
    pub async fn age_sweep(
        &self,
        older_than: Duration,
        scope: Option<&str>,
        dry_run: bool,
    ) -> ApiResult<SweepReport> {
        let now = self.clock.now();
        let cutoff = now - older_than;
        let mut report = if dry_run {
            SweepReport::dry_run()
        } else {
            SweepReport::default()
        };

        let mut after = None;
        loop {
            let page = self
                .metadata
                .list_entries_by_access(after, Some(cutoff), scope, self.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some((last.accessed_at, last.id));
            let full_page = page.len() as i64 == self.batch_size;

            for entry in &page {
                report.scanned += 1;
                if dry_run {
                    report.bytes_freed += entry.size();
                    report.candidates.push(PruneCandidate::from(entry));
                    continue;
                }
                match self.evict(entry, Some(cutoff), now).await {
                    Ok(true) => {
                        report.deleted += 1;
                        report.bytes_freed += entry.size();
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(entry_id = entry.id, error = %e, "Failed to evict aged entry");
                        report.errors += 1;
                    }
                }
            }

            if !full_page {
                break;
            }
        }

        if !dry_run {
            self.reconcile_backend_prune(cutoff, now, &mut report).await;
        }
        report.log("age");
        Ok(report)
    }

    /// Evict least recently used entries until committed bytes fit the
    /// configured budget.
    pub async fn capacity_sweep(&self) -> ApiResult<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let usage = self.metadata.entry_usage().await?;
        let mut total = u64::try_from(usage.committed_bytes).unwrap_or(0);
        if total <= self.max_cache_bytes {
            report.log("capacity");
            return Ok(report);
        }
        tracing::info!(
            total_bytes = total,
            max_bytes = self.max_cache_bytes,
            "Cache over capacity, evicting least recently used entries"
        );

        let mut after = None;
        'pages: loop {
            let page = self
                .metadata
                .list_entries_by_access(after, None, None, self.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some((last.accessed_at, last.id));
            let full_page = page.len() as i64 == self.batch_size;

            for entry in &page {
                if total <= self.max_cache_bytes {
                    break 'pages;
                }
                report.scanned += 1;
                match self.evict(entry, None, now).await {
                    Ok(true) => {
                        report.deleted += 1;
                        report.bytes_freed += entry.size();
                        total = total.saturating_sub(entry.size());
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(entry_id = entry.id, error = %e, "Failed to evict entry over capacity");
                        report.errors += 1;
                    }
                }
            }

            if !full_page {
                break;
            }
        }

        if total > self.max_cache_bytes {
            tracing::warn!(
                total_bytes = total,
                max_bytes = self.max_cache_bytes,
                "Cache still over capacity after sweep"
            );
        }
        report.log("capacity");
        Ok(report)
    }

    /// Finish deletions that stopped after the entry was expired.
    pub async fn purge_expired(&self) -> ApiResult<SweepReport> {
        let mut report = SweepReport::default();
        loop {
            let page = self.metadata.list_expired_entries(self.batch_size).await?;
            if page.is_empty() {
                break;
            }
            let full_page = page.len() as i64 == self.batch_size;

            let mut removed = 0;
            for entry in &page {
                report.scanned += 1;
                match self.remove_expired(entry).await {
                    Ok(()) => {
                        removed += 1;
                        report.deleted += 1;
                        report.bytes_freed += entry.size();
                    }
                    Err(e) => {
                        tracing::warn!(entry_id = entry.id, error = %e, "Failed to remove expired entry");
                        report.errors += 1;
                    }
                }
            }

            // Rows that keep failing stay listed; stop instead of spinning on them.
            if !full_page || removed == 0 {
                break;
            }
        }
        report.log("expired");
        Ok(report)
    }

    /// Reclaim upload sessions idle past the upload TTL.
    ///
    /// Staged bytes are discarded and the pending entry is expired, which
    /// frees its (key, version, scope) triple for a new reservation.
    pub async fn stale_upload_sweep(&self) -> ApiResult<SweepReport> {
        let now = self.clock.now();
        let stale_before = now - self.upload_ttl;
        let mut report = SweepReport::default();

        loop {
            let page = self
                .metadata
                .list_stale_sessions(stale_before, self.batch_size)
                .await?;
            if page.is_empty() {
                break;
            }
            let full_page = page.len() as i64 == self.batch_size;

            let mut reaped = 0;
            for session in &page {
                report.scanned += 1;
                match self.reap_session(session, stale_before, now).await {
                    Ok(true) => {
                        reaped += 1;
                        report.deleted += 1;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(upload_id = %session.upload_id, error = %e, "Failed to reap stale upload");
                        report.errors += 1;
                    }
                }
            }

            if !full_page || reaped == 0 {
                break;
            }
        }

        metrics::UPLOADS_REAPED.inc_by(report.deleted);
        report.log("uploads");
        Ok(report)
    }

    /// Delete one committed entry regardless of age.
    pub async fn delete_entry(&self, entry: &CacheEntryRow) -> ApiResult<bool> {
        self.evict(entry, None, self.clock.now()).await
    }

    /// Delete one committed entry. Returns false if it changed state or was
    /// accessed since it was listed.
    async fn evict(
        &self,
        entry: &CacheEntryRow,
        accessed_before: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> ApiResult<bool> {
        if !self
            .metadata
            .expire_entry(entry.id, EntryState::Committed, accessed_before, now)
            .await?
        {
            tracing::debug!(entry_id = entry.id, "Entry changed since listing, skipped");
            return Ok(false);
        }
        self.remove_expired(entry).await?;
        tracing::debug!(entry_id = entry.id, key = %entry.key, "Evicted cache entry");
        Ok(true)
    }

    async fn remove_expired(&self, entry: &CacheEntryRow) -> ApiResult<()> {
        self.storage.delete(entry.id).await?;
        self.metadata.delete_expired_entry(entry.id).await?;
        Ok(())
    }

    async fn reap_session(
        &self,
        session: &UploadSessionRow,
        stale_before: OffsetDateTime,
        now: OffsetDateTime,
    ) -> ApiResult<bool> {
        let state = session.upload_state();
        if matches!(state, UploadState::Open | UploadState::Committing)
            && !self
                .metadata
                .abandon_session(session.upload_id, stale_before, now)
                .await?
        {
            return Ok(false);
        }

        self.storage
            .discard_upload(UploadId::from_uuid(session.upload_id))
            .await?;
        self.metadata
            .expire_entry(session.entry_id, EntryState::Pending, None, now)
            .await?;
        tracing::debug!(upload_id = %session.upload_id, entry_id = session.entry_id, "Reaped stale upload");
        Ok(true)
    }

    /// Let the backend drop aged objects on its own, then retire the rows
    /// of anything it removed.
    async fn reconcile_backend_prune(
        &self,
        cutoff: OffsetDateTime,
        now: OffsetDateTime,
        report: &mut SweepReport,
    ) {
        let removed = match self.storage.prune(cutoff).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(error = %e, backend = self.storage.backend_name(), "Backend prune failed");
                report.errors += 1;
                return;
            }
        };

        for id in removed {
            let retired = async {
                if self
                    .metadata
                    .expire_entry(id, EntryState::Committed, None, now)
                    .await?
                {
                    self.metadata.delete_expired_entry(id).await?;
                    return Ok::<_, depot_metadata::MetadataError>(true);
                }
                Ok(false)
            }
            .await;
            match retired {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(entry_id = id, error = %e, "Failed to retire entry removed by backend");
                    report.errors += 1;
                }
            }
        }
    }
}
