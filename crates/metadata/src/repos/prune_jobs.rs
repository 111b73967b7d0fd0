//! Prune job bookkeeping repository.

use crate::error::MetadataResult;
use crate::models::{JobState, PruneJobRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for sweep run records.
#[async_trait]
pub trait PruneJobRepo: Send + Sync {
    /// Insert a job row.
    ///
    /// Fails with [`crate::MetadataError::Constraint`] when another job of
    /// the same type is already running.
    async fn start_prune_job(&self, job: &PruneJobRow) -> MetadataResult<()>;

    /// Move a running job to its final state.
    async fn finish_prune_job(
        &self,
        job_id: Uuid,
        state: JobState,
        finished_at: OffsetDateTime,
        stats_json: Option<&str>,
    ) -> MetadataResult<()>;

    /// Get a job by ID.
    async fn get_prune_job(&self, job_id: Uuid) -> MetadataResult<Option<PruneJobRow>>;

    /// Most recent jobs first.
    async fn list_recent_prune_jobs(&self, limit: i64) -> MetadataResult<Vec<PruneJobRow>>;

    /// Mark jobs still 'running' since before `started_before` as 'failed'.
    async fn fail_stale_prune_jobs(
        &self,
        started_before: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MetadataResult<u64>;
}
