//! Cron-driven sweep scheduling.
//!
//! Each run is recorded as a `prune_jobs` row. The store allows one running
//! job per sweep kind, so when several workers share a store only one of
//! them sweeps at a time and the others skip that tick.

use crate::error::{ApiError, ApiResult};
use crate::pruning::Pruner;
use depot_core::{Clock, CronSchedule};
use depot_metadata::models::{JobState, PruneJobRow};
use depot_metadata::{MetadataError, MetadataStore};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Jobs still running after this long are presumed dead.
pub const JOB_LEASE: Duration = Duration::hours(1);

/// The two scheduled sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepKind {
    /// Age and capacity eviction of committed entries.
    Cache,
    /// Reaping of abandoned upload sessions.
    Uploads,
}

impl SweepKind {
    /// Value stored in `prune_jobs.job_type`.
    pub fn job_type(&self) -> &'static str {
        match self {
            Self::Cache => "cache_sweep",
            Self::Uploads => "upload_sweep",
        }
    }
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cache => f.write_str("cache"),
            Self::Uploads => f.write_str("uploads"),
        }
    }
}

impl FromStr for SweepKind {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache" => Ok(Self::Cache),
            "uploads" => Ok(Self::Uploads),
            other => Err(ApiError::InvalidRequest(format!(
                "unknown sweep '{other}', expected 'cache' or 'uploads'"
            ))),
        }
    }
}

/// Outcome of one recorded sweep run.
#[derive(Debug, Clone, Serialize)]
pub struct SweepRun {
    pub job_id: Uuid,
    pub kind: SweepKind,
    pub stats: serde_json::Value,
}

/// Runs sweeps on their cron schedules and on demand.
pub struct SweepScheduler {
    pruner: Arc<Pruner>,
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
}

impl SweepScheduler {
    pub fn new(
        pruner: Arc<Pruner>,
        metadata: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pruner,
            metadata,
            clock,
        }
    }

    /// Mark jobs orphaned by a crashed worker as failed.
    pub async fn recover_stale_jobs(&self) -> ApiResult<u64> {
        let now = self.clock.now();
        let recovered = self
            .metadata
            .fail_stale_prune_jobs(now - JOB_LEASE, now)
            .await?;
        if recovered > 0 {
            tracing::warn!(count = recovered, "Marked orphaned sweep jobs as failed");
        }
        Ok(recovered)
    }

    /// Run one sweep now and record it.
    ///
    /// Returns `Ok(None)` when the same sweep is already running somewhere.
    pub async fn run_once(&self, kind: SweepKind) -> ApiResult<Option<SweepRun>> {
        let job = PruneJobRow::running(kind.job_type(), self.clock.now());
        match self.metadata.start_prune_job(&job).await {
            Ok(()) => {}
            Err(MetadataError::Constraint(_)) => {
                tracing::debug!(sweep = %kind, "Sweep already running, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let result = match kind {
            SweepKind::Cache => self
                .pruner
                .run_cache_sweep()
                .await
                .and_then(|report| to_stats(&report)),
            SweepKind::Uploads => self
                .pruner
                .stale_upload_sweep()
                .await
                .and_then(|report| to_stats(&report)),
        };

        let (state, stats) = match &result {
            Ok(stats) => (JobState::Finished, stats.clone()),
            Err(e) => (JobState::Failed, serde_json::json!({ "error": e.to_string() })),
        };
        let stats_json = stats.to_string();
        if let Err(e) = self
            .metadata
            .finish_prune_job(job.job_id, state, self.clock.now(), Some(&stats_json))
            .await
        {
            tracing::error!(job_id = %job.job_id, error = %e, "Failed to record sweep result");
        }

        let stats = result?;
        Ok(Some(SweepRun {
            job_id: job.job_id,
            kind,
            stats,
        }))
    }

    /// Spawn the timer loop for `kind`.
    pub fn spawn(self: Arc<Self>, kind: SweepKind, schedule: CronSchedule) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_schedule(kind, schedule).await })
    }

    async fn run_schedule(&self, kind: SweepKind, schedule: CronSchedule) {
        tracing::info!(sweep = %kind, cron = schedule.expr(), "Sweep scheduled");
        let mut cursor = self.clock.now();
        loop {
            let Some(next) = schedule.next_after(cursor) else {
                tracing::warn!(sweep = %kind, cron = schedule.expr(), "Schedule has no future runs");
                return;
            };
            self.clock.sleep_until(next).await;

            match self.run_once(kind).await {
                Ok(Some(run)) => tracing::debug!(sweep = %kind, job_id = %run.job_id, "Scheduled sweep done"),
                Ok(None) => {}
                Err(e) => tracing::error!(sweep = %kind, error = %e, "Scheduled sweep failed"),
            }

            // Ticks missed while the sweep ran are skipped, not replayed.
            cursor = next.max(self.clock.now());
        }
    }
}

fn to_stats<T: Serialize>(report: &T) -> ApiResult<serde_json::Value> {
    serde_json::to_value(report)
        .map_err(|e| ApiError::Internal(format!("failed to encode sweep stats: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_kinds_parse_from_path_segments() {
        assert_eq!("cache".parse::<SweepKind>().unwrap(), SweepKind::Cache);
        assert_eq!("uploads".parse::<SweepKind>().unwrap(), SweepKind::Uploads);
        assert!("gc".parse::<SweepKind>().is_err());
        assert_eq!(SweepKind::Uploads.job_type(), "upload_sweep");
        assert_eq!(SweepKind::Cache.to_string(), "cache");
    }
}
