//! Database models mapping to the metadata schema.

use depot_core::{EntryState, UploadState};
use sqlx::FromRow;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Cache entries
// =============================================================================

/// One logical cached artifact.
#[derive(Debug, Clone, FromRow)]
pub struct CacheEntryRow {
    /// Synthetic id, exposed to clients as the cacheId.
    pub id: i64,
    pub key: String,
    pub version: String,
    pub scope: String,
    /// Zero while the entry is pending.
    pub size_bytes: i64,
    pub state: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub accessed_at: OffsetDateTime,
}

impl CacheEntryRow {
    /// Parsed lifecycle state. Unknown strings read as expired.
    pub fn entry_state(&self) -> EntryState {
        EntryState::from_str(&self.state).unwrap_or(EntryState::Expired)
    }

    pub fn is_committed(&self) -> bool {
        self.entry_state() == EntryState::Committed
    }

    pub fn size(&self) -> u64 {
        u64::try_from(self.size_bytes).unwrap_or(0)
    }
}

// =============================================================================
// Upload sessions
// =============================================================================

/// Upload session record, created together with its entry.
#[derive(Debug, Clone, FromRow)]
pub struct UploadSessionRow {
    pub upload_id: Uuid,
    pub entry_id: i64,
    pub state: String,
    /// Total size announced at reservation, if the client sent one.
    pub declared_size: Option<i64>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UploadSessionRow {
    /// Parsed session state. Unknown strings read as abandoned.
    pub fn upload_state(&self) -> UploadState {
        UploadState::from_str(&self.state).unwrap_or(UploadState::Abandoned)
    }
}

/// Result of trying to move a session into 'committing'.
#[derive(Debug, Clone)]
pub enum CommitClaim {
    /// This caller moved the session from 'open' and must finish or abort.
    Claimed(UploadSessionRow),
    /// The session was not open. Carries its current state.
    Unavailable(UploadSessionRow),
}

/// A received chunk, keyed by its byte offset within the upload.
#[derive(Debug, Clone, FromRow)]
pub struct UploadChunkRow {
    pub upload_id: Uuid,
    pub byte_offset: i64,
    pub chunk_index: i64,
    pub byte_length: i64,
    pub received_at: OffsetDateTime,
}

// =============================================================================
// Reservation
// =============================================================================

/// Outcome of a reservation attempt for a (key, version, scope) triple.
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    /// A new pending entry and open session were created.
    Created {
        entry: CacheEntryRow,
        session: UploadSessionRow,
    },
    /// A pending reservation inside the reuse window was handed back.
    Reused {
        entry: CacheEntryRow,
        session: UploadSessionRow,
    },
    /// The triple already has a committed entry.
    Committed(CacheEntryRow),
    /// The triple is held by a pending upload that cannot be reused.
    InProgress(CacheEntryRow),
}

// =============================================================================
// Admin queries
// =============================================================================

/// Filter for admin listings and searches over committed entries.
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
    /// SQL LIKE pattern applied to the key.
    pub key_like: Option<String>,
    pub scope: Option<String>,
    pub created_after: Option<OffsetDateTime>,
    pub created_before: Option<OffsetDateTime>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub limit: i64,
}

impl EntryQuery {
    /// Turn a `*` wildcard pattern into an escaped LIKE pattern.
    pub fn glob_to_like(pattern: &str) -> String {
        let mut out = String::with_capacity(pattern.len());
        for c in pattern.chars() {
            match c {
                '*' => out.push('%'),
                '%' | '_' | '\\' => {
                    out.push('\\');
                    out.push(c);
                }
                other => out.push(other),
            }
        }
        out
    }

    /// LIKE pattern matching keys that contain `text` anywhere.
    pub fn contains_like(text: &str) -> String {
        format!("%{}%", Self::glob_to_like(&text.replace('*', "")))
    }
}

/// Aggregate numbers over the entry table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryUsage {
    pub committed_count: i64,
    pub committed_bytes: i64,
    pub pending_count: i64,
}

// =============================================================================
// Prune jobs
// =============================================================================

/// Lifecycle of a sweep run. Matches the `prune_jobs.state` CHECK constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Finished,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = depot_core::Error;

    fn from_str(s: &str) -> depot_core::Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            other => Err(depot_core::Error::InvalidState(format!(
                "unknown job state: {other}"
            ))),
        }
    }
}

/// Record of one scheduled or manual sweep run.
#[derive(Debug, Clone, FromRow)]
pub struct PruneJobRow {
    pub job_id: Uuid,
    pub job_type: String,
    pub state: String,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub stats_json: Option<String>,
}

impl PruneJobRow {
    /// A fresh row for a job that starts now.
    pub fn running(job_type: &str, started_at: OffsetDateTime) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            state: JobState::Running.as_str().to_string(),
            started_at,
            finished_at: None,
            stats_json: None,
        }
    }

    /// Parsed job state. Unknown strings read as failed.
    pub fn job_state(&self) -> JobState {
        JobState::from_str(&self.state).unwrap_or(JobState::Failed)
    }
}
