//! Administrative operations over the cache.
//!
//! The HTTP admin routes and `depotctl` are thin wrappers over this facade.

use crate::error::{ApiError, ApiResult};
use crate::pruning::{Pruner, SweepReport};
use crate::scheduler::{SweepKind, SweepRun, SweepScheduler};
use depot_core::Clock;
use depot_metadata::MetadataStore;
use depot_metadata::models::{CacheEntryRow, EntryQuery};
use depot_storage::ArtifactStore;
use serde::Serialize;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

/// Default page size for listings.
pub const DEFAULT_LIST_LIMIT: i64 = 50;

/// Upper bound on any listing.
pub const MAX_LIST_LIMIT: i64 = 1000;

/// Entries shown in the detailed stats view.
const RECENT_ENTRIES: i64 = 10;

/// A cache entry as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct EntryView {
    pub id: i64,
    pub key: String,
    pub version: String,
    pub scope: String,
    pub state: String,
    pub size_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub accessed_at: OffsetDateTime,
}

impl From<CacheEntryRow> for EntryView {
    fn from(entry: CacheEntryRow) -> Self {
        let size_bytes = entry.size();
        Self {
            id: entry.id,
            key: entry.key,
            version: entry.version,
            scope: entry.scope,
            state: entry.state,
            size_bytes,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
            accessed_at: entry.accessed_at,
        }
    }
}

/// Lookup activity over trailing windows.
#[derive(Debug, Clone, Serialize)]
pub struct RecentActivity {
    pub last_hour: i64,
    pub last_day: i64,
    pub last_week: i64,
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entry_count: i64,
    pub total_size_bytes: i64,
    pub pending_uploads: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_activity: Option<RecentActivity>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_entries: Vec<EntryView>,
}

/// Free-text search over committed entries.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub scope: Option<String>,
    pub created_after: Option<OffsetDateTime>,
    pub created_before: Option<OffsetDateTime>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub limit: Option<i64>,
}

/// Health of one dependency.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    pub backend: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn from_result<E: std::fmt::Display>(backend: &'static str, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self {
                status: "ok",
                backend,
                error: None,
            },
            Err(e) => Self {
                status: "error",
                backend,
                error: Some(e.to_string()),
            },
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Overall health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<ComponentHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<ComponentHealth>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "ok"
    }
}

/// Operator-facing facade over metadata, storage and the sweeps.
pub struct AdminService {
    storage: Arc<dyn ArtifactStore>,
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
    pruner: Arc<Pruner>,
    scheduler: Arc<SweepScheduler>,
}

impl AdminService {
    pub fn new(
        storage: Arc<dyn ArtifactStore>,
        metadata: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
        pruner: Arc<Pruner>,
        scheduler: Arc<SweepScheduler>,
    ) -> Self {
        Self {
            storage,
            metadata,
            clock,
            pruner,
            scheduler,
        }
    }

    /// Committed entries, most recently accessed first. `key_pattern`
    /// accepts `*` wildcards.
    pub async fn list_entries(
        &self,
        key_pattern: Option<&str>,
        limit: Option<i64>,
    ) -> ApiResult<Vec<EntryView>> {
        let query = EntryQuery {
            key_like: key_pattern
                .filter(|p| !p.is_empty())
                .map(EntryQuery::glob_to_like),
            limit: clamp_limit(limit)?,
            ..EntryQuery::default()
        };
        let rows = self.metadata.query_entries(&query).await?;
        Ok(rows.into_iter().map(EntryView::from).collect())
    }

    /// One entry in any state.
    pub async fn get_entry(&self, id: i64) -> ApiResult<EntryView> {
        self.metadata
            .get_entry(id)
            .await?
            .map(EntryView::from)
            .ok_or_else(|| ApiError::NotFound(format!("cache entry {id}")))
    }

    /// Delete a committed entry and its object.
    pub async fn delete_entry(&self, id: i64) -> ApiResult<EntryView> {
        let entry = self
            .metadata
            .get_entry(id)
            .await?
            .filter(CacheEntryRow::is_committed)
            .ok_or_else(|| ApiError::NotFound(format!("cache entry {id}")))?;
        if !self.pruner.delete_entry(&entry).await? {
            return Err(ApiError::NotFound(format!("cache entry {id}")));
        }
        tracing::info!(entry_id = id, key = %entry.key, "Cache entry deleted");
        Ok(EntryView::from(entry))
    }

    /// Evict entries idle for `older_than_days`, optionally within one
    /// scope. A dry run only reports the candidates.
    pub async fn prune(
        &self,
        older_than_days: Option<u32>,
        scope: Option<&str>,
        dry_run: bool,
    ) -> ApiResult<SweepReport> {
        let older_than = match older_than_days {
            Some(0) => {
                return Err(ApiError::InvalidRequest(
                    "older_than_days must be at least 1".to_string(),
                ));
            }
            Some(days) => Duration::days(i64::from(days)),
            None => self.pruner.retention(),
        };
        self.pruner.age_sweep(older_than, scope, dry_run).await
    }

    /// Run a scheduled sweep immediately.
    pub async fn run_sweep(&self, kind: SweepKind) -> ApiResult<SweepRun> {
        self.scheduler
            .run_once(kind)
            .await?
            .ok_or_else(|| ApiError::Conflict(format!("{kind} sweep is already running")))
    }

    pub async fn stats(&self, detailed: bool) -> ApiResult<CacheStats> {
        let usage = self.metadata.entry_usage().await?;
        let mut stats = CacheStats {
            entry_count: usage.committed_count,
            total_size_bytes: usage.committed_bytes,
            pending_uploads: usage.pending_count,
            recent_activity: None,
            recent_entries: Vec::new(),
        };
        if !detailed {
            return Ok(stats);
        }

        let now = self.clock.now();
        stats.recent_activity = Some(RecentActivity {
            last_hour: self
                .metadata
                .count_accessed_since(now - Duration::hours(1))
                .await?,
            last_day: self
                .metadata
                .count_accessed_since(now - Duration::days(1))
                .await?,
            last_week: self
                .metadata
                .count_accessed_since(now - Duration::weeks(1))
                .await?,
        });
        let recent = self
            .metadata
            .query_entries(&EntryQuery {
                limit: RECENT_ENTRIES,
                ..EntryQuery::default()
            })
            .await?;
        stats.recent_entries = recent.into_iter().map(EntryView::from).collect();
        Ok(stats)
    }

    /// Substring search over keys with optional bounds.
    pub async fn search(&self, request: &SearchRequest) -> ApiResult<Vec<EntryView>> {
        if request.query.is_empty() {
            return Err(ApiError::InvalidRequest("query must not be empty".to_string()));
        }
        if let (Some(after), Some(before)) = (request.created_after, request.created_before)
            && after > before
        {
            return Err(ApiError::InvalidRequest(
                "created_after is later than created_before".to_string(),
            ));
        }
        let query = EntryQuery {
            key_like: Some(EntryQuery::contains_like(&request.query)),
            scope: request.scope.clone(),
            created_after: request.created_after,
            created_before: request.created_before,
            min_size: request.min_size.map(size_bound).transpose()?,
            max_size: request.max_size.map(size_bound).transpose()?,
            limit: clamp_limit(request.limit)?,
        };
        let rows = self.metadata.query_entries(&query).await?;
        Ok(rows.into_iter().map(EntryView::from).collect())
    }

    /// Probe the selected dependencies.
    pub async fn health(&self, include_storage: bool, include_database: bool) -> HealthReport {
        let storage = if include_storage {
            Some(ComponentHealth::from_result(
                self.storage.backend_name(),
                self.storage.health_check().await,
            ))
        } else {
            None
        };
        let database = if include_database {
            Some(ComponentHealth::from_result(
                self.metadata.driver_name(),
                self.metadata.health_check().await,
            ))
        } else {
            None
        };

        let healthy = storage.as_ref().is_none_or(ComponentHealth::is_ok)
            && database.as_ref().is_none_or(ComponentHealth::is_ok);
        HealthReport {
            status: if healthy { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            storage,
            database,
        }
    }
}

fn clamp_limit(limit: Option<i64>) -> ApiResult<i64> {
    match limit {
        None => Ok(DEFAULT_LIST_LIMIT),
        Some(n) if n < 1 => Err(ApiError::InvalidRequest(format!(
            "limit must be positive, got {n}"
        ))),
        Some(n) => Ok(n.min(MAX_LIST_LIMIT)),
    }
}

fn size_bound(size: u64) -> ApiResult<i64> {
    i64::try_from(size).map_err(|_| ApiError::InvalidRequest(format!("size {size} is too large")))
}
