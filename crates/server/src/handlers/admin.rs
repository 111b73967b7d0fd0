//! Admin API handlers (`/v1/admin`).

use crate::admin::{CacheStats, EntryView, SearchRequest};
use crate::error::{ApiError, ApiResult};
use crate::pruning::SweepReport;
use crate::scheduler::{SweepKind, SweepRun};
use crate::state::AppState;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Deserialize)]
pub struct ListEntriesParams {
    /// Key pattern with `*` wildcards.
    #[serde(default)]
    pub key_pattern: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EntryListResponse {
    pub entries: Vec<EntryView>,
    pub count: usize,
}

impl From<Vec<EntryView>> for EntryListResponse {
    fn from(entries: Vec<EntryView>) -> Self {
        Self {
            count: entries.len(),
            entries,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PruneRequest {
    #[serde(default)]
    pub older_than_days: Option<u32>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    #[serde(default)]
    pub detailed: bool,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub query: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_after: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_before: Option<OffsetDateTime>,
    #[serde(default)]
    pub min_size: Option<u64>,
    #[serde(default)]
    pub max_size: Option<u64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// GET /v1/admin/entries - List committed entries.
pub async fn list_entries(
    State(state): State<AppState>,
    Query(params): Query<ListEntriesParams>,
) -> ApiResult<Json<EntryListResponse>> {
    let entries = state
        .admin
        .list_entries(params.key_pattern.as_deref(), params.limit)
        .await?;
    Ok(Json(entries.into()))
}

/// GET /v1/admin/entries/{id} - Get one entry.
pub async fn get_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EntryView>> {
    let id = parse_entry_id(&id)?;
    Ok(Json(state.admin.get_entry(id).await?))
}

/// DELETE /v1/admin/entries/{id} - Delete an entry and its object.
#[tracing::instrument(skip(state))]
pub async fn delete_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EntryView>> {
    let id = parse_entry_id(&id)?;
    Ok(Json(state.admin.delete_entry(id).await?))
}

/// POST /v1/admin/prune - Evict entries by age, or preview with `dry_run`.
#[tracing::instrument(skip(state, payload))]
pub async fn prune(
    State(state): State<AppState>,
    payload: Result<Json<PruneRequest>, JsonRejection>,
) -> ApiResult<Json<SweepReport>> {
    let Json(request) = payload.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let report = state
        .admin
        .prune(
            request.older_than_days,
            request.scope.as_deref(),
            request.dry_run,
        )
        .await?;
    Ok(Json(report))
}

/// GET /v1/admin/stats - Aggregate statistics.
pub async fn stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> ApiResult<Json<CacheStats>> {
    Ok(Json(state.admin.stats(params.detailed).await?))
}

/// GET /v1/admin/search - Search keys by substring.
pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<EntryListResponse>> {
    let request = SearchRequest {
        query: params.query,
        scope: params.scope,
        created_after: params.created_after,
        created_before: params.created_before,
        min_size: params.min_size,
        max_size: params.max_size,
        limit: params.limit,
    };
    Ok(Json(state.admin.search(&request).await?.into()))
}

/// POST /v1/admin/sweeps/{kind} - Run a scheduled sweep now.
#[tracing::instrument(skip(state))]
pub async fn run_sweep(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<SweepRun>> {
    let kind: SweepKind = kind.parse()?;
    Ok(Json(state.admin.run_sweep(kind).await?))
}

fn parse_entry_id(raw: &str) -> ApiResult<i64> {
    raw.parse::<i64>()
        .map_err(|_| ApiError::InvalidRequest(format!("invalid entry id '{raw}'")))
}
