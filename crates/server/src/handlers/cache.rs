//! GitHub Actions cache REST handlers (`/_apis/artifactcache`).

use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{body_stream, parse_cache_id, public_base_url, request_scope};
use crate::resolver::Resolution;
use crate::state::AppState;
use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_RANGE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use depot_core::{ByteRange, ChunkAddress, EntryKey};
use depot_metadata::models::CacheEntryRow;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;

/// Lifetime of presigned download links.
const PRESIGNED_URL_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
pub struct LookupQuery {
    /// Comma-separated keys. The first is the primary key, the rest are
    /// restore keys in order of preference.
    pub keys: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactCacheEntry {
    pub cache_key: String,
    pub scope: String,
    pub cache_version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub creation_time: OffsetDateTime,
    pub archive_location: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveCacheRequest {
    pub key: String,
    pub version: String,
    #[serde(default)]
    pub cache_size: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveCacheResponse {
    pub cache_id: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommitCacheRequest {
    #[serde(default)]
    pub size: Option<u64>,
}

/// GET /_apis/artifactcache/cache - Resolve a key with restore-key fallback.
#[tracing::instrument(skip(state, headers))]
pub async fn lookup_cache(
    State(state): State<AppState>,
    Query(query): Query<LookupQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let scope = request_scope(&state, &headers)?;
    let mut keys = query
        .keys
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty());
    let primary = keys
        .next()
        .ok_or_else(|| ApiError::InvalidRequest("keys must name at least one key".to_string()))?;
    let restore_keys: Vec<String> = keys.map(str::to_string).collect();

    let key = EntryKey::new(primary, &query.version, scope)
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    let resolution = state.resolver.resolve(&key, &restore_keys).await?;
    if let Resolution::Restored { restore_key, .. } = &resolution {
        tracing::debug!(restore_key, "Resolved through restore key");
    }

    let Some(entry) = resolution.into_entry() else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    let archive_location = archive_location(&state, &headers, &entry).await?;
    Ok(Json(ArtifactCacheEntry {
        cache_key: entry.key,
        scope: entry.scope,
        cache_version: entry.version,
        creation_time: entry.created_at,
        archive_location,
    })
    .into_response())
}

/// POST /_apis/artifactcache/caches - Reserve a key for upload.
#[tracing::instrument(skip(state, headers, payload))]
pub async fn reserve_cache(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ReserveCacheRequest>, JsonRejection>,
) -> ApiResult<Json<ReserveCacheResponse>> {
    let Json(request) = payload.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let scope = request_scope(&state, &headers)?;
    let key = EntryKey::new(request.key, request.version, scope)
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

    let reservation = state.coordinator.reserve(&key, request.cache_size).await?;
    Ok(Json(ReserveCacheResponse {
        cache_id: reservation.entry_id,
    }))
}

/// PATCH /_apis/artifactcache/caches/{cacheId} - Upload one byte range.
#[tracing::instrument(skip(state, headers, body))]
pub async fn upload_range(
    State(state): State<AppState>,
    Path(cache_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<StatusCode> {
    let cache_id = parse_cache_id(&cache_id)?;
    let range = headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::InvalidRequest("Content-Range header is required".to_string()))
        .and_then(parse_content_range)?;

    let upload_id = state.coordinator.upload_for_entry(cache_id).await?;
    state
        .coordinator
        .write_chunk(
            upload_id,
            ChunkAddress::at_offset(range.offset),
            body_stream(body),
            Some(range.len),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /_apis/artifactcache/caches/{cacheId} - Commit the upload.
#[tracing::instrument(skip(state, body))]
pub async fn commit_cache(
    State(state): State<AppState>,
    Path(cache_id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let cache_id = parse_cache_id(&cache_id)?;
    let request: CommitCacheRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CommitCacheRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid commit body: {e}")))?
    };

    let upload_id = state.coordinator.upload_for_entry(cache_id).await?;
    let outcome = state.coordinator.commit(upload_id, request.size).await?;
    if outcome.already_committed {
        tracing::debug!(entry_id = outcome.entry_id, "Commit repeated for committed upload");
    }
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /_apis/artifactcache/caches/{cacheId} - Delete an entry.
#[tracing::instrument(skip(state))]
pub async fn delete_cache(
    State(state): State<AppState>,
    Path(cache_id): Path<String>,
) -> ApiResult<StatusCode> {
    let cache_id = parse_cache_id(&cache_id)?;
    state.admin.delete_entry(cache_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Parse `bytes start-end/total` (total may be `*`).
fn parse_content_range(value: &str) -> ApiResult<ByteRange> {
    let invalid = || ApiError::InvalidRequest(format!("invalid Content-Range '{value}'"));
    let spec = value.trim().strip_prefix("bytes ").ok_or_else(invalid)?;
    let (span, _total) = spec.split_once('/').ok_or_else(invalid)?;
    let (start, end) = span.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start.trim().parse().map_err(|_| invalid())?;
    let end: u64 = end.trim().parse().map_err(|_| invalid())?;
    ByteRange::from_inclusive(start, end).map_err(|_| invalid())
}

async fn archive_location(
    state: &AppState,
    headers: &HeaderMap,
    entry: &CacheEntryRow,
) -> ApiResult<String> {
    if state.config.server.enable_direct_downloads
        && let Some(url) = state
            .storage
            .presigned_url(entry.id, PRESIGNED_URL_TTL)
            .await?
    {
        return Ok(url);
    }
    Ok(format!(
        "{}/download/{}",
        public_base_url(state, headers),
        entry.id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_is_inclusive() {
        let range = parse_content_range("bytes 0-1023/*").unwrap();
        assert_eq!((range.offset, range.len), (0, 1024));

        let range = parse_content_range("bytes 1024-1024/4096").unwrap();
        assert_eq!((range.offset, range.len), (1024, 1));
    }

    #[test]
    fn malformed_content_range_is_rejected() {
        for value in ["0-10/*", "bytes 10-5/*", "bytes a-b/*", "bytes 0-10", "items 0-1/*"] {
            assert!(parse_content_range(value).is_err(), "{value}");
        }
    }
}
