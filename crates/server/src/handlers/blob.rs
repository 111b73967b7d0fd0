//! Block-blob style upload and download handlers.

use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{body_stream, parse_cache_id};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use depot_core::{BlockId, ChunkAddress};
use futures::StreamExt;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct BlockQuery {
    /// Base64 block id. Absent for single-shot uploads.
    #[serde(default)]
    pub blockid: Option<String>,
    /// `blocklist` marks the completion probe.
    #[serde(default)]
    pub comp: Option<String>,
}

/// PUT /upload/{cacheId} - Store one block, or acknowledge a block list.
///
/// `comp=blocklist` writes nothing and answers 201. Otherwise the body is
/// the block addressed by `blockid`, or the whole object when the id is
/// absent.
#[tracing::instrument(skip(state, headers, body), fields(user_agent))]
pub async fn put_block(
    State(state): State<AppState>,
    Path(cache_id): Path<String>,
    Query(query): Query<BlockQuery>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<StatusCode> {
    let cache_id = parse_cache_id(&cache_id)?;
    let upload_id = state.coordinator.upload_for_entry(cache_id).await?;

    if query.comp.as_deref() == Some("blocklist") {
        tracing::debug!(upload_id = %upload_id, "Block list received");
        return Ok(StatusCode::CREATED);
    }

    let user_agent = headers.get(USER_AGENT).and_then(|v| v.to_str().ok());
    tracing::Span::current().record("user_agent", user_agent.unwrap_or(""));

    let block_id = query.blockid.filter(|id| !id.is_empty()).map(BlockId::new);
    let address = ChunkAddress::resolve(block_id.as_ref(), user_agent)?;
    state
        .coordinator
        .write_chunk(upload_id, address, body_stream(body), None)
        .await?;
    Ok(StatusCode::CREATED)
}

/// GET /download/{cacheId} - Stream a committed object.
#[tracing::instrument(skip(state))]
pub async fn download(
    State(state): State<AppState>,
    Path(cache_id): Path<String>,
) -> ApiResult<Response> {
    let cache_id = parse_cache_id(&cache_id)?;
    let entry = state
        .metadata
        .get_entry(cache_id)
        .await?
        .filter(|entry| entry.is_committed())
        .ok_or_else(|| ApiError::NotFound(format!("cache {cache_id} is not committed")))?;

    let stream = state.storage.read(entry.id).await?;
    let body_stream = stream.map(|result| result.map_err(|e| std::io::Error::other(e.to_string())));

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, "application/octet-stream".to_string()),
            (CONTENT_LENGTH, entry.size().to_string()),
        ],
        Body::from_stream(body_stream),
    )
        .into_response())
}
