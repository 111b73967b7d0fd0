//! Shared handler helpers.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::body::Body;
use axum::http::HeaderMap;
use axum::http::header::HOST;
use depot_storage::{ByteStream, StorageError};
use futures::StreamExt;

/// Header selecting the cache scope of a request.
pub const SCOPE_HEADER: &str = "x-cache-scope";

/// Parse a `{cacheId}` path segment.
pub fn parse_cache_id(raw: &str) -> ApiResult<i64> {
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ApiError::InvalidRequest(format!(
            "invalid cache id '{raw}': expected a positive integer"
        ))),
    }
}

/// Scope from the `x-cache-scope` header, else the configured default.
pub fn request_scope(state: &AppState, headers: &HeaderMap) -> ApiResult<String> {
    match headers.get(SCOPE_HEADER) {
        None => Ok(state.config.server.default_scope.clone()),
        Some(value) => {
            let scope = value
                .to_str()
                .map_err(|_| ApiError::InvalidRequest(format!("{SCOPE_HEADER} must be ASCII")))?
                .trim();
            if scope.is_empty() {
                Ok(state.config.server.default_scope.clone())
            } else {
                Ok(scope.to_string())
            }
        }
    }
}

/// Base URL clients should use to reach this server.
pub fn public_base_url(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(base) = &state.config.server.public_base_url {
        return base.trim_end_matches('/').to_string();
    }
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(&state.config.server.bind);
    format!("http://{host}")
}

/// Adapt a request body into the storage byte stream.
pub fn body_stream(body: Body) -> ByteStream {
    Box::pin(
        body.into_data_stream()
            .map(|chunk| chunk.map_err(|e| StorageError::Body(e.to_string()))),
    )
}
