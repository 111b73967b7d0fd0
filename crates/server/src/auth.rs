//! Request id and bearer token middleware.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use tracing::Instrument;
use uuid::Uuid;

/// Response header carrying the server-generated request id. Block-blob
/// clients fail a request whose response lacks it.
pub const REQUEST_ID_HEADER: &str = "x-ms-request-id";

/// Client-supplied correlation id, echoed back when present.
pub const CLIENT_REQUEST_ID_HEADER: &str = "x-ms-client-request-id";

/// Maximum length for echoed client ids.
/// Longer values are truncated to keep logs bounded.
const MAX_CLIENT_ID_LEN: usize = 128;

/// Routes reachable without a token.
const PUBLIC_PATHS: &[&str] = &["/v1/health", "/metrics"];

/// Request id for correlation between logs and clients.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Keep printable ASCII only and cap the length.
fn sanitize_client_id(value: &str) -> Option<String> {
    let sanitized: String = value
        .chars()
        .take(MAX_CLIENT_ID_LEN)
        .filter(|c| c.is_ascii_graphic())
        .collect();
    (!sanitized.is_empty()).then_some(sanitized)
}

/// Tag every request with an id, run it inside a span carrying that id, and
/// return the id in the `x-ms-request-id` header.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = RequestId::new();
    let client_id = req
        .headers()
        .get(CLIENT_REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(sanitize_client_id);
    req.extensions_mut().insert(request_id.clone());

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        client_request_id = client_id.as_deref().unwrap_or("")
    );
    let mut response = next.run(req).instrument(span).await;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    if let Some(client_id) = client_id
        && let Ok(value) = HeaderValue::from_str(&client_id)
    {
        headers.insert(CLIENT_REQUEST_ID_HEADER, value);
    }
    response
}

/// Extract bearer token from Authorization header.
/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(&v[7..])
            } else {
                None
            }
        })
}

/// SHA256 hex of a token, the form kept in configuration.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Reject requests without the configured bearer token.
///
/// Does nothing when auth is disabled. Health and metrics stay public.
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth = &state.config.auth;
    if !auth.enabled || PUBLIC_PATHS.contains(&req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let expected = auth
        .token_hash
        .as_deref()
        .ok_or_else(|| ApiError::Internal("auth enabled without a token hash".to_string()))?;
    let token = extract_bearer_token(&req)
        .ok_or_else(|| ApiError::Unauthorized("bearer token required".to_string()))?;
    if !hash_token(token).eq_ignore_ascii_case(expected) {
        tracing::debug!(path = %req.uri().path(), "Rejected request with invalid token");
        return Err(ApiError::Unauthorized("invalid token".to_string()));
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_hash_matches_sha256sum_output() {
        // echo -n "secret" | sha256sum
        assert_eq!(
            hash_token("secret"),
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
    }

    #[test]
    fn client_ids_are_sanitized() {
        assert_eq!(sanitize_client_id("abc-123").as_deref(), Some("abc-123"));
        assert_eq!(sanitize_client_id("a\nb").as_deref(), Some("ab"));
        assert_eq!(sanitize_client_id("\u{7f}"), None);
        assert_eq!(sanitize_client_id(&"x".repeat(500)).unwrap().len(), MAX_CLIENT_ID_LEN);
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let req = Request::builder()
            .header(AUTHORIZATION, "BEARER tok")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&req), Some("tok"));

        let basic = Request::builder()
            .header(AUTHORIZATION, "Basic dXNlcg==")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&basic), None);
    }
}
