//! Server test utilities.

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use bytes::Bytes;
use depot_core::ManualClock;
use depot_core::config::{AppConfig, MetadataConfig, StorageConfig};
use depot_metadata::{MetadataStore, SqliteStore};
use depot_server::{AppState, create_router};
use depot_storage::{ArtifactStore, FilesystemBackend};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;
use time::macros::datetime;
use tower::ServiceExt;

/// Instant every test server starts at.
#[allow(dead_code)]
pub const START: OffsetDateTime = datetime!(2026-03-01 12:00:00 UTC);

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        Self::build(modifier, |storage| storage).await
    }

    /// Create a test server whose storage is wrapped by `wrap`.
    pub async fn with_storage<W>(wrap: W) -> Self
    where
        W: FnOnce(Arc<dyn ArtifactStore>) -> Arc<dyn ArtifactStore>,
    {
        Self::build(|_| {}, wrap).await
    }

    async fn build<F, W>(modifier: F, wrap: W) -> Self
    where
        F: FnOnce(&mut AppConfig),
        W: FnOnce(Arc<dyn ArtifactStore>) -> Arc<dyn ArtifactStore>,
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let storage_path = temp_dir.path().join("storage");
        let storage: Arc<dyn ArtifactStore> = Arc::new(
            FilesystemBackend::new(&storage_path)
                .await
                .expect("Failed to create storage backend"),
        );

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig::for_testing();
        config.storage = StorageConfig::Filesystem { path: storage_path };
        config.metadata = MetadataConfig::Sqlite {
            path: db_path,
            query_timeout_secs: None,
        };
        modifier(&mut config);

        let clock = Arc::new(ManualClock::new(START));
        let state = AppState::with_clock(config, wrap(storage), metadata, clock.clone())
            .expect("Failed to build state");
        let router = create_router(state.clone());

        Self {
            router,
            state,
            clock,
            _temp_dir: temp_dir,
        }
    }

    /// Send a request through the router.
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Send a request and decode the JSON body, `Null` when empty.
    pub async fn json(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.send(request).await;
        let status = response.status();
        let body = body_bytes(response).await;
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// Reserve `key` at `version` and return the cache id.
    pub async fn reserve(&self, key: &str, version: &str) -> i64 {
        let (status, body) = self
            .json(json_request(
                "POST",
                "/_apis/artifactcache/caches",
                serde_json::json!({ "key": key, "version": version }),
            ))
            .await;
        assert_eq!(status, StatusCode::OK, "reserve {key}: {body}");
        body["cacheId"].as_i64().expect("cacheId in reserve response")
    }

    /// Upload `data` as a single range at offset 0.
    pub async fn patch_range(&self, cache_id: i64, offset: u64, data: Bytes) -> StatusCode {
        let end = offset + data.len() as u64 - 1;
        let request = Request::builder()
            .method("PATCH")
            .uri(format!("/_apis/artifactcache/caches/{cache_id}"))
            .header("Content-Range", format!("bytes {offset}-{end}/*"))
            .header("Content-Type", "application/octet-stream")
            .body(Body::from(data))
            .unwrap();
        self.send(request).await.status()
    }

    /// Commit an upload, optionally declaring its size.
    pub async fn commit(&self, cache_id: i64, size: Option<u64>) -> StatusCode {
        let body = match size {
            Some(size) => serde_json::json!({ "size": size }),
            None => serde_json::json!({}),
        };
        let (status, _) = self
            .json(json_request(
                "POST",
                &format!("/_apis/artifactcache/caches/{cache_id}"),
                body,
            ))
            .await;
        status
    }

    /// Reserve, upload and commit `data` under `key` in one go.
    pub async fn store(&self, key: &str, version: &str, data: Bytes) -> i64 {
        let cache_id = self.reserve(key, version).await;
        let len = data.len() as u64;
        assert_eq!(self.patch_range(cache_id, 0, data).await, StatusCode::NO_CONTENT);
        assert_eq!(self.commit(cache_id, Some(len)).await, StatusCode::NO_CONTENT);
        cache_id
    }

    /// Look up `keys` and return the hit, or `None` on a 204 miss.
    pub async fn lookup(&self, keys: &str, version: &str) -> Option<Value> {
        let request = Request::builder()
            .uri(format!(
                "/_apis/artifactcache/cache?keys={keys}&version={version}"
            ))
            .header("Host", "cache.test")
            .body(Body::empty())
            .unwrap();
        let (status, body) = self.json(request).await;
        match status {
            StatusCode::OK => Some(body),
            StatusCode::NO_CONTENT => None,
            other => panic!("unexpected lookup status {other}: {body}"),
        }
    }

    /// Download a committed object.
    pub async fn download(&self, cache_id: i64) -> (StatusCode, Bytes) {
        let request = Request::builder()
            .uri(format!("/download/{cache_id}"))
            .body(Body::empty())
            .unwrap();
        let response = self.send(request).await;
        let status = response.status();
        (status, body_bytes(response).await)
    }
}

/// Build a JSON request.
#[allow(dead_code)]
pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

/// Build a bodyless request.
#[allow(dead_code)]
pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

/// Drain a response body.
#[allow(dead_code)]
pub async fn body_bytes(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}
