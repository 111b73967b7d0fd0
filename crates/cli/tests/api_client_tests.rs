#[path = "../src/api_client.rs"]
#[allow(dead_code)] // Some methods are used by the binary but not by tests
mod api_client;

use api_client::{ApiClient, PruneRequest, SearchQuery};
use httpmock::Method::{DELETE, GET, POST};
use httpmock::MockServer;
use serde_json::json;
use std::net::TcpListener;

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

fn entry_json(id: i64, key: &str) -> serde_json::Value {
    json!({
        "id": id,
        "key": key,
        "version": "v1",
        "scope": "refs/heads/main",
        "state": "committed",
        "size_bytes": 2048,
        "created_at": "2026-01-01T00:00:00Z",
        "updated_at": "2026-01-01T00:00:00Z",
        "accessed_at": "2026-01-02T00:00:00Z"
    })
}

#[tokio::test]
async fn entry_commands_send_token_and_parse_responses() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start();
    let token = "secret-token";

    let list = server.mock(|when, then| {
        when.method(GET)
            .path("/v1/admin/entries")
            .query_param("key_pattern", "npm-*")
            .query_param("limit", "5")
            .header("authorization", format!("Bearer {token}"));
        then.status(200).json_body(json!({
            "entries": [entry_json(1, "npm-linux"), entry_json(2, "npm-macos")],
            "count": 2
        }));
    });
    let get = server.mock(|when, then| {
        when.method(GET)
            .path("/v1/admin/entries/1")
            .header("authorization", format!("Bearer {token}"));
        then.status(200).json_body(entry_json(1, "npm-linux"));
    });
    let delete = server.mock(|when, then| {
        when.method(DELETE)
            .path("/v1/admin/entries/2")
            .header("authorization", format!("Bearer {token}"));
        then.status(200).json_body(entry_json(2, "npm-macos"));
    });

    let client = ApiClient::new(&server.base_url(), Some(token)).unwrap();

    let listed = client.list_entries(Some("npm-*"), Some(5)).await.unwrap();
    assert_eq!(listed.count, 2);
    assert_eq!(listed.entries[1].key, "npm-macos");

    let entry = client.get_entry(1).await.unwrap();
    assert_eq!(entry.size_bytes, 2048);
    assert_eq!(entry.scope, "refs/heads/main");

    let deleted = client.delete_entry(2).await.unwrap();
    assert_eq!(deleted.id, 2);

    list.assert();
    get.assert();
    delete.assert();
}

#[tokio::test]
async fn prune_stats_search_and_sweep() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start();

    let prune = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/admin/prune")
            .json_body(json!({ "older_than_days": 30, "dry_run": true }));
        then.status(200).json_body(json!({
            "scanned": 1,
            "deleted": 0,
            "bytes_freed": 2048,
            "errors": 0,
            "dry_run": true,
            "candidates": [{
                "id": 7,
                "key": "old",
                "version": "v1",
                "scope": "main",
                "size_bytes": 2048,
                "accessed_at": "2025-10-01T00:00:00Z"
            }]
        }));
    });
    let stats = server.mock(|when, then| {
        when.method(GET)
            .path("/v1/admin/stats")
            .query_param("detailed", "true");
        then.status(200).json_body(json!({
            "entry_count": 3,
            "total_size_bytes": 4096,
            "pending_uploads": 1,
            "recent_activity": { "last_hour": 1, "last_day": 2, "last_week": 3 }
        }));
    });
    let search = server.mock(|when, then| {
        when.method(GET)
            .path("/v1/admin/search")
            .query_param("query", "linux")
            .query_param("created_after", "2026-01-01T00:00:00Z");
        then.status(200).json_body(json!({
            "entries": [entry_json(4, "build-linux")],
            "count": 1
        }));
    });
    let sweep = server.mock(|when, then| {
        when.method(POST).path("/v1/admin/sweeps/uploads");
        then.status(200).json_body(json!({
            "job_id": "00000000-0000-0000-0000-000000000003",
            "kind": "uploads",
            "stats": { "scanned": 2, "deleted": 2 }
        }));
    });

    let client = ApiClient::new(&server.base_url(), None).unwrap();

    let report = client
        .prune(&PruneRequest {
            older_than_days: Some(30),
            scope: None,
            dry_run: true,
        })
        .await
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.candidates.len(), 1);
    assert_eq!(report.candidates[0].id, 7);

    let summary = client.stats(true).await.unwrap();
    assert_eq!(summary.entry_count, 3);
    assert!(summary.recent_entries.is_empty());
    assert_eq!(summary.recent_activity.unwrap().last_week, 3);

    let found = client
        .search(&SearchQuery {
            query: "linux".to_string(),
            created_after: Some("2026-01-01T00:00:00Z".to_string()),
            ..SearchQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(found.entries[0].key, "build-linux");

    let run = client.run_sweep("uploads").await.unwrap();
    assert_eq!(run.kind, "uploads");
    assert_eq!(run.stats["deleted"], 2);

    prune.assert();
    stats.assert();
    search.assert();
    sweep.assert();
}

#[tokio::test]
async fn errors_surface_server_message() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/v1/admin/entries/99");
        then.status(404).json_body(json!({
            "code": "not_found",
            "message": "not found: cache entry 99"
        }));
    });
    server.mock(|when, then| {
        when.method(POST).path("/v1/admin/sweeps/cache");
        then.status(409).body("plain text conflict");
    });

    let client = ApiClient::new(&server.base_url(), None).unwrap();

    let err = client.get_entry(99).await.unwrap_err().to_string();
    assert!(err.contains("404"), "{err}");
    assert!(err.contains("cache entry 99"), "{err}");
    assert!(err.contains("not_found"), "{err}");

    let err = client.run_sweep("cache").await.unwrap_err().to_string();
    assert!(err.contains("plain text conflict"), "{err}");
}

#[tokio::test]
async fn degraded_health_still_returns_report() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/v1/health");
        then.status(503).json_body(json!({
            "status": "degraded",
            "version": "0.1.0",
            "storage": { "status": "error", "backend": "s3", "error": "timeout" },
            "database": { "status": "ok", "backend": "postgres" }
        }));
    });

    let client = ApiClient::new(&server.base_url(), None).unwrap();
    let report = client.health().await.unwrap();
    assert!(!report.is_healthy());
    assert_eq!(report.storage.unwrap().error.as_deref(), Some("timeout"));
    assert_eq!(report.database.unwrap().backend, "postgres");
}

#[test]
fn invalid_server_url_is_rejected() {
    assert!(ApiClient::new("not a url", None).is_err());
}
