//! Integration tests for pruning, stale-upload reaping and the sweep scheduler.

mod common;

use axum::http::StatusCode;
use common::{START, TestServer, empty_request, json_request, seeded_bytes};
use depot_core::CronSchedule;
use depot_metadata::models::{JobState, PruneJobRow};
use depot_metadata::repos::PruneJobRepo;
use depot_server::scheduler::SweepKind;
use serde_json::json;
use std::time::Duration as StdDuration;
use time::Duration;

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if condition().await {
            return;
        }
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn age_prune_respects_retention_horizon() {
    let server = TestServer::new().await;
    let old = server.store("old-entry", "v1", seeded_bytes(1, 100)).await;
    server.clock.advance(Duration::days(2));
    let recent = server.store("recent-entry", "v1", seeded_bytes(2, 100)).await;
    // old-entry was last touched 91 days ago, recent-entry 89 days ago.
    server.clock.advance(Duration::days(89));

    let (status, report) = server
        .json(json_request("POST", "/v1/admin/prune", json!({ "dry_run": true })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["dry_run"], true);
    assert_eq!(report["deleted"], 0);
    assert_eq!(report["bytes_freed"], 100);
    let candidates = report["candidates"].as_array().unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0]["id"], old);
    // Nothing changed.
    assert_eq!(server.download(old).await.0, StatusCode::OK);

    let (status, report) = server
        .json(json_request("POST", "/v1/admin/prune", json!({})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["deleted"], 1);
    assert_eq!(server.download(old).await.0, StatusCode::NOT_FOUND);
    assert_eq!(server.download(recent).await.0, StatusCode::OK);
}

#[tokio::test]
async fn lookups_keep_entries_alive() {
    let server = TestServer::new().await;
    let id = server.store("busy", "v1", seeded_bytes(3, 10)).await;

    server.clock.advance(Duration::days(60));
    assert!(server.lookup("busy", "v1").await.is_some());
    server.clock.advance(Duration::days(60));

    let report = server.state.pruner.run_cache_sweep().await.unwrap();
    assert_eq!(report.age.deleted, 0);
    assert_eq!(server.download(id).await.0, StatusCode::OK);
}

#[tokio::test]
async fn prune_can_target_one_scope_and_custom_age() {
    let server = TestServer::new().await;
    server.store("main-entry", "v1", seeded_bytes(4, 10)).await;
    server.clock.advance(Duration::days(10));

    let report = server
        .state
        .admin
        .prune(Some(7), Some("elsewhere"), false)
        .await
        .unwrap();
    assert_eq!(report.deleted, 0);

    let report = server
        .state
        .admin
        .prune(Some(7), Some("default"), false)
        .await
        .unwrap();
    assert_eq!(report.deleted, 1);
    assert!(server.lookup("main-entry", "v1").await.is_none());

    let (status, _) = server
        .json(json_request(
            "POST",
            "/v1/admin/prune",
            json!({ "older_than_days": 0 }),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn capacity_sweep_evicts_least_recently_used() {
    let server = TestServer::with_config(|config| {
        config.cleanup.max_cache_size = "2500B".to_string();
    })
    .await;
    let first = server.store("cap-1", "v1", seeded_bytes(5, 1000)).await;
    server.clock.advance(Duration::minutes(1));
    let second = server.store("cap-2", "v1", seeded_bytes(6, 1000)).await;
    server.clock.advance(Duration::minutes(1));
    let third = server.store("cap-3", "v1", seeded_bytes(7, 1000)).await;
    server.clock.advance(Duration::minutes(1));
    // Reading cap-1 makes cap-2 the least recently used.
    assert!(server.lookup("cap-1", "v1").await.is_some());

    let report = server.state.pruner.capacity_sweep().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.bytes_freed, 1000);

    assert_eq!(server.download(first).await.0, StatusCode::OK);
    assert_eq!(server.download(second).await.0, StatusCode::NOT_FOUND);
    assert_eq!(server.download(third).await.0, StatusCode::OK);

    let stats = server.state.admin.stats(false).await.unwrap();
    assert_eq!(stats.entry_count, 2);
    assert_eq!(stats.total_size_bytes, 2000);
}

#[tokio::test]
async fn stale_uploads_are_reaped_and_key_freed() {
    let server = TestServer::new().await;
    let abandoned = server.reserve("half-done", "v1").await;
    server.patch_range(abandoned, 0, seeded_bytes(8, 64)).await;

    // Within the TTL nothing is reaped.
    server.clock.advance(Duration::minutes(30));
    let report = server.state.pruner.stale_upload_sweep().await.unwrap();
    assert_eq!(report.deleted, 0);

    server.clock.advance(Duration::hours(2));
    let report = server.state.pruner.stale_upload_sweep().await.unwrap();
    assert_eq!(report.deleted, 1);

    assert_eq!(
        server.patch_range(abandoned, 64, seeded_bytes(9, 64)).await,
        StatusCode::NOT_FOUND
    );
    let fresh = server.reserve("half-done", "v1").await;
    assert_ne!(fresh, abandoned);

    let stats = server.state.admin.stats(false).await.unwrap();
    assert_eq!(stats.pending_uploads, 1);
}

#[tokio::test]
async fn scheduled_upload_sweep_runs_when_clock_reaches_tick() {
    let server = TestServer::new().await;
    server.reserve("never-finished", "v1").await;

    let handle = server.state.scheduler.clone().spawn(
        SweepKind::Uploads,
        CronSchedule::parse("*/10 * * * *").unwrap(),
    );

    // Keep moving time forward until a tick fires the sweep.
    let admin = server.state.admin.clone();
    let clock = server.clock.clone();
    wait_for(|| {
        clock.advance(Duration::minutes(30));
        let admin = admin.clone();
        async move { admin.stats(false).await.unwrap().pending_uploads == 0 }
    })
    .await;
    handle.abort();

    // The triple is free again.
    server.reserve("never-finished", "v1").await;
}

#[tokio::test]
async fn finished_sweeps_release_their_kind() {
    let server = TestServer::new().await;
    let scheduler = server.state.scheduler.clone();

    let first = scheduler
        .run_once(SweepKind::Uploads)
        .await
        .unwrap()
        .expect("first run");
    let job = server
        .state
        .metadata
        .get_prune_job(first.job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.job_state(), JobState::Finished);
    assert!(job.finished_at.is_some());

    let second = scheduler
        .run_once(SweepKind::Uploads)
        .await
        .unwrap()
        .expect("second run");
    assert_ne!(second.job_id, first.job_id);

    for _ in 0..2 {
        let response = server
            .send(empty_request("POST", "/v1/admin/sweeps/uploads"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = server
        .send(empty_request("POST", "/v1/admin/sweeps/cache"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn scheduled_sweep_keeps_firing_on_later_ticks() {
    let server = TestServer::new().await;
    let handle = server.state.scheduler.clone().spawn(
        SweepKind::Uploads,
        CronSchedule::parse("*/10 * * * *").unwrap(),
    );

    let metadata = server.state.metadata.clone();
    let clock = server.clock.clone();
    wait_for(|| {
        clock.advance(Duration::minutes(10));
        let metadata = metadata.clone();
        async move {
            let jobs = metadata.list_recent_prune_jobs(10).await.unwrap();
            jobs.iter()
                .filter(|job| job.job_state() == JobState::Finished)
                .count()
                >= 2
        }
    })
    .await;
    handle.abort();
}

#[tokio::test]
async fn only_one_sweep_of_a_kind_runs_at_a_time() {
    let server = TestServer::new().await;
    let foreign = PruneJobRow::running(SweepKind::Cache.job_type(), START);
    server.state.metadata.start_prune_job(&foreign).await.unwrap();

    assert!(
        server
            .state
            .scheduler
            .run_once(SweepKind::Cache)
            .await
            .unwrap()
            .is_none()
    );
    let response = server
        .send(empty_request("POST", "/v1/admin/sweeps/cache"))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // The other kind is unaffected.
    let (status, run) = server
        .json(empty_request("POST", "/v1/admin/sweeps/uploads"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["kind"], "uploads");

    // A job older than the lease is presumed dead.
    server.clock.advance(Duration::hours(2));
    assert_eq!(server.state.scheduler.recover_stale_jobs().await.unwrap(), 1);
    let run = server
        .state
        .scheduler
        .run_once(SweepKind::Cache)
        .await
        .unwrap()
        .expect("sweep runs after recovery");
    assert_eq!(run.kind, SweepKind::Cache);
    assert!(run.stats.get("age").is_some());
}

#[tokio::test]
async fn unknown_sweep_kind_is_bad_request() {
    let server = TestServer::new().await;
    let response = server
        .send(empty_request("POST", "/v1/admin/sweeps/everything"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
