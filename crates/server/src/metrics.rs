//! Prometheus metrics for the depot server.
//!
//! The `/metrics` endpoint is unauthenticated so Prometheus can scrape it.
//! Metrics carry no cache keys or scopes, only aggregate counts, but the
//! endpoint should still be network-restricted to the scraper.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload metrics
pub static RESERVATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "depot_reservations_total",
            "Reservation attempts by outcome (created, reused, conflict)",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static CHUNKS_WRITTEN: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_chunks_written_total", "Total chunk writes accepted")
        .expect("metric creation failed")
});

pub static BYTES_WRITTEN: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_bytes_written_total",
        "Total bytes accepted by chunk writes",
    )
    .expect("metric creation failed")
});

pub static COMMITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_commits_total", "Uploads finalized into entries")
        .expect("metric creation failed")
});

pub static COMMIT_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("depot_commit_failures_total", "Failed commits by reason"),
        &["reason"],
    )
    .expect("metric creation failed")
});

pub static COMMIT_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "depot_commit_duration_seconds",
            "Time spent finalizing an upload",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

// Lookup metrics
pub static LOOKUPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "depot_lookups_total",
            "Lookups by result (exact, restore, miss)",
        ),
        &["result"],
    )
    .expect("metric creation failed")
});

// Sweep metrics
pub static ENTRIES_PRUNED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("depot_entries_pruned_total", "Entries evicted by sweep"),
        &["sweep"],
    )
    .expect("metric creation failed")
});

pub static BYTES_FREED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_bytes_freed_total",
        "Committed bytes released by evictions",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_REAPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_uploads_reaped_total",
        "Stale upload sessions reclaimed",
    )
    .expect("metric creation failed")
});

pub static SWEEP_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "depot_sweep_errors_total",
            "Per-item failures skipped during sweeps",
        ),
        &["sweep"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn Collector>> = vec![
            Box::new(RESERVATIONS.clone()),
            Box::new(CHUNKS_WRITTEN.clone()),
            Box::new(BYTES_WRITTEN.clone()),
            Box::new(COMMITS.clone()),
            Box::new(COMMIT_FAILURES.clone()),
            Box::new(COMMIT_DURATION.clone()),
            Box::new(LOOKUPS.clone()),
            Box::new(ENTRIES_PRUNED.clone()),
            Box::new(BYTES_FREED.clone()),
            Box::new(UPLOADS_REAPED.clone()),
            Box::new(SWEEP_ERRORS.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Record a failed commit by reason.
pub fn record_commit_failure(reason: &str) {
    COMMIT_FAILURES.with_label_values(&[reason]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        register_metrics();
        register_metrics();
        LOOKUPS.with_label_values(&["miss"]).inc();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "depot_lookups_total"));
    }
}
