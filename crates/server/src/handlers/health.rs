//! Health check handler.

use crate::admin::HealthReport;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    #[serde(default = "default_true")]
    pub include_storage: bool,
    #[serde(default = "default_true")]
    pub include_database: bool,
}

fn default_true() -> bool {
    true
}

/// GET /v1/health - Health check, unauthenticated for load balancer probes.
pub async fn health_check(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> (StatusCode, Json<HealthReport>) {
    let report = state
        .admin
        .health(query.include_storage, query.include_database)
        .await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
