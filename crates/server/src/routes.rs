//! Route configuration.

use crate::auth::{auth_middleware, request_id_middleware};
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post, put};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    // Chunk bodies are bounded by the coordinator, not by axum's default limit.
    let cache_routes = Router::new()
        .route("/_apis/artifactcache/cache", get(handlers::lookup_cache))
        .route("/_apis/artifactcache/caches", post(handlers::reserve_cache))
        .route(
            "/_apis/artifactcache/caches/{cache_id}",
            post(handlers::commit_cache)
                .patch(handlers::upload_range)
                .delete(handlers::delete_cache),
        )
        .route("/upload/{cache_id}", put(handlers::put_block))
        .route("/download/{cache_id}", get(handlers::download))
        .layer(DefaultBodyLimit::disable());

    let admin_routes = Router::new()
        // Health check (unauthenticated for load balancers and probes)
        .route("/v1/health", get(handlers::health_check))
        .route("/v1/admin/entries", get(handlers::list_entries))
        .route(
            "/v1/admin/entries/{id}",
            get(handlers::get_entry).delete(handlers::delete_entry),
        )
        .route("/v1/admin/prune", post(handlers::prune))
        .route("/v1/admin/stats", get(handlers::stats))
        .route("/v1/admin/search", get(handlers::search))
        .route("/v1/admin/sweeps/{kind}", post(handlers::run_sweep));

    let mut router = Router::new().merge(cache_routes).merge(admin_routes);

    // When enabled, /metrics should be network-restricted to the scraper.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    // Layers run outermost first: trace, request id, auth, handler.
    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
