//! HTTP server and cache engine for depot.
//!
//! This crate provides:
//! - Upload coordination: reservation, chunk ingestion, single-flight commit
//! - Key resolution with restore-key fallback
//! - Age, capacity and stale-upload sweeps on cron schedules
//! - The GitHub Actions cache REST surface and block-blob upload routes
//! - An admin facade with its HTTP routes

pub mod admin;
pub mod auth;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod pruning;
pub mod resolver;
pub mod routes;
pub mod scheduler;
pub mod state;

pub use auth::RequestId;
pub use coordinator::UploadCoordinator;
pub use error::ApiError;
pub use resolver::{KeyResolver, Resolution};
pub use routes::create_router;
pub use state::AppState;
