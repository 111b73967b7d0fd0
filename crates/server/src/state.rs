//! Application state shared across handlers.

use crate::admin::AdminService;
use crate::coordinator::UploadCoordinator;
use crate::pruning::Pruner;
use crate::resolver::KeyResolver;
use crate::scheduler::SweepScheduler;
use depot_core::config::AppConfig;
use depot_core::{Clock, SystemClock};
use depot_metadata::MetadataStore;
use depot_storage::ArtifactStore;
use std::sync::Arc;

/// Shared application state.
///
/// Holds no per-upload data. Everything a second worker would need to see
/// lives in the metadata store.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Artifact storage backend.
    pub storage: Arc<dyn ArtifactStore>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    pub clock: Arc<dyn Clock>,
    pub coordinator: Arc<UploadCoordinator>,
    pub resolver: Arc<KeyResolver>,
    pub pruner: Arc<Pruner>,
    pub scheduler: Arc<SweepScheduler>,
    pub admin: Arc<AdminService>,
}

impl AppState {
    /// Create state driven by the system clock.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ArtifactStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> depot_core::Result<Self> {
        Self::with_clock(config, storage, metadata, Arc::new(SystemClock))
    }

    /// Create state with an explicit time source.
    pub fn with_clock(
        config: AppConfig,
        storage: Arc<dyn ArtifactStore>,
        metadata: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
    ) -> depot_core::Result<Self> {
        let coordinator = Arc::new(UploadCoordinator::new(
            &config,
            storage.clone(),
            metadata.clone(),
            clock.clone(),
        ));
        let resolver = Arc::new(KeyResolver::new(metadata.clone(), clock.clone()));
        let pruner = Arc::new(Pruner::new(
            &config,
            storage.clone(),
            metadata.clone(),
            clock.clone(),
        )?);
        let scheduler = Arc::new(SweepScheduler::new(
            pruner.clone(),
            metadata.clone(),
            clock.clone(),
        ));
        let admin = Arc::new(AdminService::new(
            storage.clone(),
            metadata.clone(),
            clock.clone(),
            pruner.clone(),
            scheduler.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            storage,
            metadata,
            clock,
            coordinator,
            resolver,
            pruner,
            scheduler,
            admin,
        })
    }
}
