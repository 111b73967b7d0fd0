//! Artifact storage abstraction and backends for depot.
//!
//! This crate provides:
//! - Range-addressed staging of in-progress uploads
//! - Atomic finalize of staged ranges into one object per cache entry
//! - Backends: local filesystem and S3-compatible

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use traits::{ArtifactStore, ByteStream, ObjectRef};

use depot_core::config::StorageConfig;
use std::sync::Arc;

/// Create an artifact store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ArtifactStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}
