//! Cache key resolution.

use crate::error::ApiResult;
use crate::metrics;
use depot_core::{Clock, EntryKey};
use depot_metadata::MetadataStore;
use depot_metadata::models::CacheEntryRow;
use std::sync::Arc;
use tracing::instrument;

/// How a lookup was satisfied.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The exact (key, version, scope) triple is committed.
    Exact(CacheEntryRow),
    /// The entry matched the restore key at `restore_key` position.
    Restored {
        entry: CacheEntryRow,
        restore_key: usize,
    },
    Miss,
}

impl Resolution {
    pub fn entry(&self) -> Option<&CacheEntryRow> {
        match self {
            Self::Exact(entry) | Self::Restored { entry, .. } => Some(entry),
            Self::Miss => None,
        }
    }

    pub fn into_entry(self) -> Option<CacheEntryRow> {
        match self {
            Self::Exact(entry) | Self::Restored { entry, .. } => Some(entry),
            Self::Miss => None,
        }
    }
}

/// Resolves lookups against committed entries of one scope.
pub struct KeyResolver {
    metadata: Arc<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
}

impl KeyResolver {
    pub fn new(metadata: Arc<dyn MetadataStore>, clock: Arc<dyn Clock>) -> Self {
        Self { metadata, clock }
    }

    /// Resolve `key` with ordered `restore_keys` as prefix fallbacks.
    ///
    /// The exact triple always wins. Otherwise the first restore key with
    /// any committed prefix match in the same scope decides, and the most
    /// recently updated match is returned. Restore keys ignore version.
    #[instrument(skip(self, restore_keys), fields(key = %key.key, scope = %key.scope, restore_keys = restore_keys.len()))]
    pub async fn resolve(&self, key: &EntryKey, restore_keys: &[String]) -> ApiResult<Resolution> {
        if let Some(entry) = self.metadata.find_committed(key).await?
            && let Some(entry) = self.record_hit(entry).await?
        {
            metrics::LOOKUPS.with_label_values(&["exact"]).inc();
            return Ok(Resolution::Exact(entry));
        }

        for (position, prefix) in restore_keys.iter().enumerate() {
            if prefix.is_empty() {
                continue;
            }
            if let Some(entry) = self
                .metadata
                .find_committed_by_prefix(&key.scope, prefix)
                .await?
                && let Some(entry) = self.record_hit(entry).await?
            {
                metrics::LOOKUPS.with_label_values(&["restore"]).inc();
                return Ok(Resolution::Restored {
                    entry,
                    restore_key: position,
                });
            }
        }

        metrics::LOOKUPS.with_label_values(&["miss"]).inc();
        Ok(Resolution::Miss)
    }

    /// Bump `accessed_at`. An entry evicted since it was read is a miss.
    async fn record_hit(&self, mut entry: CacheEntryRow) -> ApiResult<Option<CacheEntryRow>> {
        let now = self.clock.now();
        if !self.metadata.touch_entry(entry.id, now).await? {
            tracing::debug!(entry_id = entry.id, "Entry evicted during lookup");
            return Ok(None);
        }
        entry.accessed_at = now;
        Ok(Some(entry))
    }
}
