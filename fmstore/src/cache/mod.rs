//! Cache layer.
//!
//! - `metadata`: TTL + LRU table for stat and listing results
//! - `archive`: bounded pool of open archive readers
//!
//! [`CacheRegistry`] owns one of each and is handed to every backend at
//! construction. The application root normally shares [`CacheRegistry::global`];
//! tests build isolated registries with [`CacheRegistry::new`].

pub mod archive;
pub mod metadata;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use once_cell::sync::Lazy;
use serde::Serialize;

pub use self::archive::{ArchiveCacheStats, ArchiveHandleCache, canonical_archive_path};
pub use self::metadata::{CacheKey, CacheOp, CachedMeta, MetadataCache, MetadataCacheStats};

use crate::config::StoreConfig;

static GLOBAL: Lazy<Arc<CacheRegistry>> =
    Lazy::new(|| Arc::new(CacheRegistry::new(&StoreConfig::default())));

#[derive(Clone, Debug, Serialize)]
pub struct RegistryStats {
    pub metadata: MetadataCacheStats,
    pub archives: ArchiveCacheStats,
    pub virtual_dirs: usize,
}

pub struct CacheRegistry {
    metadata: MetadataCache,
    archives: ArchiveHandleCache,
    // (namespace, prefix) -> mtime synthesized on first sight
    virtual_dirs: Mutex<HashMap<(String, String), SystemTime>>,
}

impl CacheRegistry {
    pub fn new(config: &StoreConfig) -> Self {
        Self::with_caches(
            MetadataCache::new(
                config.metadata_max_entries,
                config.metadata_ttl(),
                config.error_ttl(),
            ),
            ArchiveHandleCache::new(config.archive_max_open, config.archive_ttl()),
        )
    }

    pub fn with_caches(metadata: MetadataCache, archives: ArchiveHandleCache) -> Self {
        Self {
            metadata,
            archives,
            virtual_dirs: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide default registry, built from default settings on first use.
    pub fn global() -> Arc<CacheRegistry> {
        GLOBAL.clone()
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    pub fn archives(&self) -> &ArchiveHandleCache {
        &self.archives
    }

    /// How long a listing-derived snapshot stays trustworthy.
    pub fn snapshot_ttl(&self) -> Duration {
        self.metadata.default_ttl()
    }

    /// Stable mtime for a directory that exists only as a key prefix.
    pub fn virtual_dir_mtime(&self, namespace: &str, prefix: &str) -> SystemTime {
        let mut dirs = self.virtual_dirs.lock().unwrap_or_else(|p| p.into_inner());
        *dirs
            .entry((namespace.to_string(), prefix.to_string()))
            .or_insert_with(SystemTime::now)
    }

    /// Drops every cached value. Open archive handles are closed.
    pub fn clear(&self) {
        self.metadata.clear();
        self.archives.clear();
        self.virtual_dirs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    pub fn get_stats(&self) -> RegistryStats {
        RegistryStats {
            metadata: self.metadata.get_stats(),
            archives: self.archives.get_stats(),
            virtual_dirs: self
                .virtual_dirs
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .len(),
        }
    }
}
