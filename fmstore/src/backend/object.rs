use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use super::{StorageBackend, mismatch, stream_copy};
use crate::cache::{CacheOp, CacheRegistry, CachedMeta};
use crate::cadapter::{ObjectInfo, ObjectStoreClient};
use crate::error::{Result, StorageError};
use crate::invalidation::invalidate_location;
use crate::locator::{Locator, ObjectLocator, Scheme};
use crate::types::{DirEntry, Metadata};

/// Object store addressed as `s3://bucket/key`.
///
/// Cache layout in namespace `s3:<bucket>`: `Stat` entries under the key
/// without trailing slash, `Listing` entries under the listed prefix
/// (`""` for the bucket root, otherwise ending in `/`).
pub struct ObjectStoreBackend {
    client: Arc<dyn ObjectStoreClient>,
    registry: Arc<CacheRegistry>,
}

impl ObjectStoreBackend {
    pub fn new(client: Arc<dyn ObjectStoreClient>, registry: Arc<CacheRegistry>) -> Self {
        Self { client, registry }
    }

    fn locator<'a>(&self, loc: &'a Locator) -> Result<&'a ObjectLocator> {
        match loc {
            Locator::ObjectStore(o) => Ok(o),
            other => Err(mismatch(Scheme::ObjectStore, other)),
        }
    }

    fn virtual_dir(&self, ns: &str, prefix: &str) -> Metadata {
        Metadata::dir(self.registry.virtual_dir_mtime(ns, prefix))
    }

    fn file_meta(info: &ObjectInfo) -> Metadata {
        Metadata::file(info.size, info.last_modified.unwrap_or(SystemTime::UNIX_EPOCH))
    }

    /// Uncached stat: a stored object, else a (possibly virtual) directory.
    async fn fetch_stat(&self, o: &ObjectLocator) -> Result<Option<Metadata>> {
        let key = o.trimmed_key();
        if !o.key.ends_with('/') {
            if let Some(info) = self.client.head(&o.bucket, key).await? {
                return Ok(Some(Self::file_meta(&info)));
            }
        }
        let prefix = o.list_prefix();
        if let Some(marker) = self.client.head(&o.bucket, &prefix).await? {
            let mtime = marker.last_modified.unwrap_or(SystemTime::UNIX_EPOCH);
            return Ok(Some(Metadata::dir(mtime)));
        }
        if self.client.has_prefix(&o.bucket, &prefix).await? {
            return Ok(Some(self.virtual_dir(&o.namespace(), &prefix)));
        }
        Ok(None)
    }

    fn forget(&self, loc: &Locator) {
        if let Err(err) = invalidate_location(&self.registry, loc) {
            tracing::warn!("cache invalidation for {loc} failed: {err}");
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn scheme(&self) -> Scheme {
        Scheme::ObjectStore
    }

    async fn stat(&self, loc: &Locator) -> Result<Metadata> {
        let o = self.locator(loc)?;
        let ns = o.namespace();
        if o.is_bucket_root() {
            return Ok(self.virtual_dir(&ns, ""));
        }
        let key = o.trimmed_key();
        let cache = self.registry.metadata();
        match cache.get(CacheOp::Stat, &ns, key) {
            Some(CachedMeta::Stat(meta)) => return Ok(meta),
            Some(CachedMeta::Missing) => return Err(StorageError::NotFound(loc.to_string())),
            _ => {}
        }

        match self.fetch_stat(o).await? {
            Some(meta) => {
                cache.put(CacheOp::Stat, &ns, key, CachedMeta::Stat(meta.clone()));
                Ok(meta)
            }
            None => {
                cache.put_with_ttl(CacheOp::Stat, &ns, key, CachedMeta::Missing, cache.error_ttl());
                Err(StorageError::NotFound(loc.to_string()))
            }
        }
    }

    async fn iterdir(&self, loc: &Locator) -> Result<Vec<DirEntry>> {
        let o = self.locator(loc)?;
        let ns = o.namespace();
        let prefix = o.list_prefix();
        let cache = self.registry.metadata();
        if let Some(CachedMeta::Listing(entries)) = cache.get(CacheOp::Listing, &ns, &prefix) {
            return Ok(entries.as_ref().clone());
        }

        let listing = self.client.list(&o.bucket, &prefix, false).await?;
        let mut marker = false;
        let mut entries = Vec::with_capacity(listing.objects.len() + listing.common_prefixes.len());
        for dir in &listing.common_prefixes {
            let name = dir[prefix.len()..].trim_end_matches('/');
            if !name.is_empty() {
                entries.push(DirEntry::new(name, self.virtual_dir(&ns, dir)));
            }
        }
        for info in &listing.objects {
            let name = &info.key[prefix.len()..];
            if name.is_empty() {
                marker = true;
                continue;
            }
            entries.push(DirEntry::new(name, Self::file_meta(info)));
        }
        if entries.is_empty() && !marker && !o.is_bucket_root() {
            return Err(StorageError::NotFound(loc.to_string()));
        }

        // one listing answers a later stat on every child
        for entry in &entries {
            let child = format!("{prefix}{}", entry.name);
            cache.put(CacheOp::Stat, &ns, &child, CachedMeta::Stat(entry.metadata.clone()));
        }
        cache.put(CacheOp::Listing, &ns, &prefix, CachedMeta::Listing(Arc::new(entries.clone())));
        Ok(entries)
    }

    async fn read(&self, loc: &Locator) -> Result<Vec<u8>> {
        let o = self.locator(loc)?;
        self.client
            .get(&o.bucket, o.trimmed_key())
            .await?
            .ok_or_else(|| StorageError::NotFound(loc.to_string()))
    }

    async fn write(&self, loc: &Locator, data: &[u8]) -> Result<()> {
        let o = self.locator(loc)?;
        if o.is_bucket_root() || o.key.ends_with('/') {
            return Err(StorageError::InvalidPath(format!("{loc} names a directory")));
        }
        self.client.put(&o.bucket, o.trimmed_key(), data).await?;
        self.forget(loc);
        Ok(())
    }

    async fn mkdir(&self, loc: &Locator, exist_ok: bool) -> Result<()> {
        let o = self.locator(loc)?;
        if o.is_bucket_root() {
            return if exist_ok {
                Ok(())
            } else {
                Err(StorageError::AlreadyExists(loc.to_string()))
            };
        }
        match self.stat(loc).await {
            Ok(meta) if meta.is_dir() && exist_ok => return Ok(()),
            Ok(_) => return Err(StorageError::AlreadyExists(loc.to_string())),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.client.put(&o.bucket, &o.list_prefix(), &[]).await?;
        self.forget(loc);
        Ok(())
    }

    async fn delete(&self, loc: &Locator) -> Result<()> {
        let o = self.locator(loc)?;
        let meta = self.stat(loc).await?;
        if meta.is_dir() {
            let prefix = o.list_prefix();
            let listing = self.client.list(&o.bucket, &prefix, true).await?;
            for info in &listing.objects {
                self.client.delete(&o.bucket, &info.key).await?;
            }
            tracing::info!("deleted {} objects under {loc}", listing.objects.len());
        } else {
            self.client.delete(&o.bucket, o.trimmed_key()).await?;
        }
        self.forget(loc);
        Ok(())
    }

    async fn copy_to(&self, src: &Locator, dest: &dyn StorageBackend, dst: &Locator) -> Result<()> {
        stream_copy(self, src, dest, dst).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::MemoryObjectStore;
    use crate::config::StoreConfig;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn setup() -> (ObjectStoreBackend, Arc<MemoryObjectStore>, Arc<CacheRegistry>) {
        let store = Arc::new(MemoryObjectStore::new());
        let registry = Arc::new(CacheRegistry::new(&StoreConfig::default()));
        let backend = ObjectStoreBackend::new(store.clone(), registry.clone());
        (backend, store, registry)
    }

    #[tokio::test]
    async fn stat_is_cached() {
        let (backend, store, _) = setup();
        store.seed("b", "docs/a.txt", "12345");
        let loc = Locator::object("b", "docs/a.txt");

        assert_eq!(backend.stat(&loc).await.unwrap().size, 5);
        let reads = store.calls.reads();
        assert_eq!(backend.stat(&loc).await.unwrap().size, 5);
        assert_eq!(store.calls.reads(), reads);
    }

    #[tokio::test]
    async fn missing_object_is_negatively_cached() {
        let (backend, store, registry) = setup();
        let loc = Locator::object("b", "nope.txt");

        assert!(!backend.exists(&loc).await.unwrap());
        let reads = store.calls.reads();
        assert!(!backend.exists(&loc).await.unwrap());
        assert_eq!(store.calls.reads(), reads);
        assert_eq!(
            registry.metadata().error_ttl(),
            Duration::from_secs(StoreConfig::default().error_ttl_secs)
        );

        backend.write(&loc, b"now here").await.unwrap();
        assert!(backend.exists(&loc).await.unwrap());
    }

    #[tokio::test]
    async fn listing_seeds_child_stats_and_virtual_dirs() {
        let (backend, store, _) = setup();
        store.seed("b", "dir/a.txt", "aa");
        store.seed("b", "dir/sub/b.txt", "bbb");

        let mut entries = backend.iterdir(&Locator::object("b", "dir/")).await.unwrap();
        entries.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert!(entries[1].metadata.is_dir());

        let reads = store.calls.reads();
        let a = backend.stat(&Locator::object("b", "dir/a.txt")).await.unwrap();
        assert_eq!(a.size, 2);
        let sub = backend.stat(&Locator::object("b", "dir/sub")).await.unwrap();
        assert_eq!(sub.mtime, entries[1].metadata.mtime);
        assert_eq!(store.calls.reads(), reads);
    }

    #[tokio::test]
    async fn virtual_dir_mtime_survives_cache_expiry() {
        let (backend, store, registry) = setup();
        store.seed("b", "photos/2024/x.jpg", "x");
        let loc = Locator::object("b", "photos");

        let first = backend.stat(&loc).await.unwrap();
        assert!(first.is_dir());
        registry.metadata().clear();
        let second = backend.stat(&loc).await.unwrap();
        assert_eq!(first.mtime, second.mtime);
    }

    #[tokio::test]
    async fn write_replaces_stale_stat() {
        let (backend, store, registry) = setup();
        let loc = Locator::object("b", "dir/file.txt");
        registry.metadata().put(
            CacheOp::Stat,
            "s3:b",
            "dir/file.txt",
            CachedMeta::Stat(Metadata::file(100, SystemTime::UNIX_EPOCH)),
        );

        backend.write(&loc, b"short").await.unwrap();
        assert_eq!(backend.stat(&loc).await.unwrap().size, 5);
        assert_eq!(store.calls.put.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mkdir_and_recursive_delete() {
        let (backend, store, _) = setup();
        let dir = Locator::object("b", "tree/");
        backend.mkdir(&dir, false).await.unwrap();
        assert!(backend.stat(&dir).await.unwrap().is_dir());
        assert!(backend.iterdir(&dir).await.unwrap().is_empty());
        assert!(matches!(
            backend.mkdir(&dir, false).await.unwrap_err(),
            StorageError::AlreadyExists(_)
        ));

        backend.write(&Locator::object("b", "tree/a"), b"a").await.unwrap();
        backend.write(&Locator::object("b", "tree/deep/b"), b"b").await.unwrap();
        assert_eq!(backend.iterdir(&dir).await.unwrap().len(), 2);

        backend.delete(&dir).await.unwrap();
        assert!(!backend.exists(&dir).await.unwrap());
        assert!(!backend.exists(&Locator::object("b", "tree/deep/b")).await.unwrap());
        assert!(store.list("b", "tree/", true).await.unwrap().objects.is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_is_not_cached() {
        let (backend, store, _) = setup();
        store.seed("b", "k", "v");
        store.set_offline(true);
        let loc = Locator::object("b", "k");
        assert!(backend.stat(&loc).await.unwrap_err().is_unavailable());
        store.set_offline(false);
        assert!(backend.exists(&loc).await.unwrap());
    }
}
