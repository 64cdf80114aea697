//! In-process object store. Counts every call so cache behaviour can be
//! asserted directly, and can be switched offline to simulate an outage.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;

use super::{ObjectInfo, ObjectListing, ObjectStoreClient};
use crate::error::{Result, StorageError};

#[derive(Debug, Default)]
pub struct CallCounts {
    pub list: AtomicUsize,
    pub head: AtomicUsize,
    pub get: AtomicUsize,
    pub put: AtomicUsize,
    pub delete: AtomicUsize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        [&self.list, &self.head, &self.get, &self.put, &self.delete]
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .sum()
    }

    /// Calls that read from the store.
    pub fn reads(&self) -> usize {
        self.list.load(Ordering::SeqCst)
            + self.head.load(Ordering::SeqCst)
            + self.get.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), (Vec<u8>, SystemTime)>>,
    offline: AtomicBool,
    pub calls: CallCounts,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object without counting a call.
    pub fn seed(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        self.lock()
            .insert((bucket.to_string(), key.to_string()), (data.into(), SystemTime::now()));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), (Vec<u8>, SystemTime)>> {
        self.objects.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn enter(&self, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::BackendUnavailable("memory store is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStoreClient for MemoryObjectStore {
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> Result<ObjectListing> {
        self.enter(&self.calls.list)?;
        let objects = self.lock();
        let mut listing = ObjectListing::default();
        let mut prefixes = BTreeSet::new();
        for ((b, key), (data, mtime)) in objects.range((bucket.to_string(), prefix.to_string())..) {
            if b != bucket || !key.starts_with(prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            match rest.find('/') {
                Some(idx) if !recursive => {
                    prefixes.insert(format!("{prefix}{}", &rest[..=idx]));
                }
                _ => listing.objects.push(ObjectInfo {
                    key: key.clone(),
                    size: data.len() as u64,
                    last_modified: Some(*mtime),
                }),
            }
        }
        listing.common_prefixes = prefixes.into_iter().collect();
        Ok(listing)
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        self.enter(&self.calls.head)?;
        Ok(self
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(data, mtime)| ObjectInfo {
                key: key.to_string(),
                size: data.len() as u64,
                last_modified: Some(*mtime),
            }))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.enter(&self.calls.get)?;
        Ok(self
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(data, _)| data.clone()))
    }

    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        self.enter(&self.calls.put)?;
        self.lock().insert(
            (bucket.to_string(), key.to_string()),
            (data.to_vec(), SystemTime::now()),
        );
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.enter(&self.calls.delete)?;
        self.lock().remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delimiter_listing_groups_prefixes() {
        let store = MemoryObjectStore::new();
        store.seed("b", "dir/a.txt", "aa");
        store.seed("b", "dir/sub/b.txt", "bbb");
        store.seed("b", "dir/sub/c.txt", "c");
        store.seed("b", "other.txt", "o");
        store.seed("c", "dir/x", "x");

        let listing = store.list("b", "dir/", false).await.unwrap();
        let keys: Vec<&str> = listing.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["dir/a.txt"]);
        assert_eq!(listing.common_prefixes, vec!["dir/sub/"]);

        let all = store.list("b", "dir/", true).await.unwrap();
        assert_eq!(all.objects.len(), 3);
        assert!(all.common_prefixes.is_empty());
        assert_eq!(store.calls.list.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = MemoryObjectStore::new();
        store.seed("b", "k", "v");
        store.set_offline(true);
        let err = store.head("b", "k").await.unwrap_err();
        assert!(err.is_unavailable());
        store.set_offline(false);
        assert_eq!(store.get("b", "k").await.unwrap().as_deref(), Some(&b"v"[..]));
        assert_eq!(store.calls.reads(), 2);
    }
}
