//! TTL + LRU cache for small backend-call results.
//!
//! One coarse mutex guards the whole table. Payloads are small and the cost
//! this cache avoids is network latency, so a single lock is the baseline;
//! sharding by namespace is the upgrade path if contention is ever measured.
//! The lock is never held across backend I/O: a miss returns `None` and the
//! caller does the fetch.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::time::Instant;

use crate::types::{DirEntry, Metadata};

/// Which backend call a cached value answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheOp {
    Stat,
    Listing,
}

impl CacheOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOp::Stat => "stat",
            CacheOp::Listing => "listing",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub op: CacheOp,
    pub namespace: String,
    pub resource: String,
}

impl CacheKey {
    pub fn new(op: CacheOp, namespace: &str, resource: &str) -> Self {
        Self {
            op,
            namespace: namespace.to_string(),
            resource: resource.to_string(),
        }
    }
}

/// Value stored by the backends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CachedMeta {
    Stat(Metadata),
    /// Negative entry: the resource was looked up and did not exist.
    Missing,
    Listing(Arc<Vec<DirEntry>>),
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    last_access: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

/// Read-only counters for tuning. Never consulted for correctness.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MetadataCacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub max_entries: usize,
    pub default_ttl_secs: u64,
    pub error_ttl_secs: u64,
    pub operation_counts: BTreeMap<&'static str, usize>,
    /// Seconds since the least recently used entry was last read or written.
    pub oldest_idle_secs: u64,
}

pub struct MetadataCache<V = CachedMeta> {
    inner: Mutex<LruCache<CacheKey, Entry<V>>>,
    max_entries: usize,
    default_ttl: Duration,
    error_ttl: Duration,
}

impl<V: Clone> MetadataCache<V> {
    pub fn new(max_entries: usize, default_ttl: Duration, error_ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            max_entries: cap.get(),
            default_ttl,
            error_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn error_ttl(&self) -> Duration {
        self.error_ttl
    }

    fn table(&self) -> MutexGuard<'_, LruCache<CacheKey, Entry<V>>> {
        // A panic while holding the lock cannot leave an entry half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the cached value, or `None` when absent or expired. Expired
    /// entries are dropped here; there is no background sweeper.
    pub fn get(&self, op: CacheOp, ns: &str, res: &str) -> Option<V> {
        let key = CacheKey::new(op, ns, res);
        let now = Instant::now();
        let mut table = self.table();

        let expired = table.peek(&key)?.is_expired(now);
        if expired {
            table.pop(&key);
            tracing::debug!("cache expired for {} on {ns}:{res}", op.as_str());
            return None;
        }

        // `get_mut` also moves the key to the most-recently-used position.
        let entry = table.get_mut(&key)?;
        entry.last_access = now;
        tracing::debug!("cache hit for {} on {ns}:{res}", op.as_str());
        Some(entry.value.clone())
    }

    pub fn put(&self, op: CacheOp, ns: &str, res: &str, value: V) {
        self.put_with_ttl(op, ns, res, value, self.default_ttl);
    }

    pub fn put_with_ttl(&self, op: CacheOp, ns: &str, res: &str, value: V, ttl: Duration) {
        let key = CacheKey::new(op, ns, res);
        let now = Instant::now();
        let entry = Entry {
            value,
            inserted_at: now,
            ttl,
            last_access: now,
        };
        // At capacity `push` evicts the least recently accessed key first.
        if let Some((evicted, _)) = self.table().push(key.clone(), entry) {
            if evicted != key {
                tracing::info!(
                    "evicted LRU cache entry {} for {}:{}",
                    evicted.op.as_str(),
                    evicted.namespace,
                    evicted.resource
                );
            }
        }
        tracing::debug!("cached {} for {ns}:{res} (ttl {ttl:?})", op.as_str());
    }

    /// Drops every operation cached for exactly `(ns, res)`.
    pub fn invalidate_key(&self, ns: &str, res: &str) {
        self.remove_where(|key| key.namespace == ns && key.resource == res);
    }

    /// Drops every entry whose resource starts with `prefix` in `ns`.
    pub fn invalidate_prefix(&self, ns: &str, prefix: &str) {
        let removed = self.remove_where(|key| key.namespace == ns && key.resource.starts_with(prefix));
        if removed > 0 {
            tracing::info!("invalidated {removed} cache entries under {ns}:{prefix}");
        }
    }

    pub fn invalidate_namespace(&self, ns: &str) {
        let removed = self.remove_where(|key| key.namespace == ns);
        if removed > 0 {
            tracing::info!("invalidated {removed} cache entries for {ns}");
        }
    }

    /// Drops `ns` and every namespace nested below it as `ns/...`.
    pub fn invalidate_namespace_tree(&self, ns: &str) {
        let nested = format!("{ns}{}", std::path::MAIN_SEPARATOR);
        let removed = self.remove_where(|key| key.namespace == ns || key.namespace.starts_with(&nested));
        if removed > 0 {
            tracing::info!("invalidated {removed} cache entries for {ns} and below");
        }
    }

    pub fn clear(&self) {
        let mut table = self.table();
        let count = table.len();
        table.clear();
        if count > 0 {
            tracing::info!("cleared {count} cache entries");
        }
    }

    fn remove_where(&self, pred: impl Fn(&CacheKey) -> bool) -> usize {
        let mut table = self.table();
        let doomed: Vec<CacheKey> = table
            .iter()
            .filter(|(key, _)| pred(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            table.pop(key);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_stats(&self) -> MetadataCacheStats {
        let now = Instant::now();
        let table = self.table();
        let mut operation_counts = BTreeMap::new();
        let mut expired_entries = 0;
        let mut oldest_idle = Duration::ZERO;
        for (key, entry) in table.iter() {
            *operation_counts.entry(key.op.as_str()).or_insert(0) += 1;
            if entry.is_expired(now) {
                expired_entries += 1;
            }
            oldest_idle = oldest_idle.max(now.saturating_duration_since(entry.last_access));
        }
        MetadataCacheStats {
            total_entries: table.len(),
            expired_entries,
            max_entries: self.max_entries,
            default_ttl_secs: self.default_ttl.as_secs(),
            error_ttl_secs: self.error_ttl.as_secs(),
            operation_counts,
            oldest_idle_secs: oldest_idle.as_secs(),
        }
    }
}
