//! Bounded pool of open archive handles.
//!
//! Each archive path owns a slot holding a `OnceCell`. The table mutex only
//! guards slot bookkeeping; the open itself runs on the blocking pool while
//! every concurrent caller for the same path awaits the same cell, so an
//! archive is opened at most once per slot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::archive::{ArchiveHandle, ArchiveOpener, FormatOpener};
use crate::error::{Result, StorageError};

struct Slot {
    cell: Arc<OnceCell<Arc<ArchiveHandle>>>,
    last_access: Instant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArchiveCacheStats {
    pub open_handles: usize,
    pub pending_opens: usize,
    pub max_open: usize,
    pub ttl_secs: u64,
    pub archives: Vec<PathBuf>,
}

pub struct ArchiveHandleCache {
    slots: Mutex<HashMap<PathBuf, Slot>>,
    opener: Arc<dyn ArchiveOpener>,
    max_open: usize,
    ttl: Duration,
}

impl ArchiveHandleCache {
    pub fn new(max_open: usize, ttl: Duration) -> Self {
        Self::with_opener(max_open, ttl, Arc::new(FormatOpener))
    }

    pub fn with_opener(max_open: usize, ttl: Duration, opener: Arc<dyn ArchiveOpener>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            opener,
            max_open: max_open.max(1),
            ttl,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<PathBuf, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the open handle for `archive_path`, opening it on first use.
    pub async fn get_handler(&self, archive_path: &Path) -> Result<Arc<ArchiveHandle>> {
        let key = canonical_archive_path(archive_path)?;
        let (cell, victims) = self.claim(&key);
        close_all(victims);

        let opener = self.opener.clone();
        let path = key.clone();
        let opened = cell
            .get_or_try_init(|| async move {
                tracing::info!("opening archive {}", path.display());
                tokio::task::spawn_blocking(move || ArchiveHandle::open(opener.as_ref(), &path))
                    .await
                    .map_err(|e| StorageError::Other(format!("archive open task failed: {e}")))?
                    .map(Arc::new)
            })
            .await;

        match opened {
            Ok(handle) => Ok(handle.clone()),
            Err(err) => {
                let mut table = self.table();
                if table.get(&key).is_some_and(|slot| Arc::ptr_eq(&slot.cell, &cell)) {
                    table.remove(&key);
                }
                Err(err)
            }
        }
    }

    /// Finds or creates the slot for `key`, returning handles that must be
    /// closed once the table lock is released.
    fn claim(&self, key: &Path) -> (Arc<OnceCell<Arc<ArchiveHandle>>>, Vec<Arc<ArchiveHandle>>) {
        let now = Instant::now();
        let mut table = self.table();
        let mut victims = Vec::new();

        // A slot still being opened is never a victim: dropping it would let
        // the open finish unowned and the next caller open the file again.
        let idle: Vec<PathBuf> = table
            .iter()
            .filter(|(_, slot)| slot.cell.initialized())
            .filter(|(_, slot)| now.saturating_duration_since(slot.last_access) > self.ttl)
            .map(|(path, _)| path.clone())
            .collect();
        for path in idle {
            if let Some(slot) = table.remove(&path) {
                tracing::debug!("archive handle {} idle past ttl", path.display());
                victims.extend(slot.cell.get().cloned());
            }
        }

        if let Some(slot) = table.get_mut(key) {
            slot.last_access = now;
            return (slot.cell.clone(), victims);
        }

        // Pending opens may push the table briefly past `max_open`; the next
        // claim trims it back once they have finished.
        while table.len() >= self.max_open {
            let Some(oldest) = table
                .iter()
                .filter(|(_, slot)| slot.cell.initialized())
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(path, _)| path.clone())
            else {
                break;
            };
            if let Some(slot) = table.remove(&oldest) {
                tracing::info!("evicting archive handle {}", oldest.display());
                victims.extend(slot.cell.get().cloned());
            }
        }

        let cell = Arc::new(OnceCell::new());
        table.insert(
            key.to_path_buf(),
            Slot {
                cell: cell.clone(),
                last_access: now,
            },
        );
        (cell, victims)
    }

    /// Closes and forgets the handle for `archive_path`, if any.
    pub fn invalidate(&self, archive_path: &Path) {
        let Ok(key) = canonical_archive_path(archive_path) else {
            return;
        };
        let victim = self.table().remove(&key);
        if let Some(slot) = victim {
            tracing::debug!("invalidated archive handle {}", key.display());
            close_all(slot.cell.get().cloned());
        }
    }

    /// Closes every handle for an archive at or below `dir`.
    pub fn invalidate_under(&self, dir: &Path) {
        let Ok(root) = canonical_archive_path(dir) else {
            return;
        };
        let victims: Vec<Slot> = {
            let mut table = self.table();
            let doomed: Vec<PathBuf> = table.keys().filter(|path| path.starts_with(&root)).cloned().collect();
            doomed.iter().filter_map(|path| table.remove(path)).collect()
        };
        if !victims.is_empty() {
            tracing::debug!("invalidated {} archive handles under {}", victims.len(), root.display());
        }
        close_all(victims.iter().filter_map(|slot| slot.cell.get().cloned()));
    }

    pub fn clear(&self) {
        let drained: Vec<Slot> = self.table().drain().map(|(_, slot)| slot).collect();
        close_all(drained.iter().filter_map(|slot| slot.cell.get().cloned()));
    }

    pub fn contains(&self, archive_path: &Path) -> bool {
        canonical_archive_path(archive_path).is_ok_and(|key| self.table().contains_key(&key))
    }

    pub fn get_stats(&self) -> ArchiveCacheStats {
        let table = self.table();
        let open_handles = table.values().filter(|slot| slot.cell.initialized()).count();
        let mut archives: Vec<PathBuf> = table.keys().cloned().collect();
        archives.sort();
        ArchiveCacheStats {
            open_handles,
            pending_opens: table.len() - open_handles,
            max_open: self.max_open,
            ttl_secs: self.ttl.as_secs(),
            archives,
        }
    }
}

/// Canonical key for an archive path: symlinks and `..` are resolved through
/// the deepest ancestor that still exists, so a deleted file maps to the same
/// key it had while present.
pub fn canonical_archive_path(path: &Path) -> Result<PathBuf> {
    let abs = std::path::absolute(path).map_err(|e| StorageError::InvalidPath(format!("{}: {e}", path.display())))?;
    let mut missing = Vec::new();
    let mut cur = abs.as_path();
    loop {
        if let Ok(real) = std::fs::canonicalize(cur) {
            return Ok(missing.iter().rev().fold(real, |acc: PathBuf, part| acc.join(part)));
        }
        match (cur.parent(), cur.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                cur = parent;
            }
            _ => return Ok(abs),
        }
    }
}

fn close_all(handles: impl IntoIterator<Item = Arc<ArchiveHandle>>) {
    for handle in handles {
        handle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveMember, ArchiveReader};
    use crate::types::Metadata;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    struct NullReader(Vec<ArchiveMember>);

    impl ArchiveReader for NullReader {
        fn members(&self) -> &[ArchiveMember] {
            &self.0
        }

        fn read_member(&self, _member: &str) -> io::Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn close(&self) {}
    }

    #[derive(Default)]
    struct CountingOpener {
        opens: AtomicUsize,
        opened: std::sync::Mutex<Vec<PathBuf>>,
    }

    impl CountingOpener {
        fn opens_of(&self, name: &str) -> usize {
            let opened = self.opened.lock().unwrap();
            opened.iter().filter(|p| p.ends_with(name)).count()
        }
    }

    impl ArchiveOpener for CountingOpener {
        fn open(&self, path: &Path) -> Result<Box<dyn ArchiveReader>> {
            if path.ends_with("broken.tar") {
                return Err(StorageError::UnsupportedOperation("broken".into()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(Box::new(NullReader(vec![ArchiveMember {
                path: "a.txt".into(),
                metadata: Metadata::file(1, SystemTime::UNIX_EPOCH),
            }])))
        }
    }

    fn cache(max_open: usize, ttl_secs: u64) -> (Arc<ArchiveHandleCache>, Arc<CountingOpener>) {
        let opener = Arc::new(CountingOpener::default());
        let cache = ArchiveHandleCache::with_opener(max_open, Duration::from_secs(ttl_secs), opener.clone());
        (Arc::new(cache), opener)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_open_once() {
        let (cache, opener) = cache(5, 300);
        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_handler(Path::new("/data/x.tar")).await.unwrap() })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(cache.get_stats().open_handles, 1);
    }

    #[tokio::test]
    async fn capacity_evicts_and_closes_least_recent() {
        let (cache, opener) = cache(2, 300);
        let a = cache.get_handler(Path::new("/data/a.tar")).await.unwrap();
        let b = cache.get_handler(Path::new("/data/b.tar")).await.unwrap();
        // touch a so b becomes the oldest
        cache.get_handler(Path::new("/data/a.tar")).await.unwrap();
        let c = cache.get_handler(Path::new("/data/c.tar")).await.unwrap();

        assert!(a.is_open());
        assert!(!b.is_open());
        assert!(c.is_open());
        assert!(!cache.contains(Path::new("/data/b.tar")));
        assert_eq!(cache.get_stats().open_handles, 2);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_handle_is_replaced_after_ttl() {
        let (cache, opener) = cache(5, 10);
        let first = cache.get_handler(Path::new("/data/a.tar")).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let second = cache.get_handler(Path::new("/data/a.tar")).await.unwrap();

        assert!(!first.is_open());
        assert!(second.is_open());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_open_leaves_no_slot() {
        let (cache, _) = cache(5, 300);
        let err = cache.get_handler(Path::new("/data/broken.tar")).await.unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedOperation(_)));
        assert!(!cache.contains(Path::new("/data/broken.tar")));
    }

    #[tokio::test]
    async fn invalidate_and_clear_close_handles() {
        let (cache, _) = cache(5, 300);
        let a = cache.get_handler(Path::new("/data/a.tar")).await.unwrap();
        let b = cache.get_handler(Path::new("/data/b.tar")).await.unwrap();

        cache.invalidate(Path::new("/data/a.tar"));
        assert!(!a.is_open());
        assert!(b.is_open());

        cache.clear();
        assert!(!b.is_open());
        assert_eq!(cache.get_stats().open_handles, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pending_open_survives_capacity_pressure() {
        let (cache, opener) = cache(1, 300);
        let first = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_handler(Path::new("/data/slow.tar")).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // slow.tar is still opening, so it must not be the eviction victim
        let other = cache.get_handler(Path::new("/data/other.tar")).await.unwrap();
        let second = cache.get_handler(Path::new("/data/slow.tar")).await.unwrap();
        let first = first.await.unwrap();

        assert_eq!(opener.opens_of("slow.tar"), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_open());
        assert!(other.is_open());

        // the overshoot is trimmed by the next claim
        cache.get_handler(Path::new("/data/third.tar")).await.unwrap();
        assert_eq!(cache.get_stats().open_handles, 1);
    }

    #[tokio::test]
    async fn dotted_and_plain_paths_share_a_slot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("d/x.tar"), b"").unwrap();
        let (cache, opener) = cache(5, 300);

        let plain = cache.get_handler(&dir.path().join("d/x.tar")).await.unwrap();
        let dotted = cache.get_handler(&dir.path().join("d/../d/x.tar")).await.unwrap();
        assert!(Arc::ptr_eq(&plain, &dotted));
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_under_closes_nested_archives_only() {
        let (cache, _) = cache(5, 300);
        let inner = cache.get_handler(Path::new("/data/d/x.tar")).await.unwrap();
        let deeper = cache.get_handler(Path::new("/data/d/sub/y.tar")).await.unwrap();
        let sibling = cache.get_handler(Path::new("/data/dd.tar")).await.unwrap();

        cache.invalidate_under(Path::new("/data/d"));
        assert!(!inner.is_open());
        assert!(!deeper.is_open());
        assert!(sibling.is_open());
        assert!(cache.contains(Path::new("/data/dd.tar")));
    }
}
