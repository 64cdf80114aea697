use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio::fs;

use super::{StorageBackend, mismatch, stream_copy};
use crate::cache::CacheRegistry;
use crate::error::{Result, StorageError};
use crate::invalidation::invalidate_location;
use crate::locator::{Locator, Scheme};
use crate::types::{DirEntry, EntryKind, Metadata};

/// Local disk. Stats are cheap syscalls and are not cached, but writes still
/// drop any archive handle open on the file being replaced.
pub struct LocalBackend {
    registry: Arc<CacheRegistry>,
}

impl LocalBackend {
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self { registry }
    }

    fn path<'a>(&self, loc: &'a Locator) -> Result<&'a Path> {
        match loc {
            Locator::Local(l) => Ok(&l.path),
            other => Err(mismatch(Scheme::Local, other)),
        }
    }

    fn forget(&self, loc: &Locator) {
        if let Err(err) = invalidate_location(&self.registry, loc) {
            tracing::warn!("failed to drop cached archive state for {loc}: {err}");
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| StorageError::from_io(e, path.display().to_string())
}

fn to_metadata(meta: &std::fs::Metadata) -> Metadata {
    let kind = if meta.is_dir() {
        EntryKind::Dir
    } else if meta.file_type().is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::File
    };
    let mtime = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
    let out = Metadata {
        kind,
        size: if kind == EntryKind::File { meta.len() } else { 0 },
        mtime,
        mode: None,
    };
    #[cfg(unix)]
    let out = {
        use std::os::unix::fs::PermissionsExt;
        out.with_mode(meta.permissions().mode() & 0o7777)
    };
    out
}

/// Follows symlinks; a dangling link still stats as a symlink.
async fn stat_path(path: &Path) -> Result<Metadata> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(to_metadata(&meta)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let meta = fs::symlink_metadata(path).await.map_err(io_err(path))?;
            Ok(to_metadata(&meta))
        }
        Err(e) => Err(io_err(path)(e)),
    }
}

fn copy_tree<'a>(src: &'a Path, dst: &'a Path) -> BoxFuture<'a, Result<()>> {
    async move {
        if !fs::metadata(src).await.map_err(io_err(src))?.is_dir() {
            fs::copy(src, dst).await.map_err(io_err(dst))?;
            return Ok(());
        }
        fs::create_dir_all(dst).await.map_err(io_err(dst))?;
        let mut entries = fs::read_dir(src).await.map_err(io_err(src))?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err(src))? {
            let child: PathBuf = dst.join(entry.file_name());
            copy_tree(&entry.path(), &child).await?;
        }
        Ok(())
    }
    .boxed()
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn scheme(&self) -> Scheme {
        Scheme::Local
    }

    async fn stat(&self, loc: &Locator) -> Result<Metadata> {
        stat_path(self.path(loc)?).await
    }

    async fn iterdir(&self, loc: &Locator) -> Result<Vec<DirEntry>> {
        let path = self.path(loc)?;
        let mut entries = fs::read_dir(path).await.map_err(io_err(path))?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(path))? {
            let child = entry.path();
            match stat_path(&child).await {
                Ok(meta) => out.push(DirEntry::new(entry.file_name().to_string_lossy(), meta)),
                // raced with a concurrent delete
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn read(&self, loc: &Locator) -> Result<Vec<u8>> {
        let path = self.path(loc)?;
        fs::read(path).await.map_err(io_err(path))
    }

    async fn write(&self, loc: &Locator, data: &[u8]) -> Result<()> {
        let path = self.path(loc)?;
        fs::write(path, data).await.map_err(io_err(path))?;
        self.forget(loc);
        Ok(())
    }

    async fn mkdir(&self, loc: &Locator, exist_ok: bool) -> Result<()> {
        let path = self.path(loc)?;
        if exist_ok {
            fs::create_dir_all(path).await.map_err(io_err(path))
        } else {
            fs::create_dir(path).await.map_err(io_err(path))
        }
    }

    async fn delete(&self, loc: &Locator) -> Result<()> {
        let path = self.path(loc)?;
        let meta = fs::symlink_metadata(path).await.map_err(io_err(path))?;
        if meta.is_dir() {
            fs::remove_dir_all(path).await.map_err(io_err(path))?;
        } else {
            fs::remove_file(path).await.map_err(io_err(path))?;
        }
        self.forget(loc);
        Ok(())
    }

    async fn copy_to(&self, src: &Locator, dest: &dyn StorageBackend, dst: &Locator) -> Result<()> {
        if dest.scheme() != Scheme::Local {
            return stream_copy(self, src, dest, dst).await;
        }
        let (from, to) = (self.path(src)?, self.path(dst)?);
        tracing::debug!("native copy {} -> {}", from.display(), to.display());
        copy_tree(from, to).await?;
        self.forget(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn backend() -> LocalBackend {
        LocalBackend::new(Arc::new(CacheRegistry::new(&StoreConfig::default())))
    }

    #[tokio::test]
    async fn file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend();
        let file = Locator::local(dir.path().join("a.txt"));

        assert!(!backend.exists(&file).await.unwrap());
        backend.write(&file, b"hello").await.unwrap();
        let meta = backend.stat(&file).await.unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.size, 5);
        assert_eq!(backend.read(&file).await.unwrap(), b"hello");

        backend.delete(&file).await.unwrap();
        assert!(!backend.exists(&file).await.unwrap());
        assert!(backend.delete(&file).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn mkdir_respects_exist_ok() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend();
        let sub = Locator::local(dir.path().join("sub"));

        backend.mkdir(&sub, false).await.unwrap();
        let err = backend.mkdir(&sub, false).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        backend.mkdir(&sub, true).await.unwrap();
        assert!(backend.stat(&sub).await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn native_copy_of_a_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        std::fs::write(dir.path().join("src/one.txt"), "1").unwrap();
        std::fs::write(dir.path().join("src/nested/two.txt"), "22").unwrap();

        let backend = backend();
        let src = Locator::local(dir.path().join("src"));
        let dst = Locator::local(dir.path().join("dst"));
        backend.copy_to(&src, &backend, &dst).await.unwrap();

        let mut names: Vec<String> = backend
            .iterdir(&dst)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["nested", "one.txt"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("dst/nested/two.txt")).unwrap(),
            "22"
        );
    }

    #[tokio::test]
    async fn wrong_locator_is_rejected() {
        let err = backend().stat(&Locator::object("b", "k")).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }
}
