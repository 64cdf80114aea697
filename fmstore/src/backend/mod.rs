//! Storage backends.
//!
//! Every variant implements the same [`StorageBackend`] operation set over
//! its own [`Locator`] variant:
//! - `local`: the local filesystem, no caching
//! - `object`: an object store, stat/listing cached in the metadata cache
//! - `shell`: a remote host reached through a shell, parsed `ls -la` output cached
//! - `archive`: read-only archive members served from the archive handle cache

pub mod archive;
pub mod local;
pub mod object;
pub mod shell;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};

pub use self::archive::ArchiveBackend;
pub use self::local::LocalBackend;
pub use self::object::ObjectStoreBackend;
pub use self::shell::ShellBackend;

use crate::error::{Result, StorageError};
use crate::locator::{Locator, Scheme};
use crate::types::{DirEntry, Metadata};

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn scheme(&self) -> Scheme;

    /// `Ok(false)` for a missing resource; other failures propagate.
    async fn exists(&self, loc: &Locator) -> Result<bool> {
        match self.stat(loc).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn stat(&self, loc: &Locator) -> Result<Metadata>;

    /// Children of a directory, each with the metadata the listing carried.
    async fn iterdir(&self, loc: &Locator) -> Result<Vec<DirEntry>>;

    async fn read(&self, loc: &Locator) -> Result<Vec<u8>>;

    /// Creates or replaces a file.
    async fn write(&self, loc: &Locator, data: &[u8]) -> Result<()>;

    async fn mkdir(&self, loc: &Locator, exist_ok: bool) -> Result<()>;

    /// Removes a file, or a directory with everything below it.
    async fn delete(&self, loc: &Locator) -> Result<()>;

    /// Copies `src` (file or directory tree) to `dst` on `dest`.
    async fn copy_to(&self, src: &Locator, dest: &dyn StorageBackend, dst: &Locator) -> Result<()>;
}

/// Generic copy through `read`/`write`, recursing into directories.
pub fn stream_copy<'a>(
    source: &'a dyn StorageBackend,
    src: &'a Locator,
    dest: &'a dyn StorageBackend,
    dst: &'a Locator,
) -> BoxFuture<'a, Result<()>> {
    async move {
        if dest.scheme() == Scheme::Archive {
            return Err(StorageError::UnsupportedOperation(format!(
                "archives are read-only: cannot copy into {dst}"
            )));
        }
        let meta = source.stat(src).await?;
        if meta.is_dir() {
            dest.mkdir(dst, true).await?;
            for child in source.iterdir(src).await? {
                stream_copy(source, &src.join(&child.name), dest, &dst.join(&child.name)).await?;
            }
            return Ok(());
        }
        let data = source.read(src).await?;
        tracing::debug!("copying {} bytes {src} -> {dst}", data.len());
        dest.write(dst, &data).await
    }
    .boxed()
}

pub(crate) fn mismatch(expected: Scheme, loc: &Locator) -> StorageError {
    StorageError::InvalidPath(format!(
        "{loc} is not a {} location",
        expected.as_str()
    ))
}

pub(crate) fn read_only(loc: &Locator) -> StorageError {
    StorageError::UnsupportedOperation(format!("archives are read-only: {loc}"))
}
