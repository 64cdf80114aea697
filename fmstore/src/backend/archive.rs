use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::{StorageBackend, mismatch, read_only, stream_copy};
use crate::archive::ArchiveHandle;
use crate::cache::{CacheOp, CacheRegistry, CachedMeta, canonical_archive_path};
use crate::error::{Result, StorageError};
use crate::invalidation::archive_namespace;
use crate::locator::{ArchiveLocator, Locator, Scheme};
use crate::types::{DirEntry, Metadata};

/// Read-only view of archive members. Handles come from the registry's
/// archive cache; stat and listing answers are also kept in the metadata
/// cache under namespace `archive:<canonical archive path>`.
pub struct ArchiveBackend {
    registry: Arc<CacheRegistry>,
}

impl ArchiveBackend {
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self { registry }
    }

    fn locator<'a>(&self, loc: &'a Locator) -> Result<&'a ArchiveLocator> {
        match loc {
            Locator::Archive(a) => Ok(a),
            other => Err(mismatch(Scheme::Archive, other)),
        }
    }

    fn archive_path(a: &ArchiveLocator) -> Result<PathBuf> {
        canonical_archive_path(&a.archive_path)
    }

    async fn handle(&self, a: &ArchiveLocator) -> Result<Arc<ArchiveHandle>> {
        self.registry.archives().get_handler(&Self::archive_path(a)?).await
    }
}

#[async_trait]
impl StorageBackend for ArchiveBackend {
    fn scheme(&self) -> Scheme {
        Scheme::Archive
    }

    async fn stat(&self, loc: &Locator) -> Result<Metadata> {
        let a = self.locator(loc)?;
        let ns = archive_namespace(&Self::archive_path(a)?);
        let cache = self.registry.metadata();
        match cache.get(CacheOp::Stat, &ns, &a.member) {
            Some(CachedMeta::Stat(meta)) => return Ok(meta),
            Some(CachedMeta::Missing) => return Err(StorageError::NotFound(loc.to_string())),
            _ => {}
        }

        let handle = self.handle(a).await?;
        match handle.stat(&a.member) {
            Some(meta) => {
                cache.put(CacheOp::Stat, &ns, &a.member, CachedMeta::Stat(meta.clone()));
                Ok(meta.clone())
            }
            None => {
                cache.put_with_ttl(CacheOp::Stat, &ns, &a.member, CachedMeta::Missing, cache.error_ttl());
                Err(StorageError::NotFound(loc.to_string()))
            }
        }
    }

    async fn iterdir(&self, loc: &Locator) -> Result<Vec<DirEntry>> {
        let a = self.locator(loc)?;
        let ns = archive_namespace(&Self::archive_path(a)?);
        let cache = self.registry.metadata();
        if let Some(CachedMeta::Listing(entries)) = cache.get(CacheOp::Listing, &ns, &a.member) {
            return Ok(entries.as_ref().clone());
        }

        let handle = self.handle(a).await?;
        let entries = match handle.children(&a.member) {
            Some(entries) => entries,
            None if handle.stat(&a.member).is_some() => {
                return Err(StorageError::UnsupportedOperation(format!("{loc} is not a directory")));
            }
            None => return Err(StorageError::NotFound(loc.to_string())),
        };

        for entry in &entries {
            let child = if a.is_root() {
                entry.name.clone()
            } else {
                format!("{}/{}", a.member, entry.name)
            };
            cache.put(CacheOp::Stat, &ns, &child, CachedMeta::Stat(entry.metadata.clone()));
        }
        cache.put(CacheOp::Listing, &ns, &a.member, CachedMeta::Listing(Arc::new(entries.clone())));
        Ok(entries)
    }

    async fn read(&self, loc: &Locator) -> Result<Vec<u8>> {
        let a = self.locator(loc)?;
        let mut handle = self.handle(a).await?;
        match handle.stat(&a.member) {
            Some(meta) if meta.is_dir() => {
                return Err(StorageError::UnsupportedOperation(format!("{loc} is a directory")));
            }
            Some(_) => {}
            None => return Err(StorageError::NotFound(loc.to_string())),
        }
        if !handle.is_open() {
            // evicted between lookup and use
            handle = self.handle(a).await?;
        }
        let member = a.member.clone();
        let what = loc.to_string();
        tokio::task::spawn_blocking(move || handle.read(&member))
            .await
            .map_err(|e| StorageError::Other(format!("archive read task failed: {e}")))?
            .map_err(|e| StorageError::from_io(e, what))
    }

    async fn write(&self, loc: &Locator, _data: &[u8]) -> Result<()> {
        Err(read_only(loc))
    }

    async fn mkdir(&self, loc: &Locator, _exist_ok: bool) -> Result<()> {
        Err(read_only(loc))
    }

    async fn delete(&self, loc: &Locator) -> Result<()> {
        Err(read_only(loc))
    }

    async fn copy_to(&self, src: &Locator, dest: &dyn StorageBackend, dst: &Locator) -> Result<()> {
        stream_copy(self, src, dest, dst).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::config::StoreConfig;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs::File;
    use std::path::Path;

    fn build_tgz(path: &Path) {
        let encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in [("top.txt", &b"top"[..]), ("dir1/file3.txt", &b"three"[..])] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn registry() -> Arc<CacheRegistry> {
        Arc::new(CacheRegistry::new(&StoreConfig::default()))
    }

    #[tokio::test]
    async fn browse_and_read_members() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tgz");
        build_tgz(&path);
        let registry = registry();
        let backend = ArchiveBackend::new(registry.clone());

        let root = Locator::archive(&path, "");
        assert!(backend.stat(&root).await.unwrap().is_dir());
        let mut names: Vec<String> = backend
            .iterdir(&root)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["dir1", "top.txt"]);

        let member = Locator::archive(&path, "dir1/file3.txt");
        assert_eq!(backend.stat(&member).await.unwrap().size, 5);
        assert_eq!(backend.read(&member).await.unwrap(), b"three");
        assert!(!backend.exists(&Locator::archive(&path, "nope")).await.unwrap());
        assert_eq!(registry.archives().get_stats().open_handles, 1);
    }

    #[tokio::test]
    async fn archive_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tgz");
        build_tgz(&path);
        let backend = ArchiveBackend::new(registry());
        let member = Locator::archive(&path, "top.txt");

        assert!(matches!(
            backend.write(&member, b"x").await.unwrap_err(),
            StorageError::UnsupportedOperation(_)
        ));
        assert!(matches!(
            backend.delete(&member).await.unwrap_err(),
            StorageError::UnsupportedOperation(_)
        ));
    }

    #[tokio::test]
    async fn copy_out_of_archive_and_not_into_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tgz");
        build_tgz(&path);
        let registry = registry();
        let archive = ArchiveBackend::new(registry.clone());
        let local = LocalBackend::new(registry);

        let out = Locator::local(dir.path().join("out"));
        archive
            .copy_to(&Locator::archive(&path, "dir1"), &local, &out)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/file3.txt")).unwrap(),
            "three"
        );

        let err = local
            .copy_to(&out.join("file3.txt"), &archive, &Locator::archive(&path, "x.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedOperation(_)));
    }

    #[tokio::test]
    async fn zip_members_are_browsable() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        writer
            .start_file("docs/readme.md", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"# zipped").unwrap();
        writer.finish().unwrap();

        let backend = ArchiveBackend::new(registry());
        let names: Vec<String> = backend
            .iterdir(&Locator::archive(&path, ""))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["docs"]);
        let member = Locator::archive(&path, "docs/readme.md");
        assert_eq!(backend.read(&member).await.unwrap(), b"# zipped");
    }

    #[tokio::test]
    async fn lone_gzip_file_is_one_member() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(b"line one\nline two\n").unwrap();
        encoder.finish().unwrap();

        let backend = ArchiveBackend::new(registry());
        let entries = backend.iterdir(&Locator::archive(&path, "")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "server.log");
        assert_eq!(entries[0].metadata.size, 18);
        let member = Locator::archive(&path, "server.log");
        assert_eq!(backend.read(&member).await.unwrap(), b"line one\nline two\n");
    }

    #[tokio::test]
    async fn compressed_tarball_without_extension_is_sniffed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.data");
        build_tgz(&path);
        let backend = ArchiveBackend::new(registry());

        let member = Locator::archive(&path, "dir1/file3.txt");
        assert_eq!(backend.read(&member).await.unwrap(), b"three");
    }
}
