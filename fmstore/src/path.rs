//! The uniform handle the rest of the application works with.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{ArchiveBackend, LocalBackend, ObjectStoreBackend, ShellBackend, StorageBackend};
use crate::cache::CacheRegistry;
use crate::cadapter::s3::{S3ObjectClient, S3Options};
use crate::cadapter::ssh::SshShell;
use crate::cadapter::{ObjectStoreClient, RemoteShell};
use crate::config::StoreConfig;
use crate::error::{Result, StorageError};
use crate::invalidation::CacheInvalidationCoordinator;
use crate::locator::{Locator, Scheme};
use crate::types::{Metadata, Snapshot};

/// One backend per scheme, all sharing one cache registry.
pub struct StorageContext {
    registry: Arc<CacheRegistry>,
    local: Arc<LocalBackend>,
    archive: Arc<ArchiveBackend>,
    object: Option<Arc<ObjectStoreBackend>>,
    shell: Option<Arc<ShellBackend>>,
}

impl StorageContext {
    /// Local and archive backends only; remote ones are added with the
    /// `with_*` builders.
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self {
            local: Arc::new(LocalBackend::new(registry.clone())),
            archive: Arc::new(ArchiveBackend::new(registry.clone())),
            object: None,
            shell: None,
            registry,
        }
    }

    pub fn with_object_store(mut self, client: Arc<dyn ObjectStoreClient>) -> Self {
        self.object = Some(Arc::new(ObjectStoreBackend::new(client, self.registry.clone())));
        self
    }

    pub fn with_remote_shell(mut self, shell: Arc<dyn RemoteShell>) -> Self {
        self.shell = Some(Arc::new(ShellBackend::new(shell, self.registry.clone())));
        self
    }

    /// All four backends wired to the real S3 and ssh clients.
    pub async fn from_config(config: &StoreConfig, registry: Arc<CacheRegistry>) -> Self {
        let s3 = S3ObjectClient::new(config, S3Options::default()).await;
        Self::new(registry)
            .with_object_store(Arc::new(s3))
            .with_remote_shell(Arc::new(SshShell::new(config.ssh_program.clone())))
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> CacheInvalidationCoordinator {
        CacheInvalidationCoordinator::new(self.registry.clone())
    }

    pub fn backend(&self, scheme: Scheme) -> Result<Arc<dyn StorageBackend>> {
        let backend: Arc<dyn StorageBackend> = match scheme {
            Scheme::Local => self.local.clone(),
            Scheme::Archive => self.archive.clone(),
            Scheme::ObjectStore => self
                .object
                .clone()
                .ok_or_else(|| StorageError::BackendUnavailable("no object store configured".into()))?,
            Scheme::RemoteShell => self
                .shell
                .clone()
                .ok_or_else(|| StorageError::BackendUnavailable("no remote shell configured".into()))?,
        };
        Ok(backend)
    }
}

/// Result of an existence probe that may not reach its backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
    Unknown,
}

/// A location in any backend, optionally carrying the metadata a listing
/// already delivered for it. Any mutation through the handle discards that
/// snapshot.
pub struct PathHandle {
    ctx: Arc<StorageContext>,
    locator: Locator,
    snapshot: Mutex<Option<Snapshot>>,
}

impl Clone for PathHandle {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            locator: self.locator.clone(),
            snapshot: Mutex::new(self.snapshot()),
        }
    }
}

impl fmt::Debug for PathHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathHandle")
            .field("locator", &self.locator)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl fmt::Display for PathHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.locator, f)
    }
}

impl PathHandle {
    pub fn new(ctx: Arc<StorageContext>, locator: Locator) -> Self {
        Self {
            ctx,
            locator,
            snapshot: Mutex::new(None),
        }
    }

    pub fn parse(ctx: Arc<StorageContext>, uri: &str) -> Result<Self> {
        Ok(Self::new(ctx, Locator::from_str(uri)?))
    }

    /// Attaches listing metadata, valid for the registry's metadata ttl.
    pub fn with_snapshot(self, metadata: Metadata) -> Self {
        let ttl = self.ctx.registry().snapshot_ttl();
        *self.snapshot_slot() = Some(Snapshot::new(metadata, ttl));
        self
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn scheme(&self) -> Scheme {
        self.locator.scheme()
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot_slot().clone()
    }

    fn snapshot_slot(&self) -> MutexGuard<'_, Option<Snapshot>> {
        self.snapshot.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drops the listing snapshot so later reads go to the backend, whose
    /// own cache the mutation has already invalidated.
    fn forget_snapshot(&self) {
        self.snapshot_slot().take();
    }

    pub fn name(&self) -> String {
        self.locator.name()
    }

    pub fn is_remote(&self) -> bool {
        self.locator.is_remote()
    }

    pub fn parent(&self) -> Option<PathHandle> {
        self.locator
            .parent()
            .map(|loc| PathHandle::new(self.ctx.clone(), loc))
    }

    pub fn join(&self, name: &str) -> PathHandle {
        PathHandle::new(self.ctx.clone(), self.locator.join(name))
    }

    fn backend(&self) -> Result<Arc<dyn StorageBackend>> {
        self.ctx.backend(self.scheme())
    }

    fn fresh_snapshot(&self) -> Option<Metadata> {
        self.snapshot_slot().as_ref().and_then(Snapshot::fresh).cloned()
    }

    pub async fn exists(&self) -> Result<bool> {
        if self.fresh_snapshot().is_some() {
            return Ok(true);
        }
        self.backend()?.exists(&self.locator).await
    }

    /// Like [`exists`](Self::exists), but an unreachable backend yields
    /// [`Presence::Unknown`] instead of an error.
    pub async fn presence(&self) -> Result<Presence> {
        match self.exists().await {
            Ok(true) => Ok(Presence::Present),
            Ok(false) => Ok(Presence::Absent),
            Err(e) if e.is_unavailable() => {
                tracing::debug!("presence of {self} unknown: {e}");
                Ok(Presence::Unknown)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn stat(&self) -> Result<Metadata> {
        if let Some(meta) = self.fresh_snapshot() {
            return Ok(meta);
        }
        self.backend()?.stat(&self.locator).await
    }

    pub async fn is_dir(&self) -> Result<bool> {
        match self.stat().await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn is_file(&self) -> Result<bool> {
        match self.stat().await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Children, each carrying the metadata the listing reported.
    pub async fn iterdir(&self) -> Result<Vec<PathHandle>> {
        let entries = self.backend()?.iterdir(&self.locator).await?;
        Ok(entries
            .into_iter()
            .map(|entry| self.join(&entry.name).with_snapshot(entry.metadata))
            .collect())
    }

    pub async fn read_bytes(&self) -> Result<Vec<u8>> {
        self.backend()?.read(&self.locator).await
    }

    pub async fn read_text(&self) -> Result<String> {
        let bytes = self.read_bytes().await?;
        String::from_utf8(bytes)
            .map_err(|e| StorageError::Other(format!("{self} is not valid UTF-8: {e}")))
    }

    pub async fn write_bytes(&self, data: &[u8]) -> Result<()> {
        let result = self.backend()?.write(&self.locator, data).await;
        self.forget_snapshot();
        result
    }

    pub async fn write_text(&self, text: &str) -> Result<()> {
        self.write_bytes(text.as_bytes()).await
    }

    pub async fn mkdir(&self, exist_ok: bool) -> Result<()> {
        let result = self.backend()?.mkdir(&self.locator, exist_ok).await;
        self.forget_snapshot();
        result
    }

    pub async fn delete(&self) -> Result<()> {
        let result = self.backend()?.delete(&self.locator).await;
        self.forget_snapshot();
        result
    }

    /// Copies this file or tree to `dest`. Without `overwrite`, an existing
    /// destination is an `AlreadyExists` error.
    pub async fn copy_to(&self, dest: &PathHandle, overwrite: bool) -> Result<()> {
        if dest.scheme() == Scheme::Archive {
            return Err(StorageError::UnsupportedOperation(format!(
                "archives are read-only: cannot copy into {dest}"
            )));
        }
        if !overwrite && dest.exists().await? {
            return Err(StorageError::AlreadyExists(dest.to_string()));
        }
        let target = dest.backend()?;
        let result = self
            .backend()?
            .copy_to(&self.locator, target.as_ref(), &dest.locator)
            .await;
        dest.forget_snapshot();
        result
    }
}
