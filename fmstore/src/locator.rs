//! Scheme-tagged locators.
//!
//! URI forms accepted by [`Locator::from_str`]:
//!
//! ```text
//! /abs/or/relative/path          local filesystem (also `file:///...`)
//! s3://bucket/key                object store (`objectstore://` is an alias)
//! ssh://host/abs/path            remote shell
//! archive:///path/to/a.tar#dir/m archive member; empty member is the archive root
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, StorageError};

const S3_PREFIX: &str = "s3://";
const OBJECTSTORE_PREFIX: &str = "objectstore://";
const SSH_PREFIX: &str = "ssh://";
const ARCHIVE_PREFIX: &str = "archive://";
const FILE_PREFIX: &str = "file://";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Local,
    ObjectStore,
    RemoteShell,
    Archive,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Local => "file",
            Scheme::ObjectStore => "s3",
            Scheme::RemoteShell => "ssh",
            Scheme::Archive => "archive",
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Scheme::ObjectStore | Scheme::RemoteShell)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LocalLocator {
    pub path: PathBuf,
}

/// `key` is empty for the bucket root; directory keys may end with `/`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectLocator {
    pub bucket: String,
    pub key: String,
}

/// `path` is an absolute posix path without a trailing slash (except `/`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShellLocator {
    pub host: String,
    pub path: String,
}

/// `member` has no leading or trailing slash; empty means the archive root.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArchiveLocator {
    pub archive_path: PathBuf,
    pub member: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Locator {
    Local(LocalLocator),
    ObjectStore(ObjectLocator),
    RemoteShell(ShellLocator),
    Archive(ArchiveLocator),
}

impl LocalLocator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ObjectLocator {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn namespace(&self) -> String {
        format!("s3:{}", self.bucket)
    }

    pub fn is_bucket_root(&self) -> bool {
        self.key.trim_matches('/').is_empty()
    }

    /// Key without the directory-marker slash.
    pub fn trimmed_key(&self) -> &str {
        self.key.trim_end_matches('/')
    }

    /// Prefix under which this location's children are listed.
    pub fn list_prefix(&self) -> String {
        if self.is_bucket_root() {
            String::new()
        } else {
            format!("{}/", self.trimmed_key())
        }
    }
}

impl ShellLocator {
    pub fn new(host: impl Into<String>, path: &str) -> Self {
        Self {
            host: host.into(),
            path: normalize_posix(path),
        }
    }

    pub fn namespace(&self) -> String {
        format!("ssh:{}", self.host)
    }

    pub fn parent_path(&self) -> Option<String> {
        if self.path == "/" {
            return None;
        }
        match self.path.rfind('/') {
            Some(0) | None => Some("/".to_string()),
            Some(idx) => Some(self.path[..idx].to_string()),
        }
    }
}

impl ArchiveLocator {
    pub fn new(archive_path: impl Into<PathBuf>, member: &str) -> Self {
        Self {
            archive_path: archive_path.into(),
            member: member.trim_matches('/').to_string(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.member.is_empty()
    }
}

fn normalize_posix(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

fn last_segment(s: &str) -> &str {
    let s = s.trim_end_matches('/');
    s.rsplit('/').next().unwrap_or(s)
}

impl Locator {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Locator::Local(LocalLocator::new(path))
    }

    pub fn object(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Locator::ObjectStore(ObjectLocator::new(bucket, key))
    }

    pub fn shell(host: impl Into<String>, path: &str) -> Self {
        Locator::RemoteShell(ShellLocator::new(host, path))
    }

    pub fn archive(archive_path: impl Into<PathBuf>, member: &str) -> Self {
        Locator::Archive(ArchiveLocator::new(archive_path, member))
    }

    pub fn scheme(&self) -> Scheme {
        match self {
            Locator::Local(_) => Scheme::Local,
            Locator::ObjectStore(_) => Scheme::ObjectStore,
            Locator::RemoteShell(_) => Scheme::RemoteShell,
            Locator::Archive(_) => Scheme::Archive,
        }
    }

    /// Final path component; the bucket, host or archive file name at a root.
    pub fn name(&self) -> String {
        match self {
            Locator::Local(l) => l
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Locator::ObjectStore(o) if o.is_bucket_root() => o.bucket.clone(),
            Locator::ObjectStore(o) => last_segment(&o.key).to_string(),
            Locator::RemoteShell(s) if s.path == "/" => s.host.clone(),
            Locator::RemoteShell(s) => last_segment(&s.path).to_string(),
            Locator::Archive(a) if a.is_root() => a
                .archive_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Locator::Archive(a) => last_segment(&a.member).to_string(),
        }
    }

    /// Logical parent. The parent of an archive root is the directory holding
    /// the archive file.
    pub fn parent(&self) -> Option<Locator> {
        match self {
            Locator::Local(l) => l.path.parent().map(Locator::local),
            Locator::ObjectStore(o) => {
                if o.is_bucket_root() {
                    return None;
                }
                let key = o.trimmed_key();
                let parent = match key.rfind('/') {
                    Some(idx) => format!("{}/", &key[..idx]),
                    None => String::new(),
                };
                Some(Locator::object(o.bucket.clone(), parent))
            }
            Locator::RemoteShell(s) => s
                .parent_path()
                .map(|p| Locator::shell(s.host.clone(), &p)),
            Locator::Archive(a) => {
                if a.is_root() {
                    return a.archive_path.parent().map(Locator::local);
                }
                let parent = match a.member.rfind('/') {
                    Some(idx) => &a.member[..idx],
                    None => "",
                };
                Some(Locator::archive(a.archive_path.clone(), parent))
            }
        }
    }

    pub fn join(&self, name: &str) -> Locator {
        let name = name.trim_matches('/');
        match self {
            Locator::Local(l) => Locator::local(l.path.join(name)),
            Locator::ObjectStore(o) => {
                let key = if o.is_bucket_root() {
                    name.to_string()
                } else {
                    format!("{}/{name}", o.trimmed_key())
                };
                Locator::object(o.bucket.clone(), key)
            }
            Locator::RemoteShell(s) => Locator::shell(s.host.clone(), &format!("{}/{name}", s.path)),
            Locator::Archive(a) => {
                let member = if a.is_root() {
                    name.to_string()
                } else {
                    format!("{}/{name}", a.member)
                };
                Locator::archive(a.archive_path.clone(), &member)
            }
        }
    }

    /// Same location seen as a directory (object-store keys gain a trailing `/`).
    pub fn as_dir(&self) -> Locator {
        match self {
            Locator::ObjectStore(o) if !o.is_bucket_root() => {
                Locator::object(o.bucket.clone(), o.list_prefix())
            }
            other => other.clone(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.scheme().is_remote()
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Local(l) => write!(f, "{}", l.path.display()),
            Locator::ObjectStore(o) => write!(f, "{S3_PREFIX}{}/{}", o.bucket, o.key),
            Locator::RemoteShell(s) => write!(f, "{SSH_PREFIX}{}{}", s.host, s.path),
            Locator::Archive(a) => write!(
                f,
                "{ARCHIVE_PREFIX}{}#{}",
                a.archive_path.display(),
                a.member
            ),
        }
    }
}

impl FromStr for Locator {
    type Err = StorageError;

    fn from_str(uri: &str) -> Result<Self> {
        if let Some(rest) = uri.strip_prefix(ARCHIVE_PREFIX) {
            // Only the first `#` separates; later ones belong to the member path.
            let (archive, member) = rest.split_once('#').unwrap_or((rest, ""));
            if archive.is_empty() {
                return Err(StorageError::InvalidPath(format!(
                    "missing archive file in {uri}"
                )));
            }
            let archive_path = std::path::absolute(Path::new(archive))
                .map_err(|e| StorageError::InvalidPath(format!("{uri}: {e}")))?;
            return Ok(Locator::archive(archive_path, member));
        }

        if let Some(rest) = uri
            .strip_prefix(S3_PREFIX)
            .or_else(|| uri.strip_prefix(OBJECTSTORE_PREFIX))
        {
            let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(StorageError::InvalidPath(format!("missing bucket in {uri}")));
            }
            return Ok(Locator::object(bucket, key));
        }

        if let Some(rest) = uri.strip_prefix(SSH_PREFIX) {
            let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
            if host.is_empty() {
                return Err(StorageError::InvalidPath(format!("missing hostname in {uri}")));
            }
            return Ok(Locator::shell(host, path));
        }

        let path = uri.strip_prefix(FILE_PREFIX).unwrap_or(uri);
        if path.is_empty() {
            return Err(StorageError::InvalidPath("empty path".into()));
        }
        Ok(Locator::local(path))
    }
}
