//! Read-only archive readers and the handle the archive cache hands out.
//!
//! Readers are blocking; callers run them on the blocking pool.

pub mod single;
pub mod tar;
pub mod zip;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use xz2::read::XzDecoder;

use crate::error::{Result, StorageError};
use crate::types::{DirEntry, Metadata};

pub use self::single::CompressedFile;
pub use self::tar::TarArchive;
pub use self::zip::ZipArchiveReader;

/// One member as recorded by the archive itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveMember {
    pub path: String,
    pub metadata: Metadata,
}

/// Member listing plus per-member byte access for one archive file.
pub trait ArchiveReader: Send + Sync {
    fn members(&self) -> &[ArchiveMember];

    fn read_member(&self, member: &str) -> io::Result<Vec<u8>>;

    /// Releases the underlying file. Reads after `close` fail.
    fn close(&self);
}

/// Opens the concrete reader for an archive file.
pub trait ArchiveOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn ArchiveReader>>;
}

/// Stream compression wrapped around a tarball or a single file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
    Xz,
}

impl Compression {
    pub(crate) fn decoder<'r>(self, inner: impl Read + 'r) -> Box<dyn Read + 'r> {
        match self {
            Compression::Gzip => Box::new(GzDecoder::new(inner)),
            Compression::Bzip2 => Box::new(BzDecoder::new(inner)),
            Compression::Xz => Box::new(XzDecoder::new(inner)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    CompressedTar(Compression),
    Zip,
    /// One compressed file, exposed as a single-member archive.
    Compressed(Compression),
}

const EXTENSIONS: [(&str, ArchiveFormat); 12] = [
    (".tar.gz", ArchiveFormat::CompressedTar(Compression::Gzip)),
    (".tgz", ArchiveFormat::CompressedTar(Compression::Gzip)),
    (".tar.bz2", ArchiveFormat::CompressedTar(Compression::Bzip2)),
    (".tbz2", ArchiveFormat::CompressedTar(Compression::Bzip2)),
    (".tbz", ArchiveFormat::CompressedTar(Compression::Bzip2)),
    (".tar.xz", ArchiveFormat::CompressedTar(Compression::Xz)),
    (".txz", ArchiveFormat::CompressedTar(Compression::Xz)),
    (".tar", ArchiveFormat::Tar),
    (".zip", ArchiveFormat::Zip),
    (".gz", ArchiveFormat::Compressed(Compression::Gzip)),
    (".bz2", ArchiveFormat::Compressed(Compression::Bzip2)),
    (".xz", ArchiveFormat::Compressed(Compression::Xz)),
];

impl ArchiveFormat {
    /// Format implied by the file name; compound extensions win.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        EXTENSIONS
            .iter()
            .find(|(ext, _)| lower.ends_with(ext))
            .map(|(_, fmt)| *fmt)
    }

    /// Format implied by the leading bytes of the file. A compressed stream
    /// is reported as [`ArchiveFormat::Compressed`]; whether it wraps a
    /// tarball is decided by the caller.
    pub fn from_signature(head: &[u8]) -> Option<Self> {
        if head.starts_with(&[0x1f, 0x8b]) {
            Some(ArchiveFormat::Compressed(Compression::Gzip))
        } else if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
            Some(ArchiveFormat::Zip)
        } else if head.starts_with(b"BZh") {
            Some(ArchiveFormat::Compressed(Compression::Bzip2))
        } else if head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Some(ArchiveFormat::Compressed(Compression::Xz))
        } else if is_tar_header(head) {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }

    pub fn compression(&self) -> Option<Compression> {
        match self {
            ArchiveFormat::CompressedTar(c) | ArchiveFormat::Compressed(c) => Some(*c),
            ArchiveFormat::Tar | ArchiveFormat::Zip => None,
        }
    }
}

fn is_tar_header(head: &[u8]) -> bool {
    head.len() >= 262 && &head[257..262] == b"ustar"
}

pub fn is_archive_name(name: &str) -> bool {
    ArchiveFormat::from_name(name).is_some()
}

/// Picks a reader by magic bytes, using the extension to tell a compressed
/// tarball from a single compressed file.
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatOpener;

impl FormatOpener {
    fn detect(path: &Path) -> Result<ArchiveFormat> {
        let io_err = |e| StorageError::from_io(e, path.display().to_string());
        let mut head = Vec::with_capacity(512);
        File::open(path)
            .and_then(|f| f.take(512).read_to_end(&mut head))
            .map_err(io_err)?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let by_name = ArchiveFormat::from_name(&name);
        let Some(by_signature) = ArchiveFormat::from_signature(&head) else {
            return by_name.ok_or_else(|| {
                StorageError::UnsupportedOperation(format!("{} is not a recognised archive", path.display()))
            });
        };
        let ArchiveFormat::Compressed(compression) = by_signature else {
            return Ok(by_signature);
        };
        if let Some(named) = by_name.filter(|f| f.compression() == Some(compression)) {
            return Ok(named);
        }

        // Misleading or missing extension: look inside the stream.
        let mut inner = Vec::with_capacity(512);
        let file = File::open(path).map_err(io_err)?;
        let sniffed = compression.decoder(file).take(512).read_to_end(&mut inner);
        if sniffed.is_ok() && is_tar_header(&inner) {
            Ok(ArchiveFormat::CompressedTar(compression))
        } else {
            Ok(ArchiveFormat::Compressed(compression))
        }
    }
}

impl ArchiveOpener for FormatOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn ArchiveReader>> {
        let format = Self::detect(path)?;
        tracing::debug!("{} detected as {format:?}", path.display());
        let io_err = |e| StorageError::from_io(e, path.display().to_string());
        let reader: Box<dyn ArchiveReader> = match format {
            ArchiveFormat::Tar => Box::new(TarArchive::open(path, None).map_err(io_err)?),
            ArchiveFormat::CompressedTar(c) => Box::new(TarArchive::open(path, Some(c)).map_err(io_err)?),
            ArchiveFormat::Zip => Box::new(ZipArchiveReader::open(path).map_err(io_err)?),
            ArchiveFormat::Compressed(c) => Box::new(CompressedFile::open(path, c).map_err(io_err)?),
        };
        Ok(reader)
    }
}

/// An open archive: the reader plus a member index with implied directories
/// filled in.
pub struct ArchiveHandle {
    path: PathBuf,
    entries: BTreeMap<String, Metadata>,
    reader: Box<dyn ArchiveReader>,
    open: AtomicBool,
}

impl std::fmt::Debug for ArchiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl ArchiveHandle {
    pub fn open(opener: &dyn ArchiveOpener, path: &Path) -> Result<Self> {
        let reader = opener.open(path)?;
        let root_mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut entries = BTreeMap::new();
        entries.insert(String::new(), Metadata::dir(root_mtime));
        for member in reader.members() {
            let mut parent = member.path.as_str();
            while let Some(idx) = parent.rfind('/') {
                parent = &parent[..idx];
                entries
                    .entry(parent.to_string())
                    .or_insert_with(|| Metadata::dir(member.metadata.mtime));
            }
            // An explicit entry wins over one implied by a deeper member.
            entries.insert(member.path.clone(), member.metadata.clone());
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            reader,
            open: AtomicBool::new(true),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn stat(&self, member: &str) -> Option<&Metadata> {
        self.entries.get(member)
    }

    /// Direct children of `member`, or `None` when it is not a directory.
    pub fn children(&self, member: &str) -> Option<Vec<DirEntry>> {
        if !self.stat(member)?.is_dir() {
            return None;
        }
        let prefix = if member.is_empty() {
            String::new()
        } else {
            format!("{member}/")
        };
        let children = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, meta)| {
                let rest = &path[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| DirEntry::new(rest, meta.clone()))
            })
            .collect();
        Some(children)
    }

    /// Blocking read of one member's bytes.
    pub fn read(&self, member: &str) -> io::Result<Vec<u8>> {
        if !self.is_open() {
            return Err(io::Error::other(format!(
                "archive handle for {} is closed",
                self.path.display()
            )));
        }
        self.reader.read_member(member)
    }

    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.reader.close();
            tracing::debug!("closed archive handle {}", self.path.display());
        }
    }
}

impl Drop for ArchiveHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Member path as stored in the index: no `./`, no leading or trailing `/`.
pub(crate) fn normalize_member(raw: &str) -> String {
    raw.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}
