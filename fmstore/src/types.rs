//! Plain metadata values shared by every backend and both caches.

use std::time::{Duration, SystemTime};

use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// What a stat call yields, independent of the backend that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: SystemTime,
    /// Permission bits when the backend knows them.
    pub mode: Option<u32>,
}

impl Metadata {
    pub fn file(size: u64, mtime: SystemTime) -> Self {
        Self {
            kind: EntryKind::File,
            size,
            mtime,
            mode: None,
        }
    }

    pub fn dir(mtime: SystemTime) -> Self {
        Self {
            kind: EntryKind::Dir,
            size: 0,
            mtime,
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }
}

/// One child produced by a directory listing, with the metadata the listing
/// call already carried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub metadata: Metadata,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            name: name.into(),
            metadata,
        }
    }
}

/// Metadata captured once (typically by a listing) and attached to a handle.
///
/// A snapshot is trusted only for as long as the cache entry it was harvested
/// alongside would have been.
#[derive(Clone, Debug)]
pub struct Snapshot {
    metadata: Metadata,
    captured_at: Instant,
    ttl: Duration,
}

impl Snapshot {
    pub fn new(metadata: Metadata, ttl: Duration) -> Self {
        Self {
            metadata,
            captured_at: Instant::now(),
            ttl,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn is_fresh(&self) -> bool {
        self.captured_at.elapsed() <= self.ttl
    }

    /// The metadata, or `None` once the snapshot outlived its ttl.
    pub fn fresh(&self) -> Option<&Metadata> {
        self.is_fresh().then_some(&self.metadata)
    }
}
