use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;

use chrono::NaiveDate;
use zip::ZipArchive;

use super::{ArchiveMember, ArchiveReader, normalize_member};
use crate::types::{EntryKind, Metadata};

/// Reader for zip files. The central directory is read once; members are
/// then fetched by index.
pub struct ZipArchiveReader {
    archive: Mutex<Option<ZipArchive<File>>>,
    members: Vec<ArchiveMember>,
    // member -> central directory index, files only
    index: HashMap<String, usize>,
}

impl ZipArchiveReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut archive = ZipArchive::new(File::open(path)?).map_err(io::Error::other)?;
        let mut members = Vec::with_capacity(archive.len());
        let mut index = HashMap::new();

        for i in 0..archive.len() {
            let entry = archive.by_index(i).map_err(io::Error::other)?;
            let name = normalize_member(entry.name());
            if name.is_empty() {
                continue;
            }
            let kind = if entry.is_dir() { EntryKind::Dir } else { EntryKind::File };
            let mut metadata = Metadata {
                kind,
                size: if kind == EntryKind::File { entry.size() } else { 0 },
                mtime: zip_mtime(entry.last_modified()),
                mode: None,
            };
            if let Some(mode) = entry.unix_mode() {
                metadata = metadata.with_mode(mode & 0o7777);
            }
            if kind == EntryKind::File {
                index.insert(name.clone(), i);
            }
            members.push(ArchiveMember { path: name, metadata });
        }

        tracing::debug!("indexed {} zip members of {}", members.len(), path.display());
        Ok(Self {
            archive: Mutex::new(Some(archive)),
            members,
            index,
        })
    }
}

impl ArchiveReader for ZipArchiveReader {
    fn members(&self) -> &[ArchiveMember] {
        &self.members
    }

    fn read_member(&self, member: &str) -> io::Result<Vec<u8>> {
        let &i = self
            .index
            .get(member)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, member.to_string()))?;
        let mut guard = self.archive.lock().unwrap_or_else(|p| p.into_inner());
        let archive = guard
            .as_mut()
            .ok_or_else(|| io::Error::other("archive reader is closed"))?;
        let mut entry = archive.by_index(i).map_err(io::Error::other)?;
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn close(&self) {
        self.archive.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}

/// Zip timestamps are local wall-clock fields without a zone; they are read
/// as UTC.
fn zip_mtime(stamp: impl Into<Option<zip::DateTime>>) -> SystemTime {
    stamp
        .into()
        .and_then(|dt| {
            NaiveDate::from_ymd_opt(dt.year().into(), dt.month().into(), dt.day().into())?.and_hms_opt(
                dt.hour().into(),
                dt.minute().into(),
                dt.second().into(),
            )
        })
        .map(|naive| SystemTime::from(naive.and_utc()))
        .unwrap_or(SystemTime::UNIX_EPOCH)
}
