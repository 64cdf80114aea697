use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tar::{Archive, EntryType};

use super::{ArchiveMember, ArchiveReader, Compression, normalize_member};
use crate::types::{EntryKind, Metadata};

/// Reader for plain and compressed (gzip, bzip2, xz) tarballs.
///
/// Plain tarballs remember each member's data offset so a read is one seek.
/// Compressed streams cannot seek, so a read rescans from the start.
pub struct TarArchive {
    file: Mutex<Option<File>>,
    compression: Option<Compression>,
    members: Vec<ArchiveMember>,
    // member -> (data offset, size); only filled for plain tar
    offsets: HashMap<String, (u64, u64)>,
}

impl TarArchive {
    pub fn open(path: &Path, compression: Option<Compression>) -> io::Result<Self> {
        let file = File::open(path)?;
        let mut members = Vec::new();
        let mut offsets = HashMap::new();

        scan(&file, compression, |entry| {
            let Some(kind) = entry_kind(entry.header().entry_type()) else {
                return Ok(true);
            };
            let name = normalize_member(&entry.path()?.to_string_lossy());
            if name.is_empty() {
                return Ok(true);
            }
            let header = entry.header();
            let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(header.mtime().unwrap_or(0));
            let size = if kind == EntryKind::File { entry.size() } else { 0 };
            let mut metadata = Metadata {
                kind,
                size,
                mtime,
                mode: None,
            };
            if let Ok(mode) = header.mode() {
                metadata = metadata.with_mode(mode);
            }
            if compression.is_none() && kind == EntryKind::File {
                offsets.insert(name.clone(), (entry.raw_file_position(), size));
            }
            members.push(ArchiveMember { path: name, metadata });
            Ok(true)
        })?;

        tracing::debug!("indexed {} members of {}", members.len(), path.display());
        Ok(Self {
            file: Mutex::new(Some(file)),
            compression,
            members,
            offsets,
        })
    }

    fn read_plain(file: &File, offset: u64, size: u64) -> io::Result<Vec<u8>> {
        let mut reader = file;
        reader.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(size as usize);
        reader.take(size).read_to_end(&mut buf)?;
        if (buf.len() as u64) < size {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        Ok(buf)
    }

    fn read_streamed(file: &File, compression: Compression, member: &str) -> io::Result<Vec<u8>> {
        let mut found = None;
        scan(file, Some(compression), |entry| {
            if normalize_member(&entry.path()?.to_string_lossy()) != member {
                return Ok(true);
            }
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            found = Some(buf);
            Ok(false)
        })?;
        found.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, member.to_string()))
    }
}

impl ArchiveReader for TarArchive {
    fn members(&self) -> &[ArchiveMember] {
        &self.members
    }

    fn read_member(&self, member: &str) -> io::Result<Vec<u8>> {
        let guard = self.file.lock().unwrap_or_else(|p| p.into_inner());
        let file = guard
            .as_ref()
            .ok_or_else(|| io::Error::other("archive reader is closed"))?;
        match self.offsets.get(member) {
            Some(&(offset, size)) => Self::read_plain(file, offset, size),
            None => match self.compression {
                Some(compression) => Self::read_streamed(file, compression, member),
                None => Err(io::Error::new(io::ErrorKind::NotFound, member.to_string())),
            },
        }
    }

    fn close(&self) {
        self.file.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}

fn entry_kind(ty: EntryType) -> Option<EntryKind> {
    match ty {
        EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => Some(EntryKind::File),
        EntryType::Directory => Some(EntryKind::Dir),
        EntryType::Symlink => Some(EntryKind::Symlink),
        _ => None,
    }
}

/// Walks the entries from the start of `file` until `visit` returns false.
fn scan<'f, F>(file: &'f File, compression: Option<Compression>, mut visit: F) -> io::Result<()>
where
    F: FnMut(&mut tar::Entry<'_, Box<dyn Read + 'f>>) -> io::Result<bool>,
{
    let mut reader = file;
    reader.seek(SeekFrom::Start(0))?;
    let source: Box<dyn Read + 'f> = match compression {
        Some(compression) => compression.decoder(reader),
        None => Box::new(reader),
    };
    let mut archive = Archive::new(source);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !visit(&mut entry)? {
            break;
        }
    }
    Ok(())
}
