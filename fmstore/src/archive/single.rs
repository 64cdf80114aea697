use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;

use super::{ArchiveMember, ArchiveReader, Compression};
use crate::types::Metadata;

/// A lone `.gz`, `.bz2` or `.xz` file, browsed as an archive holding one
/// member named after the file without its compression suffix.
pub struct CompressedFile {
    file: Mutex<Option<File>>,
    compression: Compression,
    members: Vec<ArchiveMember>,
}

impl CompressedFile {
    pub fn open(path: &Path, compression: Compression) -> io::Result<Self> {
        let file = File::open(path)?;
        let mtime = file
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        // The uncompressed size is only known after decoding the stream.
        let size = io::copy(&mut compression.decoder(&file), &mut io::sink())?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "data".to_string());
        Ok(Self {
            file: Mutex::new(Some(file)),
            compression,
            members: vec![ArchiveMember {
                path: name,
                metadata: Metadata::file(size, mtime),
            }],
        })
    }
}

impl ArchiveReader for CompressedFile {
    fn members(&self) -> &[ArchiveMember] {
        &self.members
    }

    fn read_member(&self, member: &str) -> io::Result<Vec<u8>> {
        if self.members.iter().all(|m| m.path != member) {
            return Err(io::Error::new(io::ErrorKind::NotFound, member.to_string()));
        }
        let guard = self.file.lock().unwrap_or_else(|p| p.into_inner());
        let mut file = guard
            .as_ref()
            .ok_or_else(|| io::Error::other("archive reader is closed"))?;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(self.members[0].metadata.size as usize);
        self.compression.decoder(file).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn close(&self) {
        self.file.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn gzip_file_is_a_single_member() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt.gz");
        let mut encoder = flate2::write::GzEncoder::new(File::create(&path).unwrap(), flate2::Compression::default());
        encoder.write_all(b"plain old text").unwrap();
        encoder.finish().unwrap();

        let single = CompressedFile::open(&path, Compression::Gzip).unwrap();
        assert_eq!(single.members().len(), 1);
        assert_eq!(single.members()[0].path, "notes.txt");
        assert_eq!(single.members()[0].metadata.size, 14);
        assert_eq!(single.read_member("notes.txt").unwrap(), b"plain old text");
        // readable twice: each read starts from the top of the stream
        assert_eq!(single.read_member("notes.txt").unwrap(), b"plain old text");
        assert!(single.read_member("other").is_err());
    }

    #[test]
    fn xz_file_is_a_single_member() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.sql.xz");
        let mut encoder = xz2::write::XzEncoder::new(File::create(&path).unwrap(), 6);
        encoder.write_all(b"select 1;").unwrap();
        encoder.finish().unwrap();

        let single = CompressedFile::open(&path, Compression::Xz).unwrap();
        assert_eq!(single.members()[0].path, "dump.sql");
        assert_eq!(single.read_member("dump.sql").unwrap(), b"select 1;");
    }
}
