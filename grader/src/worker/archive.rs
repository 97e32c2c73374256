//! Submission archives, unpacked in place before the build.
//!
//! The kind is sniffed from the content, never from the file name: zip local
//! header, gzip member wrapping a ustar stream, or a bare ustar stream.
use std::{
    fs,
    io::{self, Read},
    os::unix::fs::PermissionsExt,
    path::Path,
};

use flate2::read::GzDecoder;

use super::workspace::{checked_relative_path, WorkspaceError};

/// Bytes one archive may expand to, all entries together.
const MAX_UNPACKED_BYTES: u64 = 64 * 1024 * 1024;
const TAR_BLOCK: usize = 512;
const USTAR_MAGIC_OFFSET: usize = 257;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

fn is_zip_magic(header: &[u8]) -> bool {
    header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06")
}

fn is_gzip_magic(header: &[u8]) -> bool {
    header.starts_with(&[0x1f, 0x8b])
}

fn is_ustar_header(header: &[u8]) -> bool {
    header
        .get(USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + 5)
        .map_or(false, |magic| magic == b"ustar")
}

fn read_header(reader: impl Read) -> io::Result<Vec<u8>> {
    let mut header = Vec::with_capacity(TAR_BLOCK);
    reader.take(TAR_BLOCK as u64).read_to_end(&mut header)?;
    Ok(header)
}

/// `None` for anything that is not an archive, including a gzip stream that
/// does not hold a tar.
pub fn sniff(path: &Path) -> io::Result<Option<ArchiveKind>> {
    let header = read_header(fs::File::open(path)?)?;
    if is_zip_magic(&header) {
        return Ok(Some(ArchiveKind::Zip));
    }
    if is_ustar_header(&header) {
        return Ok(Some(ArchiveKind::Tar));
    }
    if is_gzip_magic(&header) {
        let inner = read_header(GzDecoder::new(fs::File::open(path)?)).unwrap_or_default();
        if is_ustar_header(&inner) {
            return Ok(Some(ArchiveKind::TarGz));
        }
    }
    Ok(None)
}

fn unreadable(archive: &Path, error: impl std::fmt::Display) -> WorkspaceError {
    let name = archive
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    WorkspaceError::Rejected(format!(
        "The submission archive `{}` could not be unpacked: {}",
        name, error
    ))
}

/// Copies entry contents while keeping count of the unpacked total.
struct Extractor<'a> {
    archive: &'a Path,
    dest: &'a Path,
    remaining: u64,
}

impl<'a> Extractor<'a> {
    fn new(archive: &'a Path, dest: &'a Path) -> Self {
        Self {
            archive,
            dest,
            remaining: MAX_UNPACKED_BYTES,
        }
    }

    fn create_dir(&self, name: &str) -> Result<(), WorkspaceError> {
        let target = self.dest.join(checked_relative_path(name)?);
        fs::create_dir_all(target)?;
        Ok(())
    }

    fn write_file(
        &mut self,
        name: &str,
        reader: impl Read,
        mode: Option<u32>,
    ) -> Result<(), WorkspaceError> {
        let target = self.dest.join(checked_relative_path(name)?);
        let mut content = vec![];
        reader
            .take(self.remaining + 1)
            .read_to_end(&mut content)
            .map_err(|e| unreadable(self.archive, e))?;
        let size = content.len() as u64;
        if size > self.remaining {
            return Err(WorkspaceError::Rejected(format!(
                "The submission archive unpacks to more than {} bytes.",
                MAX_UNPACKED_BYTES
            )));
        }
        self.remaining -= size;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, content)?;
        if mode.map_or(false, |mode| mode & 0o111 != 0) {
            fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }
}

fn unpack_zip(archive: &Path, dest: &Path) -> Result<(), WorkspaceError> {
    let mut zip = zip::ZipArchive::new(fs::File::open(archive)?)
        .map_err(|e| unreadable(archive, e))?;
    let mut extractor = Extractor::new(archive, dest);
    for index in 0..zip.len() {
        let entry = zip.by_index(index).map_err(|e| unreadable(archive, e))?;
        let name = entry.name().to_string();
        let mode = entry.unix_mode();
        if entry.is_dir() {
            extractor.create_dir(&name)?;
        } else if mode.map_or(false, |mode| mode & S_IFMT == S_IFLNK) {
            log::debug!("Skipping symlink {} in {:?}", name, archive);
        } else {
            extractor.write_file(&name, entry, mode)?;
        }
    }
    Ok(())
}

fn unpack_tar(archive: &Path, reader: impl Read, dest: &Path) -> Result<(), WorkspaceError> {
    let mut tar = tar::Archive::new(reader);
    let mut extractor = Extractor::new(archive, dest);
    for entry in tar.entries().map_err(|e| unreadable(archive, e))? {
        let entry = entry.map_err(|e| unreadable(archive, e))?;
        let name = entry
            .path()
            .map_err(|e| unreadable(archive, e))?
            .to_string_lossy()
            .into_owned();
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            extractor.create_dir(&name)?;
        } else if kind.is_file() {
            let mode = entry.header().mode().ok();
            extractor.write_file(&name, entry, mode)?;
        } else {
            log::debug!("Skipping {:?} entry {} in {:?}", kind, name, archive);
        }
    }
    Ok(())
}

/// Unpack `archive` next to itself and delete it. Returns `false`, leaving
/// the file untouched, when it is not an archive.
pub fn unpack_if_archive(archive: &Path) -> Result<bool, WorkspaceError> {
    let kind = match sniff(archive)? {
        Some(kind) => kind,
        None => return Ok(false),
    };
    let dest = archive.parent().unwrap_or_else(|| Path::new("."));
    log::debug!("Detected {:?} archive at {:?}, unpacking it", kind, archive);
    match kind {
        ArchiveKind::Zip => unpack_zip(archive, dest)?,
        ArchiveKind::Tar => unpack_tar(archive, fs::File::open(archive)?, dest)?,
        ArchiveKind::TarGz => {
            unpack_tar(archive, GzDecoder::new(fs::File::open(archive)?), dest)?
        }
    }
    fs::remove_file(archive)?;
    Ok(true)
}

#[cfg(test)]
pub mod archive_tests {
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression};

    use super::*;

    fn zip_bytes(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        for (name, content, mode) in entries {
            let options =
                zip::write::SimpleFileOptions::default().unix_permissions(*mode);
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in entries {
            let mut header = tar::Header::new_ustar();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            // `set_path` refuses `..`, write the raw name like a hostile archive would.
            let field = &mut header.as_old_mut().name;
            field[..name.len()].copy_from_slice(name.as_bytes());
            header.set_cksum();
            builder.append(&header, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_zip_is_unpacked_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("upload.zip");
        fs::write(
            &archive,
            zip_bytes(&[
                ("hw1/main.c", b"int main() {}", 0o644),
                ("hw1/run.sh", b"echo hi", 0o755),
            ]),
        )
        .unwrap();
        assert_eq!(sniff(&archive).unwrap(), Some(ArchiveKind::Zip));
        assert!(unpack_if_archive(&archive).unwrap());
        assert!(!archive.exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("hw1/main.c")).unwrap(),
            "int main() {}"
        );
        let mode = fs::metadata(dir.path().join("hw1/run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn test_tar_gz_is_sniffed_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("submission");
        fs::write(&archive, gzip(&tar_bytes(&[("main.py", b"print(1)")]))).unwrap();
        assert_eq!(sniff(&archive).unwrap(), Some(ArchiveKind::TarGz));
        assert!(unpack_if_archive(&archive).unwrap());
        assert_eq!(
            fs::read_to_string(dir.path().join("main.py")).unwrap(),
            "print(1)"
        );
    }

    #[test]
    fn test_plain_files_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("main.c");
        fs::write(&source, "int main() {}").unwrap();
        let compressed = dir.path().join("data.gz");
        fs::write(&compressed, gzip(b"not a tar")).unwrap();
        assert!(!unpack_if_archive(&source).unwrap());
        assert!(!unpack_if_archive(&compressed).unwrap());
        assert!(source.exists() && compressed.exists());
    }

    #[test]
    fn test_escaping_entries_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();

        let archive = work.join("evil.tar");
        fs::write(&archive, tar_bytes(&[("../evil.c", b"x")])).unwrap();
        assert!(matches!(
            unpack_if_archive(&archive),
            Err(WorkspaceError::Rejected(_))
        ));

        let archive = work.join("evil.zip");
        fs::write(&archive, zip_bytes(&[("../../evil.c", b"x", 0o644)])).unwrap();
        assert!(matches!(
            unpack_if_archive(&archive),
            Err(WorkspaceError::Rejected(_))
        ));
        assert!(!dir.path().join("evil.c").exists());
    }

    #[test]
    fn test_corrupt_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"PK\x03\x04 this is not really a zip").unwrap();
        match unpack_if_archive(&archive) {
            Err(WorkspaceError::Rejected(explanation)) => {
                assert!(explanation.contains("`broken.zip` could not be unpacked"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
