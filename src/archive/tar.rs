//! `utar`: the tar archive format. Follows the standard POSIX ustar
//! header layout (octal-encoded fields, GNU long-name extension), but
//! the actual header parsing is delegated to the `tar` crate rather than
//! hand-rolled — it's used purely as a byte-layout cursor, while AVFS's
//! own [`crate::archive::Archive`] still owns the namespace and the read
//! path.

use std::io::Cursor;
use std::path::PathBuf;

use crate::archive::{ArchEntryMeta, ArchiveFormat, StorageMethod};
use crate::error::{ErrorKind, Result};
use crate::handler::{ext, ExtEntry};

pub struct TarFormat;

impl ArchiveFormat for TarFormat {
    const NAME: &'static str = "utar";
    const EXTENSIONS: &'static [ExtEntry] = &[ext(".tar")];

    fn parse(data: &[u8]) -> Result<Vec<(PathBuf, ArchEntryMeta)>> {
        let mut archive = tar::Archive::new(Cursor::new(data));
        let mut out = Vec::new();
        let entries = archive.entries().map_err(|_| ErrorKind::IO)?;
        for entry in entries {
            let entry = entry.map_err(|_| ErrorKind::IO)?;
            let header = entry.header();
            let entry_type = header.entry_type();
            // Hard/symbolic links carry no data block of their own in a
            // tar stream; this parser lists regular files and
            // directories only.
            if !entry_type.is_file() && !entry_type.is_dir() {
                continue;
            }
            let path = match entry.path() {
                Ok(p) => p.into_owned(),
                Err(_) => continue,
            };
            let is_dir = entry_type.is_dir();
            let size = entry.size();
            let data_offset = entry.raw_file_position();
            out.push((
                path,
                ArchEntryMeta { ino: 0, is_dir, data_offset, stored_size: size, size, method: StorageMethod::Stored },
            ));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archive;
    use std::io::Write;

    fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, *content).unwrap();
        }
        let mut out = builder.into_inner().unwrap();
        out.flush().unwrap();
        out
    }

    #[test]
    fn parses_nested_file_and_creates_parent_dirs() {
        let bytes = build_tar(&[("dir/file.txt", b"hello tar")]);
        let archive = Archive::build::<TarFormat>(bytes, (0, 0, 0, 0)).unwrap();
        let root = archive.root();
        let dir = archive.ns_lookup_existing(&root, "dir").expect("dir entry");
        assert!(Archive::is_dir(&dir));
        let file = archive.ns_lookup_existing(&dir, "file.txt").expect("file entry");
        assert!(!Archive::is_dir(&file));
        let mut buf = [0u8; 9];
        let n = archive.read(&file, &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello tar");
    }
}
