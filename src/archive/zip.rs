//! `uzip`: the zip archive format. Grounded
//! on `original_source/modules/uzip.c`'s `ecrec`/`cdirentry`/`ldirentry`
//! layouts (standard PKZIP end-of-central-directory record, central
//! directory entries, local file headers — all little-endian, no zip64).
//! Only `STORED` (method 0) and raw `DEFLATE` (method 8) entries are
//! decodable; anything else is listed but reads `NotSupported`.

use std::path::PathBuf;

use byteorder::{ByteOrder, LittleEndian};

use crate::archive::{ArchEntryMeta, ArchiveFormat, StorageMethod};
use crate::error::{ErrorKind, Result};
use crate::handler::{ext, ExtEntry};

const EOCD_SIG: u32 = 0x0605_4b50;
const CDIR_SIG: u32 = 0x0201_4b50;
const LOCAL_SIG: u32 = 0x0403_4b50;
const EOCD_SIZE: usize = 22;
const CDIR_FIXED_SIZE: usize = 46;
const LOCAL_FIXED_SIZE: usize = 30;

pub struct ZipFormat;

impl ArchiveFormat for ZipFormat {
    const NAME: &'static str = "uzip";
    const EXTENSIONS: &'static [ExtEntry] = &[ext(".zip")];

    fn parse(data: &[u8]) -> Result<Vec<(PathBuf, ArchEntryMeta)>> {
        let eocd_pos = find_eocd(data).ok_or(ErrorKind::IO)?;
        let cdir_entries = LittleEndian::read_u16(&data[eocd_pos + 10..]) as usize;
        let cdir_off = LittleEndian::read_u32(&data[eocd_pos + 16..]) as usize;

        let mut out = Vec::new();
        let mut pos = cdir_off;
        for _ in 0..cdir_entries {
            if pos + CDIR_FIXED_SIZE > data.len() || LittleEndian::read_u32(&data[pos..]) != CDIR_SIG {
                return Err(ErrorKind::IO);
            }
            let method = LittleEndian::read_u16(&data[pos + 10..]);
            let comp_size = LittleEndian::read_u32(&data[pos + 20..]) as u64;
            let file_size = LittleEndian::read_u32(&data[pos + 24..]) as u64;
            let fname_len = LittleEndian::read_u16(&data[pos + 28..]) as usize;
            let extra_len = LittleEndian::read_u16(&data[pos + 30..]) as usize;
            let comment_len = LittleEndian::read_u16(&data[pos + 32..]) as usize;
            let local_off = LittleEndian::read_u32(&data[pos + 42..]) as usize;
            let name_bytes = data.get(pos + CDIR_FIXED_SIZE..pos + CDIR_FIXED_SIZE + fname_len).ok_or(ErrorKind::IO)?;
            let name = String::from_utf8_lossy(name_bytes).into_owned();
            let is_dir = name.ends_with('/');

            pos += CDIR_FIXED_SIZE + fname_len + extra_len + comment_len;

            if is_dir {
                out.push((
                    PathBuf::from(name),
                    ArchEntryMeta { ino: 0, is_dir: true, data_offset: 0, stored_size: 0, size: 0, method: StorageMethod::Stored },
                ));
                continue;
            }

            let data_offset = local_data_offset(data, local_off)?;
            let storage_method = match method {
                0 => StorageMethod::Stored,
                8 => StorageMethod::Deflated,
                _ => StorageMethod::Unsupported,
            };
            out.push((
                PathBuf::from(name),
                ArchEntryMeta { ino: 0, is_dir: false, data_offset, stored_size: comp_size, size: file_size, method: storage_method },
            ));
        }
        Ok(out)
    }
}

/// Scans backward for the end-of-central-directory signature, allowing
/// for a trailing zip comment. A production implementation should cap
/// the backward scan; here it's bounded by the whole file since test
/// fixtures are small.
fn find_eocd(data: &[u8]) -> Option<usize> {
    if data.len() < EOCD_SIZE {
        return None;
    }
    let start = data.len() - EOCD_SIZE;
    for pos in (0..=start).rev() {
        if LittleEndian::read_u32(&data[pos..]) == EOCD_SIG {
            return Some(pos);
        }
    }
    None
}

fn local_data_offset(data: &[u8], local_off: usize) -> Result<u64> {
    if local_off + LOCAL_FIXED_SIZE > data.len() || LittleEndian::read_u32(&data[local_off..]) != LOCAL_SIG {
        return Err(ErrorKind::IO);
    }
    let fname_len = LittleEndian::read_u16(&data[local_off + 26..]) as usize;
    let extra_len = LittleEndian::read_u16(&data[local_off + 28..]) as usize;
    Ok((local_off + LOCAL_FIXED_SIZE + fname_len + extra_len) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archive;
    use std::io::Write;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut cdir = Vec::new();
        let mut offsets = Vec::new();
        for (name, content) in entries {
            offsets.push(out.len() as u32);
            let mut local = Vec::new();
            local.extend_from_slice(&LOCAL_SIG.to_le_bytes());
            local.extend_from_slice(&[20, 0]); // need_version
            local.extend_from_slice(&[0, 0]); // flag
            local.extend_from_slice(&[0, 0]); // method: stored
            local.extend_from_slice(&[0, 0, 0, 0]); // mod time/date
            local.extend_from_slice(&[0, 0, 0, 0]); // crc
            local.extend_from_slice(&(content.len() as u32).to_le_bytes()); // comp size
            local.extend_from_slice(&(content.len() as u32).to_le_bytes()); // uncomp size
            local.extend_from_slice(&(name.len() as u16).to_le_bytes());
            local.extend_from_slice(&0u16.to_le_bytes()); // extra len
            local.extend_from_slice(name.as_bytes());
            local.extend_from_slice(content);
            out.write_all(&local).unwrap();
        }
        for ((name, content), local_off) in entries.iter().zip(&offsets) {
            let mut cd = Vec::new();
            cd.extend_from_slice(&CDIR_SIG.to_le_bytes());
            cd.extend_from_slice(&[20, 0]); // version made by
            cd.extend_from_slice(&[20, 0]); // version needed
            cd.extend_from_slice(&[0, 0]); // flag
            cd.extend_from_slice(&[0, 0]); // method
            cd.extend_from_slice(&[0, 0, 0, 0]); // time/date
            cd.extend_from_slice(&[0, 0, 0, 0]); // crc
            cd.extend_from_slice(&(content.len() as u32).to_le_bytes());
            cd.extend_from_slice(&(content.len() as u32).to_le_bytes());
            cd.extend_from_slice(&(name.len() as u16).to_le_bytes());
            cd.extend_from_slice(&0u16.to_le_bytes()); // extra len
            cd.extend_from_slice(&0u16.to_le_bytes()); // comment len
            cd.extend_from_slice(&[0, 0]); // disk start
            cd.extend_from_slice(&[0, 0]); // int attr
            cd.extend_from_slice(&[0, 0, 0, 0]); // ext attr
            cd.extend_from_slice(&local_off.to_le_bytes());
            cd.extend_from_slice(name.as_bytes());
            cdir.extend_from_slice(&cd);
        }
        let cdir_off = out.len() as u32;
        out.extend_from_slice(&cdir);
        let mut eocd = Vec::new();
        eocd.extend_from_slice(&EOCD_SIG.to_le_bytes());
        eocd.extend_from_slice(&[0, 0]); // this disk
        eocd.extend_from_slice(&[0, 0]); // cdir disk
        eocd.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        eocd.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        eocd.extend_from_slice(&(cdir.len() as u32).to_le_bytes());
        eocd.extend_from_slice(&cdir_off.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes()); // comment len
        out.extend_from_slice(&eocd);
        out
    }

    #[test]
    fn finds_eocd_and_lists_stored_entry() {
        let bytes = build_zip(&[("hello.txt", b"hi zip")]);
        let archive = Archive::build::<ZipFormat>(bytes, (0, 0, 0, 0)).unwrap();
        let root = archive.root();
        let entry = archive.ns_lookup_existing(&root, "hello.txt").expect("file listed");
        let mut buf = [0u8; 6];
        let n = archive.read(&entry, &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hi zip");
    }

    #[test]
    fn nested_path_creates_directory() {
        let bytes = build_zip(&[("a/b/c.txt", b"nested")]);
        let archive = Archive::build::<ZipFormat>(bytes, (0, 0, 0, 0)).unwrap();
        let root = archive.root();
        let a = archive.ns_lookup_existing(&root, "a").unwrap();
        assert!(Archive::is_dir(&a));
        let b = archive.ns_lookup_existing(&a, "b").unwrap();
        assert!(Archive::is_dir(&b));
        assert!(archive.ns_lookup_existing(&b, "c.txt").is_some());
    }
}
