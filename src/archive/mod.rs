//! Archive skeleton: generic
//! parse-once, mount-as-namespace plumbing shared by `utar`, `uzip`,
//! `urar`, and `extfs`.
//!
//! Each format implements [`ArchiveFormat::parse`] against the whole base
//! file's bytes (read once, held in memory for the archive's lifetime —
//! archives exercised by this crate are small; a production
//! implementation would stream the central directory only and seek for
//! entry data) and returns a flat `(path, metadata)` list. This module
//! turns that list into a [`Namespace`] the same way
//! [`crate::volatile::VolatileFs`] builds one, and a [`Handler`] that
//! walks it.

pub mod extfs;
pub mod rar;
pub mod tar;
pub mod zip;

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::core_types::{OpenFlags, VEntry, VFile};
use crate::error::{ErrorKind, Result};
use crate::handler::{DirEntry, ExtEntry, Handler, HandlerBase, HandlerData, HandlerFlags, LookupOutcome};
use crate::namespace::{Entry, EntryFlags, Namespace};
use crate::refcount::Ref;
use crate::stat::FileType;
use crate::stat::{AvStat, Timespec};

/// How an entry's bytes are laid out in the base file.
#[derive(Clone, Copy, Debug)]
pub enum StorageMethod {
    /// Stored verbatim at `data_offset..data_offset+stored_size`.
    Stored,
    /// Raw-deflate compressed at `data_offset..data_offset+stored_size`;
    /// `size` is the decompressed length.
    Deflated,
    /// Listed (so it appears in `readdir`) but encoded with a method this
    /// schematic parser does not decode (e.g. a rar/zip compression
    /// method beyond stored/deflate). Reads fail with `NotSupported`
    /// rather than silently returning garbage.
    Unsupported,
}

/// One archive entry's location and size. Directory entries (including
/// the root) carry one too, with `is_dir = true` and the storage fields
/// unused, so every entry's `ino` is assigned exactly once, at parse
/// time.
#[derive(Clone, Copy, Debug)]
pub struct ArchEntryMeta {
    pub ino: u64,
    pub is_dir: bool,
    pub data_offset: u64,
    pub stored_size: u64,
    pub size: u64,
    pub method: StorageMethod,
}

impl ArchEntryMeta {
    fn dir(ino: u64) -> Self {
        ArchEntryMeta { ino, is_dir: true, data_offset: 0, stored_size: 0, size: 0, method: StorageMethod::Stored }
    }
}

/// Implemented once per concrete archive format; everything else
/// (namespace construction, dispatch, filecache sharing) is generic.
pub trait ArchiveFormat: Send + Sync + 'static {
    const NAME: &'static str;
    const EXTENSIONS: &'static [ExtEntry];

    /// Parse the whole base file's bytes into a flat list of entries.
    /// Paths use `/` regardless of platform; directories are implied by
    /// intermediate path components and need not be listed explicitly.
    fn parse(data: &[u8]) -> Result<Vec<(PathBuf, ArchEntryMeta)>>;
}

/// A parsed archive: its namespace plus the raw base-file bytes entries
/// are sliced out of, plus the base file's `(dev,ino,size,mtime)`
/// signature at parse time, checked on every reuse against the base
/// file's current signature; a mismatch triggers a fresh parse.
pub struct Archive {
    ns: Namespace,
    data: Vec<u8>,
    signature: (u64, u64, u64, i64),
}

impl Archive {
    pub(crate) fn build<F: ArchiveFormat>(data: Vec<u8>, signature: (u64, u64, u64, i64)) -> Result<Self> {
        let entries = F::parse(&data)?;
        let ns = Namespace::new(EntryFlags::default());
        let root = ns.root();
        root.data.set(ArchEntryMeta::dir(ns.next_tag() + 1));
        for (path, mut meta) in entries {
            let components: Vec<String> = path.components().filter_map(|c| c.as_os_str().to_str().map(String::from)).collect();
            let Some((leaf_name, dirs)) = components.split_last() else {
                continue;
            };
            let mut current = root.clone();
            for dir in dirs {
                current = ns.lookup(&current, Some(dir));
                if current.data.get::<ArchEntryMeta>().is_none() {
                    current.data.set(ArchEntryMeta::dir(ns.next_tag() + 1));
                }
            }
            let leaf = ns.lookup(&current, Some(leaf_name));
            meta.ino = ns.next_tag() + 1;
            leaf.data.set(meta);
        }
        Ok(Archive { ns, data, signature })
    }

    /// The base file's signature this archive was parsed against.
    pub(crate) fn signature(&self) -> (u64, u64, u64, i64) {
        self.signature
    }

    pub(crate) fn root(&self) -> Ref<Entry> {
        self.ns.root()
    }

    pub(crate) fn meta_of(entry: &Ref<Entry>) -> ArchEntryMeta {
        entry.data.get::<ArchEntryMeta>().expect("every namespace entry created by Archive::build carries an ArchEntryMeta")
    }

    pub(crate) fn is_dir(entry: &Ref<Entry>) -> bool {
        Self::meta_of(entry).is_dir
    }

    pub(crate) fn stat_for(&self, entry: &Ref<Entry>, dev: u64) -> AvStat {
        let meta = Self::meta_of(entry);
        if meta.is_dir {
            AvStat::default_for(FileType::Directory, dev, meta.ino)
        } else {
            let mut stat = AvStat::default_for(FileType::Regular, dev, meta.ino);
            stat.size = meta.size;
            stat
        }
    }

    pub(crate) fn read(&self, entry: &Ref<Entry>, buf: &mut [u8], offset: u64) -> Result<usize> {
        let meta = Self::meta_of(entry);
        if meta.is_dir {
            return Err(ErrorKind::IsDir);
        }
        let decoded = self.entry_bytes(&meta)?;
        if offset >= decoded.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = (decoded.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&decoded[start..start + n]);
        Ok(n)
    }

    fn entry_bytes(&self, meta: &ArchEntryMeta) -> Result<std::borrow::Cow<'_, [u8]>> {
        let start = meta.data_offset as usize;
        let end = start.checked_add(meta.stored_size as usize).ok_or(ErrorKind::IO)?;
        if end > self.data.len() {
            return Err(ErrorKind::IO);
        }
        let raw = &self.data[start..end];
        match meta.method {
            StorageMethod::Stored => Ok(std::borrow::Cow::Borrowed(raw)),
            StorageMethod::Deflated => {
                use std::io::Read;
                let mut decoder = flate2::read::DeflateDecoder::new(raw);
                let mut out = Vec::with_capacity(meta.size as usize);
                decoder.read_to_end(&mut out).map_err(|_| ErrorKind::CrcMismatch)?;
                Ok(std::borrow::Cow::Owned(out))
            }
            StorageMethod::Unsupported => Err(ErrorKind::NotSupported),
        }
    }
}

fn base_cache_key(base: &Arc<VEntry>) -> String {
    match base.data.as_path() {
        Some(p) => p.to_string(),
        None => format!("ptr:{:p}", Arc::as_ptr(base)),
    }
}

/// Resolved position within an archive's namespace, stashed as the
/// handler's per-`VEntry`/`VFile` data.
struct Node {
    archive: Arc<Archive>,
    entry: Ref<Entry>,
}

/// Generic archive-mounting handler, instantiated once per concrete
/// [`ArchiveFormat`] (`utar`, `uzip`).
pub struct ArchiveHandler<F: ArchiveFormat> {
    base: HandlerBase,
    ctx: Arc<Context>,
    _format: std::marker::PhantomData<F>,
}

impl<F: ArchiveFormat> ArchiveHandler<F> {
    pub fn new(dev: u64, ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(ArchiveHandler { base: HandlerBase::new(F::NAME, F::EXTENSIONS, "1.0", HandlerFlags::NONE, dev), ctx, _format: std::marker::PhantomData })
    }

    async fn read_base_file(&self, base_entry: &Arc<VEntry>) -> Result<Vec<u8>> {
        let handler = base_entry.mount.handler.clone();
        let flags = OpenFlags { read: true, ..Default::default() };
        let data = handler.open(base_entry, flags).await?;
        let file = Arc::new(VFile::new(base_entry.mount.clone(), data, flags));
        let attr = handler.getattr(&file).await?;
        let mut out = vec![0u8; attr.size as usize];
        let mut filled = 0usize;
        while filled < out.len() {
            let n = crate::ops::pread(&file, &mut out[filled..], filled as u64).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        out.truncate(filled);
        handler.close(&file).await?;
        Ok(out)
    }

    /// Fetches or parses the archive for `base_entry`. A cached archive
    /// is only reused when the base file's current `(dev,ino,size,mtime)`
    /// signature still matches the one it was parsed under; a mismatch
    /// evicts the stale entry and reparses from the base file's current
    /// contents.
    async fn get_or_parse(&self, base_entry: &Arc<VEntry>) -> Result<Arc<Archive>> {
        let key = crate::filecache::compose_key(&base_cache_key(base_entry), F::NAME);
        let current_sig = self.base_signature(base_entry).await?;
        if let Some(existing) = self.ctx.filecache.get(&key).and_then(|a| a.downcast::<Archive>().ok()) {
            if existing.signature() == current_sig {
                return Ok(existing);
            }
            self.ctx.filecache.invalidate(&key);
        }
        let data = self.read_base_file(base_entry).await?;
        let archive = Arc::new(Archive::build::<F>(data, current_sig)?);
        let erased: Arc<dyn Any + Send + Sync> = archive.clone();
        self.ctx.filecache.set(key, &erased);
        Ok(archive)
    }

    async fn base_signature(&self, base_entry: &Arc<VEntry>) -> Result<(u64, u64, u64, i64)> {
        let handler = base_entry.mount.handler.clone();
        let mut flags = OpenFlags { read: true, ..Default::default() };
        flags.noperm = true;
        let data = handler.open(base_entry, flags).await?;
        let file = VFile::new(base_entry.mount.clone(), data, flags);
        let attr = handler.getattr(&file).await?;
        handler.close(&file).await?;
        Ok(attr.signature())
    }

    fn node_of(entry: &Arc<VEntry>) -> Option<Arc<Node>> {
        entry.data.downcast::<Node>()
    }
}

#[async_trait]
impl<F: ArchiveFormat> Handler for ArchiveHandler<F> {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    async fn lookup(&self, base: &Arc<VEntry>, segment: Option<&str>) -> Result<LookupOutcome> {
        let node = match Self::node_of(base) {
            Some(n) => n,
            None => {
                let base_entry = base.mount.base.clone().ok_or(ErrorKind::InvalidArgument)?;
                let archive = self.get_or_parse(&base_entry).await?;
                let root = archive.root();
                Arc::new(Node { archive, entry: root })
            }
        };
        let target = match segment {
            None => node.entry.parent().unwrap_or_else(|| node.entry.clone()),
            Some(name) => node.archive.ns_lookup_existing(&node.entry, name).ok_or(ErrorKind::NoEntry)?,
        };
        let attr = node.archive.stat_for(&target, self.base.dev);
        Ok(LookupOutcome { data: HandlerData::any(Node { archive: node.archive.clone(), entry: target }), attr, symlink_target: None })
    }

    async fn open(&self, entry: &Arc<VEntry>, flags: OpenFlags) -> Result<HandlerData> {
        if flags.wants_write() {
            return Err(ErrorKind::ReadOnlyFs);
        }
        let node = Self::node_of(entry).ok_or(ErrorKind::InvalidArgument)?;
        if flags.directory && !Archive::is_dir(&node.entry) {
            return Err(ErrorKind::NotDir);
        }
        Ok(HandlerData::any(Node { archive: node.archive.clone(), entry: node.entry.clone() }))
    }

    async fn read(&self, file: &VFile, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = file.data.lock().await;
        let node = data.downcast::<Node>().ok_or(ErrorKind::InvalidArgument)?;
        node.archive.read(&node.entry, buf, offset)
    }

    async fn getattr(&self, file: &VFile) -> Result<AvStat> {
        let data = file.data.lock().await;
        let node = data.downcast::<Node>().ok_or(ErrorKind::InvalidArgument)?;
        Ok(node.archive.stat_for(&node.entry, self.base.dev))
    }

    async fn readdir(&self, entry: &Arc<VEntry>) -> Result<Vec<DirEntry>> {
        let node = Self::node_of(entry).ok_or(ErrorKind::InvalidArgument)?;
        if !Archive::is_dir(&node.entry) {
            return Err(ErrorKind::NotDir);
        }
        Ok(node
            .entry
            .children()
            .into_iter()
            .map(|child| {
                let meta = Archive::meta_of(&child);
                let file_type = if meta.is_dir { FileType::Directory } else { FileType::Regular };
                DirEntry { name: child.name(), ino: meta.ino, file_type }
            })
            .collect())
    }

    async fn readlink(&self, _entry: &Arc<VEntry>) -> Result<PathBuf> {
        Err(ErrorKind::InvalidArgument)
    }
}

impl Archive {
    pub(crate) fn ns_lookup_existing(&self, parent: &Ref<Entry>, name: &str) -> Option<Ref<Entry>> {
        self.ns.lookup_existing(parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::tar::TarFormat;
    use crate::config::Config;
    use crate::context::Context;
    use crate::core_types::OpenFlags;

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
        builder.into_inner().unwrap()
    }

    /// Replacing the base tar with a different mtime and different
    /// content must make a fresh `#` resolve observe the new content,
    /// not the cached parse.
    #[tokio::test]
    async fn reopening_after_base_file_replaced_reparses() {
        let ctx = Context::new(Config::default());
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("a.tar");
        std::fs::write(&tar_path, build_tar(&[("x", b"original")])).unwrap();
        filetime::set_file_mtime(&tar_path, filetime::FileTime::from_unix_time(1_000, 0)).unwrap();

        let resolver = crate::bootstrap(ctx, dir.path());
        let file = crate::ops::open(&resolver, "/a.tar#/x", OpenFlags::read_only()).await.unwrap();
        let mut buf = [0u8; 64];
        let n = crate::ops::pread(&file, &mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"original");
        crate::ops::close(&file).await.unwrap();

        std::fs::write(&tar_path, build_tar(&[("x", b"replaced contents!")])).unwrap();
        filetime::set_file_mtime(&tar_path, filetime::FileTime::from_unix_time(2_000, 0)).unwrap();

        let file = crate::ops::open(&resolver, "/a.tar#/x", OpenFlags::read_only()).await.unwrap();
        let mut buf = [0u8; 64];
        let n = crate::ops::pread(&file, &mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"replaced contents!");
    }
}
