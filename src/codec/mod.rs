//! Random-access decompression handlers: `ugz`, `ubz2`,
//! `uxze`, `uzstde`. Each mounts a single compressed file as one synthetic
//! decoded file — `a.gz#` is the decoded stream itself, not a directory —
//! so `lookup` only ever succeeds for the empty (root) segment.
//!
//! The heavy lifting lives in [`zfile::ZFile`] (the seek algorithm) and
//! [`zcache::ZCache`] (the on-disk checkpoint index); this module wires
//! them to the [`crate::handler::Handler`] vtable and the process
//! [`crate::filecache::Filecache`].

pub mod blocking;
pub mod bzip2_codec;
pub mod gzip;
pub mod xz;
pub mod zcache;
pub mod zfile;
pub mod zstd_codec;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::core_types::{OpenFlags, VEntry, VFile};
use crate::error::{ErrorKind, Result};
use crate::handler::{DirEntry, ExtEntry, Handler, HandlerBase, HandlerData, HandlerFlags, LookupOutcome};
use crate::stat::{AvStat, FileType};
use zcache::ZCache;
use zfile::{Format, ZFile};

fn base_cache_key(base: &Arc<VEntry>) -> String {
    match base.data.as_path() {
        Some(p) => p.to_string(),
        None => format!("ptr:{:p}", Arc::as_ptr(base)),
    }
}

/// A live decode session, created on `open` and torn down on `close`.
struct CodecSession {
    zfile: ZFile,
}

/// One codec handler, parameterized by [`Format`]. `ugz`/`ubz2`/`uxze`/
/// `uzstde` are all instances of this with different `(name, extensions,
/// format)` triples.
pub struct CodecHandler {
    base: HandlerBase,
    format: Format,
    ctx: Arc<Context>,
}

impl CodecHandler {
    fn new(name: &'static str, extensions: &'static [ExtEntry], format: Format, dev: u64, ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(CodecHandler { base: HandlerBase::new(name, extensions, "1.0", HandlerFlags::NONE, dev), format, ctx })
    }

    pub fn gzip(dev: u64, ctx: Arc<Context>) -> Arc<Self> {
        static EXTS: &[ExtEntry] = &[crate::handler::ext(".gz"), crate::handler::ext_rewrite(".tgz", ".tar")];
        Self::new("ugz", EXTS, Format::Gzip, dev, ctx)
    }

    pub fn bzip2(dev: u64, ctx: Arc<Context>) -> Arc<Self> {
        static EXTS: &[ExtEntry] = &[crate::handler::ext(".bz2"), crate::handler::ext_rewrite(".tbz2", ".tar")];
        Self::new("ubz2", EXTS, Format::Bzip2, dev, ctx)
    }

    pub fn xz(dev: u64, ctx: Arc<Context>) -> Arc<Self> {
        static EXTS: &[ExtEntry] = &[crate::handler::ext(".xz")];
        Self::new("uxze", EXTS, Format::Xz, dev, ctx)
    }

    pub fn zstd(dev: u64, ctx: Arc<Context>) -> Arc<Self> {
        static EXTS: &[ExtEntry] = &[crate::handler::ext(".zst")];
        Self::new("uzstde", EXTS, Format::Zstd, dev, ctx)
    }

    /// Look up (or build, and register under the process filecache) the
    /// checkpoint index shared by every `ZFile` over this base file, so
    /// paths resolving to the same base file share the parsed object.
    /// Honors the same filecache-staleness invariant as
    /// [`crate::archive::ArchiveHandler::get_or_parse`]: a cached index
    /// whose base file has since changed `(dev,ino,size,mtime)` is
    /// invalidated and rebuilt from scratch.
    async fn get_or_create_zcache(&self, base_file: &Arc<VEntry>) -> Result<Arc<ZCache>> {
        let key = crate::filecache::compose_key(&base_cache_key(base_file), self.base.name);
        let current_sig = self.base_signature(base_file).await?;
        if let Some(existing) = self.ctx.filecache.get(&key).and_then(|a| a.downcast::<ZCache>().ok()) {
            if existing.signature() == current_sig {
                return Ok(existing);
            }
            self.ctx.filecache.invalidate(&key);
        }
        let fresh = Arc::new(ZCache::new_with_signature(&self.ctx.config.temp_dir_base, current_sig)?);
        let cobj = self.ctx.disk_cache.new_cacheobj(fresh.clone(), key.clone(), 0);
        fresh.bind(&self.ctx, cobj.id());
        let erased: Arc<dyn Any + Send + Sync> = fresh.clone();
        self.ctx.filecache.set(key, &erased);
        Ok(fresh)
    }

    async fn base_signature(&self, base_file: &Arc<VEntry>) -> Result<(u64, u64, u64, i64)> {
        let handler = base_file.mount.handler.clone();
        let mut flags = OpenFlags { read: true, ..Default::default() };
        flags.noperm = true;
        let data = handler.open(base_file, flags).await?;
        let file = VFile::new(base_file.mount.clone(), data, flags);
        let attr = handler.getattr(&file).await?;
        handler.close(&file).await?;
        Ok(attr.signature())
    }
}

#[async_trait]
impl Handler for CodecHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    async fn lookup(&self, base: &Arc<VEntry>, segment: Option<&str>) -> Result<LookupOutcome> {
        if segment.is_some() {
            return Err(ErrorKind::NoEntry);
        }
        let base_file = base.mount.base.clone().ok_or(ErrorKind::InvalidArgument)?;
        let zcache = self.get_or_create_zcache(&base_file).await?;
        let mut attr = AvStat::default_for(FileType::Regular, self.base.dev, 2);
        attr.size = zcache.size().unwrap_or(0);
        Ok(LookupOutcome { data: HandlerData::Empty, attr, symlink_target: None })
    }

    async fn open(&self, entry: &Arc<VEntry>, flags: OpenFlags) -> Result<HandlerData> {
        if flags.wants_write() {
            return Err(ErrorKind::ReadOnlyFs);
        }
        let base_entry = entry.mount.base.clone().ok_or(ErrorKind::InvalidArgument)?;
        let zcache = self.get_or_create_zcache(&base_entry).await?;

        let base_handler = base_entry.mount.handler.clone();
        let base_open_flags = OpenFlags { read: true, ..Default::default() };
        let base_data = base_handler.open(&base_entry, base_open_flags).await?;
        let base_file = Arc::new(VFile::new(base_entry.mount.clone(), base_data, base_open_flags));

        let zfile = ZFile::new(base_file, 0, self.format, zcache, self.ctx.config.restore_cost_bytes, self.ctx.config.index_distance);
        Ok(HandlerData::any(CodecSession { zfile }))
    }

    async fn read(&self, file: &VFile, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = file.data.lock().await;
        let session = data.downcast::<CodecSession>().ok_or(ErrorKind::InvalidArgument)?;
        session.zfile.pread(buf, offset).await
    }

    async fn getattr(&self, file: &VFile) -> Result<AvStat> {
        let data = file.data.lock().await;
        let session = data.downcast::<CodecSession>().ok_or(ErrorKind::InvalidArgument)?;
        let mut attr = AvStat::default_for(FileType::Regular, self.base.dev, 2);
        if let Some(size) = session.zfile.cached_size() {
            attr.size = size;
        }
        Ok(attr)
    }

    async fn readdir(&self, _entry: &Arc<VEntry>) -> Result<Vec<DirEntry>> {
        Err(ErrorKind::NotDir)
    }
}
