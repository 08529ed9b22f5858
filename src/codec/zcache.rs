//! Codec index cache.
//!
//! One `ZCache` accumulates checkpoints for one compressed stream's logical
//! identity (the base file's `(dev, ino, size, mtime)` signature) across
//! every [`crate::codec::zfile::ZFile`] that opens it. Checkpoints are
//! spooled to a scratch index file in the process temp directory,
//! deflate-compressed at level 1 first since most of a decoder's internal
//! state is sparse and compresses well.
//!
//! The index file's disk usage is reported to the process
//! [`crate::diskcache::DiskCacheManager`] as it grows (see [`ZCache::bind`]),
//! so a `ZCache` is itself subject to the global `disk_cache_limit` the same
//! way every other `cacheobj` payload is: evicting the oldest cached index
//! forces the next open to reparse it.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, Weak};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::context::Context;
use crate::error::{ErrorKind, Result};

/// One checkpoint: decoded-stream offset, on-disk offset of its (deflate
/// compressed) serialized state, and that state's length.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointMeta {
    pub decoded_offset: u64,
    pub on_disk_offset: u64,
    pub state_len: u32,
}

static NEXT_ZCACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Random-access index for one compressed stream's logical identity.
pub struct ZCache {
    id: u64,
    decoded_size: AtomicI64,
    index_file: Mutex<std::fs::File>,
    checkpoints: Mutex<Vec<CheckpointMeta>>,
    crc_valid: Mutex<bool>,
    index_bytes: AtomicU64,
    cache_binding: Mutex<Option<(Weak<Context>, u64)>>,
    /// The base file's `(dev,ino,size,mtime)` signature at creation time,
    /// checked by [`crate::codec::CodecHandler`] before reusing a filecache
    /// hit.
    signature: (u64, u64, u64, i64),
}

impl ZCache {
    /// Allocates a fresh scratch index file under `temp_dir`, named
    /// `atmpNNNNNN`.
    pub fn new(temp_dir: &std::path::Path) -> Result<Self> {
        Self::new_with_signature(temp_dir, (0, 0, 0, 0))
    }

    pub fn new_with_signature(temp_dir: &std::path::Path, signature: (u64, u64, u64, i64)) -> Result<Self> {
        let id = NEXT_ZCACHE_ID.fetch_add(1, Ordering::Relaxed);
        let path = temp_dir.join(format!("atmp{id:06}"));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|_| ErrorKind::IO)?;
        mark_cloexec(&file);
        Ok(ZCache {
            id,
            decoded_size: AtomicI64::new(-1),
            index_file: Mutex::new(file),
            checkpoints: Mutex::new(Vec::new()),
            crc_valid: Mutex::new(true),
            index_bytes: AtomicU64::new(0),
            cache_binding: Mutex::new(None),
            signature,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Signature this cache's identity was established against.
    pub fn signature(&self) -> (u64, u64, u64, i64) {
        self.signature
    }

    /// Registers this `ZCache`'s disk usage under `ctx.disk_cache`'s
    /// `cacheobj` identified by `cobj_id` (the caller already created it
    /// wrapping an `Arc` of this same `ZCache`). Every subsequent
    /// [`ZCache::checkpoint`] call reports the index file's new total size
    /// back to the manager, so eviction pressure sees it grow.
    pub fn bind(&self, ctx: &std::sync::Arc<Context>, cobj_id: u64) {
        *self.cache_binding.lock().unwrap() = Some((std::sync::Arc::downgrade(ctx), cobj_id));
    }

    fn report_growth(&self, total_bytes: u64) {
        let Some((weak_ctx, cobj_id)) = self.cache_binding.lock().unwrap().clone() else {
            return;
        };
        let Some(ctx) = weak_ctx.upgrade() else { return };
        if let Some(cobj) = ctx.disk_cache.get_cacheobj(cobj_id) {
            ctx.disk_cache.set_size(&cobj, total_bytes as i64, 0);
        }
    }

    /// Decoded size once discovered, or `None`.
    pub fn size(&self) -> Option<u64> {
        let v = self.decoded_size.load(Ordering::Acquire);
        if v < 0 {
            None
        } else {
            Some(v as u64)
        }
    }

    pub fn set_size(&self, size: u64) {
        self.decoded_size.store(size as i64, Ordering::Release);
    }

    pub fn crc_valid(&self) -> bool {
        *self.crc_valid.lock().unwrap()
    }

    pub fn invalidate_crc(&self) {
        *self.crc_valid.lock().unwrap() = false;
    }

    /// Highest checkpoint with `decoded_offset <= offset`, if any.
    pub fn best_checkpoint_for(&self, offset: u64) -> Option<CheckpointMeta> {
        self.checkpoints.lock().unwrap().iter().filter(|c| c.decoded_offset <= offset).max_by_key(|c| c.decoded_offset).copied()
    }

    /// Serialize+compress `state`, append to the index file, and record a
    /// new checkpoint. `decoded_offset` must be non-decreasing across
    /// calls.
    pub fn checkpoint(&self, decoded_offset: u64, state: &[u8]) -> Result<()> {
        let mut compressed = Vec::new();
        {
            let mut enc = DeflateEncoder::new(&mut compressed, Compression::new(1));
            enc.write_all(state).map_err(|_| ErrorKind::IO)?;
            enc.finish().map_err(|_| ErrorKind::IO)?;
        }
        let mut file = self.index_file.lock().unwrap();
        let on_disk_offset = file.seek(SeekFrom::End(0)).map_err(|_| ErrorKind::IO)?;
        file.write_u32::<LittleEndian>(state.len() as u32).map_err(|_| ErrorKind::IO)?;
        file.write_all(&compressed).map_err(|_| ErrorKind::IO)?;
        drop(file);
        let total_bytes = on_disk_offset + 4 + compressed.len() as u64;
        self.index_bytes.store(total_bytes, Ordering::Release);
        self.checkpoints.lock().unwrap().push(CheckpointMeta {
            decoded_offset,
            on_disk_offset,
            state_len: compressed.len() as u32,
        });
        self.report_growth(total_bytes);
        Ok(())
    }

    /// Current total size of the on-disk index, in bytes.
    pub fn index_bytes(&self) -> u64 {
        self.index_bytes.load(Ordering::Acquire)
    }

    /// Read back and decompress the state recorded at `meta`.
    pub fn restore(&self, meta: CheckpointMeta) -> Result<Vec<u8>> {
        let mut file = self.index_file.lock().unwrap();
        file.seek(SeekFrom::Start(meta.on_disk_offset)).map_err(|_| ErrorKind::IO)?;
        let uncompressed_len = file.read_u32::<LittleEndian>().map_err(|_| ErrorKind::IO)?;
        let mut compressed = vec![0u8; meta.state_len as usize];
        file.read_exact(&mut compressed).map_err(|_| ErrorKind::IO)?;
        drop(file);
        let mut decoder = flate2::read::DeflateDecoder::new(&compressed[..]);
        let mut out = Vec::with_capacity(uncompressed_len as usize);
        decoder.read_to_end(&mut out).map_err(|_| ErrorKind::IO)?;
        Ok(out)
    }
}

#[cfg(unix)]
fn mark_cloexec(file: &std::fs::File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        let fd = file.as_raw_fd();
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
}

#[cfg(not(unix))]
fn mark_cloexec(_file: &std::fs::File) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_then_restore_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let zc = ZCache::new(dir.path()).unwrap();
        zc.checkpoint(1_000_000, b"some decoder state bytes, quite sparse").unwrap();
        let meta = zc.best_checkpoint_for(2_000_000).unwrap();
        assert_eq!(meta.decoded_offset, 1_000_000);
        let restored = zc.restore(meta).unwrap();
        assert_eq!(restored, b"some decoder state bytes, quite sparse");
    }

    #[test]
    fn best_checkpoint_picks_highest_not_exceeding_offset() {
        let dir = tempfile::tempdir().unwrap();
        let zc = ZCache::new(dir.path()).unwrap();
        zc.checkpoint(0, b"a").unwrap();
        zc.checkpoint(1_048_576, b"b").unwrap();
        zc.checkpoint(2_097_152, b"c").unwrap();
        let meta = zc.best_checkpoint_for(1_500_000).unwrap();
        assert_eq!(meta.decoded_offset, 1_048_576);
    }

    #[test]
    fn bound_checkpoint_reports_growth_to_disk_cache() {
        let ctx = Context::new(crate::config::Config::default());
        let dir = tempfile::tempdir().unwrap();
        let zc = std::sync::Arc::new(ZCache::new(dir.path()).unwrap());
        let cobj = ctx.disk_cache.new_cacheobj(zc.clone(), "test-zcache", 0);
        zc.bind(&ctx, cobj.id());

        zc.checkpoint(0, b"some state").unwrap();
        assert_eq!(cobj.diskusage() as u64, zc.index_bytes());
        assert!(cobj.diskusage() > 0);
    }

    #[test]
    fn evicting_the_cacheobj_drops_the_filecache_strong_ref() {
        let ctx = Context::new(crate::config::Config::default());
        let dir = tempfile::tempdir().unwrap();
        let zc = std::sync::Arc::new(ZCache::new(dir.path()).unwrap());
        let cobj = ctx.disk_cache.new_cacheobj(zc.clone(), "test-zcache", 0);
        zc.bind(&ctx, cobj.id());
        let erased: std::sync::Arc<dyn std::any::Any + Send + Sync> = zc.clone();
        ctx.filecache.set("k", &erased);
        drop(zc);
        drop(erased);

        assert!(ctx.filecache.get("k").is_some());
        ctx.disk_cache.clear();
        assert!(ctx.filecache.get("k").is_none());
    }

    #[test]
    fn size_unknown_until_set() {
        let dir = tempfile::tempdir().unwrap();
        let zc = ZCache::new(dir.path()).unwrap();
        assert_eq!(zc.size(), None);
        zc.set_size(4096);
        assert_eq!(zc.size(), Some(4096));
    }
}
