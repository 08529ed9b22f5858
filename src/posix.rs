//! POSIX façade: translates the `Result<T, ErrorKind>` boundary every
//! other module uses into the `(rc, errno)` convention a C caller expects.
//! Rust
//! has no thread-local `errno` to set, so both halves of that pair travel
//! together as one negative return: `0`/positive on success, `-errno` on
//! failure (a plain `-1` has no information a caller could act on).
//!
//! This stops at the translation boundary. It does not bind to any real
//! kernel file-descriptor table, `/proc/self/fd`, or syscall path; the
//! `i32` handles handed out here are private to one [`PosixFs`] and mean
//! nothing outside it. A caller embedding AVFS behind an actual FUSE or
//! NFS front end keeps its own handle table and uses [`crate::ops`]
//! directly instead of this module.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::core_types::{OpenFlags, VFile, Whence};
use crate::error::{ErrorKind, Result};
use crate::handler::DirEntry;
use crate::ops::{self, SetAttrChange};
use crate::resolve::Resolver;
use crate::stat::AvStat;

/// `-1` with `errno` unset; used for argument errors this layer catches
/// itself (an unknown fd) rather than ones a handler returned.
const EBADF_RC: i32 = -1;

fn rc_of<T>(result: Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => -e.to_errno(),
    }
}

fn errno(kind: ErrorKind) -> i32 {
    -kind.to_errno()
}

/// A POSIX-flavored handle table layered over one [`Resolver`]. Every
/// method here mirrors one `av_*` call in [`crate::ops`], translated to
/// the `(rc, errno)` shape.
pub struct PosixFs {
    resolver: Resolver,
    open_files: DashMap<i32, Arc<VFile>>,
    next_fd: AtomicI32,
}

impl PosixFs {
    pub fn new(resolver: Resolver) -> Self {
        PosixFs { resolver, open_files: DashMap::new(), next_fd: AtomicI32::new(3) }
    }

    fn file_for(&self, fd: i32) -> Option<Arc<VFile>> {
        self.open_files.get(&fd).map(|entry| entry.clone())
    }

    /// `open(path, flags)` -> fd, or `-errno`.
    pub async fn open(&self, path: &str, flags: OpenFlags) -> i32 {
        match ops::open(&self.resolver, path, flags).await {
            Ok(file) => {
                let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
                self.open_files.insert(fd, file);
                fd
            }
            Err(e) => errno(e),
        }
    }

    /// `close(fd)` -> 0, or `-errno`.
    pub async fn close(&self, fd: i32) -> i32 {
        let Some((_, file)) = self.open_files.remove(&fd) else {
            return EBADF_RC;
        };
        rc_of(ops::close(&file).await)
    }

    /// `read(fd, buf)` -> bytes read, or `-errno`.
    pub async fn read(&self, fd: i32, buf: &mut [u8]) -> i64 {
        let Some(file) = self.file_for(fd) else {
            return EBADF_RC as i64;
        };
        match ops::read(&file, buf).await {
            Ok(n) => n as i64,
            Err(e) => errno(e) as i64,
        }
    }

    /// `pread(fd, buf, offset)` -> bytes read, or `-errno`.
    pub async fn pread(&self, fd: i32, buf: &mut [u8], offset: u64) -> i64 {
        let Some(file) = self.file_for(fd) else {
            return EBADF_RC as i64;
        };
        match ops::pread(&file, buf, offset).await {
            Ok(n) => n as i64,
            Err(e) => errno(e) as i64,
        }
    }

    /// `write(fd, buf)` -> bytes written, or `-errno`.
    pub async fn write(&self, fd: i32, buf: &[u8]) -> i64 {
        let Some(file) = self.file_for(fd) else {
            return EBADF_RC as i64;
        };
        match ops::write(&file, buf).await {
            Ok(n) => n as i64,
            Err(e) => errno(e) as i64,
        }
    }

    /// `lseek(fd, offset, whence)` -> new position, or `-errno`.
    pub async fn lseek(&self, fd: i32, offset: i64, whence: Whence) -> i64 {
        let Some(file) = self.file_for(fd) else {
            return EBADF_RC as i64;
        };
        match ops::lseek(&file, offset, whence).await {
            Ok(pos) => pos as i64,
            Err(e) => errno(e) as i64,
        }
    }

    /// `fstat(fd)`.
    pub async fn fstat(&self, fd: i32) -> std::result::Result<AvStat, i32> {
        let Some(file) = self.file_for(fd) else {
            return Err(EBADF_RC);
        };
        ops::fgetattr(&file).await.map_err(errno)
    }

    /// `stat(path)`.
    pub async fn stat(&self, path: &str) -> std::result::Result<AvStat, i32> {
        ops::getattr(&self.resolver, path).await.map_err(errno)
    }

    /// `readdir(path)`.
    pub async fn readdir(&self, path: &str) -> std::result::Result<Vec<DirEntry>, i32> {
        ops::readdir(&self.resolver, path).await.map_err(errno)
    }

    pub async fn setattr(&self, path: &str, changes: &SetAttrChange) -> std::result::Result<AvStat, i32> {
        ops::setattr(&self.resolver, path, changes).await.map_err(errno)
    }

    pub async fn access(&self, path: &str, mask: u32) -> i32 {
        rc_of(ops::access(&self.resolver, path, mask).await)
    }

    pub async fn readlink(&self, path: &str) -> std::result::Result<PathBuf, i32> {
        ops::readlink(&self.resolver, path).await.map_err(errno)
    }

    pub async fn unlink(&self, path: &str) -> i32 {
        rc_of(ops::unlink(&self.resolver, path).await)
    }

    pub async fn rmdir(&self, path: &str) -> i32 {
        rc_of(ops::rmdir(&self.resolver, path).await)
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> i32 {
        rc_of(ops::mkdir(&self.resolver, path, mode).await)
    }

    pub async fn mknod(&self, path: &str, mode: u32) -> i32 {
        rc_of(ops::mknod(&self.resolver, path, mode).await)
    }

    pub async fn symlink(&self, path: &str, target: &Path) -> i32 {
        rc_of(ops::symlink(&self.resolver, path, target).await)
    }

    pub async fn rename(&self, from: &str, to: &str) -> i32 {
        rc_of(ops::rename(&self.resolver, from, to).await)
    }

    pub async fn link(&self, source: &str, new_path: &str) -> i32 {
        rc_of(ops::link(&self.resolver, source, new_path).await)
    }

    pub async fn truncate(&self, path: &str, size: i64) -> i32 {
        rc_of(ops::truncate(&self.resolver, path, size).await)
    }

    pub async fn ftruncate(&self, fd: i32, size: i64) -> i32 {
        let Some(file) = self.file_for(fd) else {
            return EBADF_RC;
        };
        rc_of(ops::ftruncate(&self.resolver, &file, size).await)
    }

    /// Number of handles this table currently has open; exposed for
    /// tests and diagnostics, not part of the POSIX surface.
    pub fn open_count(&self) -> usize {
        self.open_files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::Context;

    fn fixture() -> (PosixFs, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello world").unwrap();
        let ctx = Context::new(Config::default());
        let resolver = crate::bootstrap(ctx, dir.path());
        (PosixFs::new(resolver), dir)
    }

    #[tokio::test]
    async fn open_read_close_roundtrip() {
        let (posix, _dir) = fixture();
        let fd = posix.open("/hello.txt", OpenFlags::read_only()).await;
        assert!(fd >= 0);
        let mut buf = [0u8; 32];
        let n = posix.read(fd, &mut buf).await;
        assert_eq!(n, 11);
        assert_eq!(&buf[..11], b"hello world");
        assert_eq!(posix.close(fd).await, 0);
        assert_eq!(posix.open_count(), 0);
    }

    #[tokio::test]
    async fn unknown_fd_reports_bad_descriptor() {
        let (posix, _dir) = fixture();
        let mut buf = [0u8; 8];
        assert_eq!(posix.read(99, &mut buf).await, EBADF_RC as i64);
        assert_eq!(posix.close(99).await, EBADF_RC);
    }

    #[tokio::test]
    async fn open_on_missing_path_maps_errno() {
        let (posix, _dir) = fixture();
        let fd = posix.open("/nope.txt", OpenFlags::read_only()).await;
        assert_eq!(fd, errno(ErrorKind::NoEntry));
    }

    #[tokio::test]
    async fn stat_reports_file_size() {
        let (posix, _dir) = fixture();
        let stat = posix.stat("/hello.txt").await.unwrap();
        assert_eq!(stat.size, 11);
    }

    #[tokio::test]
    async fn mkdir_then_readdir_sees_new_directory() {
        let (posix, _dir) = fixture();
        assert_eq!(posix.mkdir("/sub", 0o755).await, 0);
        let entries = posix.readdir("/").await.unwrap();
        assert!(entries.iter().any(|e| e.name == "sub"));
    }
}
