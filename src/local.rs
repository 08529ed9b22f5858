//! The native/local handler: the bottom mount layer every [`crate::resolve::Resolver`]
//! walk starts from, a native path at the bottom of the `ventry` stack.
//!
//! Every other handler's `base` ventry eventually resolves down to this one.
//! It is a thin, direct wrapper over `tokio::fs`; there is no caching,
//! refcounted archive object, or namespace here --- the real filesystem
//! already provides all of that.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::core_types::{OpenFlags, VEntry, VFile};
use crate::error::{ErrorKind, Result};
use crate::handler::{DirEntry, ExtEntry, Handler, HandlerBase, HandlerData, HandlerFlags, LookupOutcome};
use crate::ops::SetAttrChange;
use crate::stat::{AvStat, Device, FileType, Timespec};

static EXTENSIONS: &[ExtEntry] = &[];

/// Wraps a real directory tree. `root` anchors relative virtual paths;
/// `"".to_string()` (the empty [`HandlerData::Path`]) means the root
/// itself.
pub struct LocalFs {
    base: HandlerBase,
    root: PathBuf,
}

impl LocalFs {
    pub fn new(dev: u64, root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(LocalFs { base: HandlerBase::new("local", EXTENSIONS, "1.0", HandlerFlags::NONE, dev), root: root.into() })
    }

    fn path_of(&self, data: &HandlerData) -> Result<String> {
        match data {
            HandlerData::Empty => Ok(String::new()),
            HandlerData::Path(p) => Ok(p.clone()),
            HandlerData::Any(_) => Err(ErrorKind::InvalidArgument),
        }
    }

    fn full_path(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel.trim_start_matches('/'))
        }
    }

    async fn stat_path(&self, path: &Path) -> Result<AvStat> {
        let meta = tokio::fs::symlink_metadata(path).await.map_err(io_err)?;
        Ok(meta_to_avstat(&meta, self.base.dev))
    }
}

fn io_err(e: std::io::Error) -> ErrorKind {
    match e.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NoEntry,
        std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        std::io::ErrorKind::AlreadyExists => ErrorKind::Exists,
        _ => ErrorKind::IO,
    }
}

#[cfg(unix)]
fn meta_to_avstat(meta: &std::fs::Metadata, dev: u64) -> AvStat {
    use std::os::unix::fs::MetadataExt;
    let file_type = if meta.is_dir() {
        FileType::Directory
    } else if meta.file_type().is_symlink() {
        FileType::Symlink
    } else {
        FileType::Regular
    };
    AvStat {
        dev,
        ino: meta.ino(),
        file_type,
        mode: meta.mode() & 0o7777,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: Device { major: 0, minor: 0 },
        size: meta.size(),
        blksize: meta.blksize() as u32,
        blocks: meta.blocks(),
        atime: Timespec { seconds: meta.atime(), nanos: meta.atime_nsec() as u32 },
        mtime: Timespec { seconds: meta.mtime(), nanos: meta.mtime_nsec() as u32 },
        ctime: Timespec { seconds: meta.ctime(), nanos: meta.ctime_nsec() as u32 },
    }
}

#[cfg(not(unix))]
fn meta_to_avstat(meta: &std::fs::Metadata, dev: u64) -> AvStat {
    let file_type = if meta.is_dir() { FileType::Directory } else { FileType::Regular };
    let mut stat = AvStat::default_for(file_type, dev, 0);
    stat.size = meta.len();
    stat
}

#[async_trait]
impl Handler for LocalFs {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    async fn lookup(&self, base: &Arc<VEntry>, segment: Option<&str>) -> Result<LookupOutcome> {
        let base_path = self.path_of(&base.data)?;
        let rel = match segment {
            None => base_path.rsplit_once('/').map(|(p, _)| p.to_string()).unwrap_or_default(),
            Some(name) => {
                if base_path.is_empty() {
                    name.to_string()
                } else {
                    format!("{base_path}/{name}")
                }
            }
        };
        let full = self.full_path(&rel);
        let attr = self.stat_path(&full).await?;
        let symlink_target = if attr.file_type == FileType::Symlink {
            let target = tokio::fs::read_link(&full).await.map_err(io_err)?;
            Some(if target.is_absolute() {
                crate::handler::SymlinkTarget::Absolute(target)
            } else {
                crate::handler::SymlinkTarget::Relative(target)
            })
        } else {
            None
        };
        Ok(LookupOutcome { data: HandlerData::Path(rel), attr, symlink_target })
    }

    async fn open(&self, entry: &Arc<VEntry>, flags: OpenFlags) -> Result<HandlerData> {
        let rel = self.path_of(&entry.data)?;
        let full = self.full_path(&rel);
        if flags.create {
            let mut options = tokio::fs::OpenOptions::new();
            options.read(true).write(flags.write).create(true).truncate(flags.trunc).create_new(flags.excl);
            options.open(&full).await.map_err(io_err)?;
        }
        Ok(HandlerData::Path(rel))
    }

    async fn read(&self, file: &VFile, buf: &mut [u8], offset: u64) -> Result<usize> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};
        let rel = self.path_of(&*file.data.lock().await)?;
        let full = self.full_path(&rel);
        let mut f = tokio::fs::File::open(&full).await.map_err(io_err)?;
        f.seek(std::io::SeekFrom::Start(offset)).await.map_err(io_err)?;
        let n = f.read(buf).await.map_err(io_err)?;
        Ok(n)
    }

    async fn write(&self, file: &VFile, buf: &[u8], offset: u64) -> Result<usize> {
        use tokio::io::{AsyncSeekExt, AsyncWriteExt};
        let rel = self.path_of(&*file.data.lock().await)?;
        let full = self.full_path(&rel);
        let mut f = tokio::fs::OpenOptions::new().write(true).open(&full).await.map_err(io_err)?;
        f.seek(std::io::SeekFrom::Start(offset)).await.map_err(io_err)?;
        let n = f.write(buf).await.map_err(io_err)?;
        Ok(n)
    }

    async fn getattr(&self, file: &VFile) -> Result<AvStat> {
        let rel = self.path_of(&*file.data.lock().await)?;
        self.stat_path(&self.full_path(&rel)).await
    }

    async fn readdir(&self, entry: &Arc<VEntry>) -> Result<Vec<DirEntry>> {
        let rel = self.path_of(&entry.data)?;
        let full = self.full_path(&rel);
        let mut rd = tokio::fs::read_dir(&full).await.map_err(io_err)?;
        let mut out = Vec::new();
        while let Some(dirent) = rd.next_entry().await.map_err(io_err)? {
            let meta = dirent.metadata().await.map_err(io_err)?;
            let stat = meta_to_avstat(&meta, self.base.dev);
            out.push(DirEntry { name: dirent.file_name().to_string_lossy().into_owned(), ino: stat.ino, file_type: stat.file_type });
        }
        Ok(out)
    }

    async fn setattr(&self, entry: &Arc<VEntry>, changes: &SetAttrChange) -> Result<AvStat> {
        let rel = self.path_of(&entry.data)?;
        let full = self.full_path(&rel);
        if let Some(size) = changes.size {
            let f = tokio::fs::OpenOptions::new().write(true).open(&full).await.map_err(io_err)?;
            f.set_len(size).await.map_err(io_err)?;
        }
        #[cfg(unix)]
        if let Some(mode) = changes.mode {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode)).await.map_err(io_err)?;
        }
        self.stat_path(&full).await
    }

    async fn access(&self, _entry: &Arc<VEntry>, _mask: u32) -> Result<()> {
        Ok(())
    }

    async fn readlink(&self, entry: &Arc<VEntry>) -> Result<PathBuf> {
        let rel = self.path_of(&entry.data)?;
        tokio::fs::read_link(self.full_path(&rel)).await.map_err(io_err)
    }

    async fn unlink(&self, parent: &Arc<VEntry>, name: &str) -> Result<()> {
        let rel = self.path_of(&parent.data)?;
        let full = self.full_path(&rel).join(name);
        tokio::fs::remove_file(&full).await.map_err(io_err)
    }

    async fn rmdir(&self, parent: &Arc<VEntry>, name: &str) -> Result<()> {
        let rel = self.path_of(&parent.data)?;
        let full = self.full_path(&rel).join(name);
        tokio::fs::remove_dir(&full).await.map_err(io_err)
    }

    async fn mkdir(&self, parent: &Arc<VEntry>, name: &str, mode: u32) -> Result<AvStat> {
        let rel = self.path_of(&parent.data)?;
        let full = self.full_path(&rel).join(name);
        tokio::fs::create_dir(&full).await.map_err(io_err)?;
        let _ = mode;
        self.stat_path(&full).await
    }

    async fn mknod(&self, parent: &Arc<VEntry>, name: &str, mode: u32) -> Result<AvStat> {
        let rel = self.path_of(&parent.data)?;
        let full = self.full_path(&rel).join(name);
        tokio::fs::OpenOptions::new().write(true).create_new(true).open(&full).await.map_err(io_err)?;
        let _ = mode;
        self.stat_path(&full).await
    }

    async fn rename(&self, from_parent: &Arc<VEntry>, from_name: &str, to_parent: &Arc<VEntry>, to_name: &str) -> Result<()> {
        let from_rel = self.path_of(&from_parent.data)?;
        let to_rel = self.path_of(&to_parent.data)?;
        let from_full = self.full_path(&from_rel).join(from_name);
        let to_full = self.full_path(&to_rel).join(to_name);
        tokio::fs::rename(&from_full, &to_full).await.map_err(io_err)
    }

    async fn link(&self, source: &Arc<VEntry>, new_parent: &Arc<VEntry>, new_name: &str) -> Result<()> {
        let source_rel = self.path_of(&source.data)?;
        let new_rel = self.path_of(&new_parent.data)?;
        let source_full = self.full_path(&source_rel);
        let new_full = self.full_path(&new_rel).join(new_name);
        tokio::fs::hard_link(&source_full, &new_full).await.map_err(io_err)
    }

    async fn symlink(&self, parent: &Arc<VEntry>, name: &str, target: &Path) -> Result<AvStat> {
        #[cfg(unix)]
        {
            let rel = self.path_of(&parent.data)?;
            let full = self.full_path(&rel).join(name);
            tokio::fs::symlink(target, &full).await.map_err(io_err)?;
            self.stat_path(&full).await
        }
        #[cfg(not(unix))]
        {
            let _ = (parent, name, target);
            Err(ErrorKind::NotSupported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::VMount;

    fn root_entry(fs: &Arc<LocalFs>) -> Arc<VEntry> {
        let mount = Arc::new(VMount { base: None, handler: fs.clone(), options: String::new(), flags: Default::default() });
        VEntry::new(mount, HandlerData::Empty)
    }

    #[tokio::test]
    async fn mknod_write_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(1, dir.path());
        let root = root_entry(&fs);
        fs.mknod(&root, "f.txt", 0o644).await.unwrap();
        let outcome = fs.lookup(&root, Some("f.txt")).await.unwrap();
        let entry = VEntry::new(root.mount.clone(), outcome.data);
        let flags = OpenFlags { read: true, write: true, ..Default::default() };
        let data = fs.open(&entry, flags).await.unwrap();
        let vfile = VFile::new(root.mount.clone(), data, flags);
        fs.write(&vfile, b"hi", 0).await.unwrap();
        let mut buf = [0u8; 2];
        let n = fs.read(&vfile, &mut buf, 0).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn lookup_missing_file_is_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(1, dir.path());
        let root = root_entry(&fs);
        assert_eq!(fs.lookup(&root, Some("nope")).await.unwrap_err(), ErrorKind::NoEntry);
    }
}
