//! The `volatile` handler: a pure in-memory filesystem, usable standalone
//! and as the basis of `avfsstat`'s synthetic tree.
//!
//! Built on [`crate::namespace::Namespace`] rather than a single flat
//! `HashMap`, and on [`Handler`] rather than a transport-specific trait.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::core_types::{OpenFlags, VEntry, VFile};
use crate::error::{ErrorKind, Result};
use crate::handler::{DirEntry, ExtEntry, Handler, HandlerBase, HandlerData, HandlerFlags, LookupOutcome};
use crate::namespace::{EntryFlags, Namespace};
use crate::ops::SetAttrChange;
use crate::refcount::Ref;
use crate::stat::{AvStat, FileType, Timespec};

type NsEntry = Ref<crate::namespace::Entry>;

enum NodeKind {
    Directory,
    File(RwLock<Vec<u8>>),
    Symlink(PathBuf),
}

struct Node {
    kind: NodeKind,
    stat: Mutex<AvStat>,
}

impl Node {
    fn new(file_type: FileType, dev: u64, ino: u64, kind: NodeKind) -> Arc<Self> {
        Arc::new(Node { kind, stat: Mutex::new(AvStat::default_for(file_type, dev, ino)) })
    }

    fn stat(&self) -> AvStat {
        *self.stat.lock().unwrap()
    }
}

fn node_of(entry: &NsEntry) -> Arc<Node> {
    entry.data.get::<Arc<Node>>().expect("every namespace entry created by VolatileFs carries a Node")
}

/// A pure in-memory filesystem, backing the `volatile` handler and reused
/// by [`crate::avfsstat`] for its synthetic control tree.
pub struct VolatileFs {
    base: HandlerBase,
    ns: Namespace,
    inode: AtomicU64,
}

static EXTENSIONS: &[ExtEntry] = &[];

impl VolatileFs {
    pub fn new(dev: u64) -> Arc<Self> {
        let ns = Namespace::new(EntryFlags::default());
        let root = ns.root();
        root.data.set(Node::new(FileType::Directory, dev, 0, NodeKind::Directory));
        Arc::new(VolatileFs {
            base: HandlerBase::new("volatile", EXTENSIONS, "1.0", HandlerFlags::NONE, dev),
            ns,
            inode: AtomicU64::new(1),
        })
    }

    fn next_ino(&self) -> u64 {
        self.inode.fetch_add(1, Ordering::Relaxed)
    }

    fn entry_from(&self, ventry_data: &HandlerData) -> Result<NsEntry> {
        match ventry_data {
            HandlerData::Empty => Ok(self.ns.root()),
            other => other.downcast::<NsEntry>().map(|arc| (*arc).clone()).ok_or(ErrorKind::InvalidArgument),
        }
    }

    fn outcome_for(&self, entry: NsEntry) -> LookupOutcome {
        let node = node_of(&entry);
        let attr = node.stat();
        let symlink_target = match &node.kind {
            NodeKind::Symlink(target) => Some(if target.is_absolute() {
                crate::handler::SymlinkTarget::Absolute(target.clone())
            } else {
                crate::handler::SymlinkTarget::Relative(target.clone())
            }),
            _ => None,
        };
        LookupOutcome { data: HandlerData::any(entry), attr, symlink_target }
    }

    fn create_node(&self, parent: &Arc<VEntry>, name: &str, kind: NodeKind, file_type: FileType) -> Result<AvStat> {
        let parent_entry = self.entry_from(&parent.data)?;
        if self.ns.lookup_existing(&parent_entry, name).is_some() {
            return Err(ErrorKind::Exists);
        }
        let child = self.ns.lookup(&parent_entry, Some(name));
        let ino = self.next_ino();
        let node = Node::new(file_type, self.base.dev, ino, kind);
        child.data.set(node.clone());
        Ok(node.stat())
    }
}

#[async_trait]
impl Handler for VolatileFs {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    async fn lookup(&self, base: &Arc<VEntry>, segment: Option<&str>) -> Result<LookupOutcome> {
        let start = self.entry_from(&base.data)?;
        let Some(segment) = segment else {
            let up = self.ns.lookup(&start, None);
            return Ok(self.outcome_for(up));
        };
        let target = self.ns.resolve(&start, segment)?;
        Ok(self.outcome_for(target))
    }

    async fn open(&self, entry: &Arc<VEntry>, flags: OpenFlags) -> Result<HandlerData> {
        let ns_entry = self.entry_from(&entry.data)?;
        let node = node_of(&ns_entry);
        if flags.trunc {
            if let NodeKind::File(content) = &node.kind {
                content.write().unwrap().clear();
                node.stat.lock().unwrap().size = 0;
            }
        }
        Ok(HandlerData::any(ns_entry))
    }

    async fn read(&self, file: &VFile, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = file.data.lock().await;
        let ns_entry = data.downcast::<NsEntry>().map(|arc| (*arc).clone()).ok_or(ErrorKind::InvalidArgument)?;
        let node = node_of(&ns_entry);
        match &node.kind {
            NodeKind::File(content) => {
                let content = content.read().unwrap();
                let offset = offset as usize;
                if offset >= content.len() {
                    return Ok(0);
                }
                let n = (content.len() - offset).min(buf.len());
                buf[..n].copy_from_slice(&content[offset..offset + n]);
                Ok(n)
            }
            NodeKind::Directory => Err(ErrorKind::IsDir),
            NodeKind::Symlink(_) => Err(ErrorKind::InvalidArgument),
        }
    }

    async fn write(&self, file: &VFile, buf: &[u8], offset: u64) -> Result<usize> {
        let data = file.data.lock().await;
        let ns_entry = data.downcast::<NsEntry>().map(|arc| (*arc).clone()).ok_or(ErrorKind::InvalidArgument)?;
        let node = node_of(&ns_entry);
        match &node.kind {
            NodeKind::File(content) => {
                let mut content = content.write().unwrap();
                let offset = offset as usize;
                if content.len() < offset + buf.len() {
                    content.resize(offset + buf.len(), 0);
                }
                content[offset..offset + buf.len()].copy_from_slice(buf);
                let mut stat = node.stat.lock().unwrap();
                stat.size = content.len() as u64;
                stat.mtime = Timespec::now();
                Ok(buf.len())
            }
            NodeKind::Directory => Err(ErrorKind::IsDir),
            NodeKind::Symlink(_) => Err(ErrorKind::InvalidArgument),
        }
    }

    async fn getattr(&self, file: &VFile) -> Result<AvStat> {
        let data = file.data.lock().await;
        let ns_entry = data.downcast::<NsEntry>().map(|arc| (*arc).clone()).ok_or(ErrorKind::InvalidArgument)?;
        Ok(node_of(&ns_entry).stat())
    }

    async fn readdir(&self, entry: &Arc<VEntry>) -> Result<Vec<DirEntry>> {
        let ns_entry = self.entry_from(&entry.data)?;
        let node = node_of(&ns_entry);
        if !matches!(node.kind, NodeKind::Directory) {
            return Err(ErrorKind::NotDir);
        }
        Ok(ns_entry
            .children()
            .into_iter()
            .map(|child| {
                let child_node = node_of(&child);
                let stat = child_node.stat();
                DirEntry { name: child.name(), ino: stat.ino, file_type: stat.file_type }
            })
            .collect())
    }

    async fn setattr(&self, entry: &Arc<VEntry>, changes: &SetAttrChange) -> Result<AvStat> {
        let ns_entry = self.entry_from(&entry.data)?;
        let node = node_of(&ns_entry);
        if let Some(size) = changes.size {
            if let NodeKind::File(content) = &node.kind {
                content.write().unwrap().resize(size as usize, 0);
            } else {
                return Err(ErrorKind::InvalidArgument);
            }
        }
        let mut stat = node.stat.lock().unwrap();
        if let Some(size) = changes.size {
            stat.size = size;
        }
        if let Some(mode) = changes.mode {
            stat.mode = mode;
        }
        if let Some(uid) = changes.uid {
            stat.uid = uid;
        }
        if let Some(gid) = changes.gid {
            stat.gid = gid;
        }
        apply_time(&mut stat.atime, &changes.atime);
        apply_time(&mut stat.mtime, &changes.mtime);
        Ok(*stat)
    }

    async fn access(&self, _entry: &Arc<VEntry>, _mask: u32) -> Result<()> {
        Ok(())
    }

    async fn readlink(&self, entry: &Arc<VEntry>) -> Result<PathBuf> {
        let ns_entry = self.entry_from(&entry.data)?;
        match &node_of(&ns_entry).kind {
            NodeKind::Symlink(target) => Ok(target.clone()),
            _ => Err(ErrorKind::InvalidArgument),
        }
    }

    async fn unlink(&self, parent: &Arc<VEntry>, name: &str) -> Result<()> {
        let parent_entry = self.entry_from(&parent.data)?;
        let child = self.ns.lookup_existing(&parent_entry, name).ok_or(ErrorKind::NoEntry)?;
        if matches!(node_of(&child).kind, NodeKind::Directory) {
            return Err(ErrorKind::IsDir);
        }
        self.ns.unlink(&parent_entry, name);
        Ok(())
    }

    async fn rmdir(&self, parent: &Arc<VEntry>, name: &str) -> Result<()> {
        let parent_entry = self.entry_from(&parent.data)?;
        let child = self.ns.lookup_existing(&parent_entry, name).ok_or(ErrorKind::NoEntry)?;
        if !matches!(node_of(&child).kind, NodeKind::Directory) {
            return Err(ErrorKind::NotDir);
        }
        if !child.children().is_empty() {
            return Err(ErrorKind::NotEmpty);
        }
        self.ns.unlink(&parent_entry, name);
        Ok(())
    }

    async fn mkdir(&self, parent: &Arc<VEntry>, name: &str, mode: u32) -> Result<AvStat> {
        let stat = self.create_node(parent, name, NodeKind::Directory, FileType::Directory)?;
        let parent_entry = self.entry_from(&parent.data)?;
        let child = self.ns.lookup_existing(&parent_entry, name).unwrap();
        node_of(&child).stat.lock().unwrap().mode = mode;
        Ok(stat)
    }

    async fn mknod(&self, parent: &Arc<VEntry>, name: &str, mode: u32) -> Result<AvStat> {
        let stat = self.create_node(parent, name, NodeKind::File(RwLock::new(Vec::new())), FileType::Regular)?;
        let parent_entry = self.entry_from(&parent.data)?;
        let child = self.ns.lookup_existing(&parent_entry, name).unwrap();
        node_of(&child).stat.lock().unwrap().mode = mode;
        Ok(stat)
    }

    async fn symlink(&self, parent: &Arc<VEntry>, name: &str, target: &Path) -> Result<AvStat> {
        self.create_node(parent, name, NodeKind::Symlink(target.to_path_buf()), FileType::Symlink)
    }

    async fn rename(
        &self,
        from_parent: &Arc<VEntry>,
        from_name: &str,
        to_parent: &Arc<VEntry>,
        to_name: &str,
    ) -> Result<()> {
        let fp = self.entry_from(&from_parent.data)?;
        let tp = self.entry_from(&to_parent.data)?;
        self.ns.rename(&fp, from_name, &tp, to_name)
    }

    async fn link(&self, source: &Arc<VEntry>, new_parent: &Arc<VEntry>, new_name: &str) -> Result<()> {
        // `volatile` entries are tree nodes, not inode-shared; a "hard
        // link" aliases the same `Node` under a second namespace entry.
        let source_entry = self.entry_from(&source.data)?;
        let new_parent_entry = self.entry_from(&new_parent.data)?;
        if self.ns.lookup_existing(&new_parent_entry, new_name).is_some() {
            return Err(ErrorKind::Exists);
        }
        let node = node_of(&source_entry);
        let child = self.ns.lookup(&new_parent_entry, Some(new_name));
        child.data.set(node);
        Ok(())
    }
}

fn apply_time(field: &mut Timespec, strategy: &crate::ops::SetTimeStrategy) {
    match strategy {
        crate::ops::SetTimeStrategy::DontChange => {}
        crate::ops::SetTimeStrategy::ServerCurrent => *field = Timespec::now(),
        crate::ops::SetTimeStrategy::ClientProvided(t) => *field = *t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::VMount;

    fn root_entry(fs: &Arc<VolatileFs>) -> Arc<VEntry> {
        let mount = Arc::new(VMount { base: None, handler: fs.clone(), options: String::new(), flags: Default::default() });
        VEntry::new(mount, HandlerData::Empty)
    }

    #[tokio::test]
    async fn mkdir_then_lookup_then_readdir() {
        let fs = VolatileFs::new(1);
        let root = root_entry(&fs);
        fs.mkdir(&root, "sub", 0o755).await.unwrap();
        let outcome = fs.lookup(&root, Some("sub")).await.unwrap();
        assert_eq!(outcome.attr.file_type, FileType::Directory);
        let entries = fs.readdir(&root).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "sub");
    }

    #[tokio::test]
    async fn write_then_read_roundtrips_bytes() {
        let fs = VolatileFs::new(1);
        let root = root_entry(&fs);
        fs.mknod(&root, "f", 0o644).await.unwrap();
        let outcome = fs.lookup(&root, Some("f")).await.unwrap();
        let entry = VEntry::new(root.mount.clone(), outcome.data);
        let flags = OpenFlags { write: true, read: true, ..Default::default() };
        let data = fs.open(&entry, flags).await.unwrap();
        let vfile = VFile::new(root.mount.clone(), data, flags);
        fs.write(&vfile, b"hello", 0).await.unwrap();
        let mut buf = [0u8; 5];
        let n = fs.read(&vfile, &mut buf, 0).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn unlink_removes_file_but_not_nonempty_dir_via_rmdir() {
        let fs = VolatileFs::new(1);
        let root = root_entry(&fs);
        fs.mkdir(&root, "d", 0o755).await.unwrap();
        let outcome = fs.lookup(&root, Some("d")).await.unwrap();
        let dir_entry = VEntry::new(root.mount.clone(), outcome.data);
        fs.mknod(&dir_entry, "inner", 0o644).await.unwrap();
        assert_eq!(fs.rmdir(&root, "d").await, Err(ErrorKind::NotEmpty));
        fs.unlink(&dir_entry, "inner").await.unwrap();
        fs.rmdir(&root, "d").await.unwrap();
    }

    #[tokio::test]
    async fn symlink_lookup_reports_target() {
        let fs = VolatileFs::new(1);
        let root = root_entry(&fs);
        fs.symlink(&root, "link", Path::new("/elsewhere")).await.unwrap();
        let outcome = fs.lookup(&root, Some("link")).await.unwrap();
        assert!(matches!(outcome.symlink_target, Some(crate::handler::SymlinkTarget::Absolute(_))));
    }
}
