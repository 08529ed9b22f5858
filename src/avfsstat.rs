//! `avfsstat`: the control pseudo-filesystem, an introspection and tuning
//! surface. Exposes live process state as a small synthetic
//! tree: `/version`, `/copyright`, `/modules`, `/debug`, `/cache/limit`,
//! `/cache/keep_free`, `/cache/usage`, `/cache/clear`.
//!
//! Unlike [`crate::volatile::VolatileFs`] this handler has no mutable
//! namespace of its own — every "file" is a fixed synthetic node whose
//! content is computed from [`crate::context::Context`] at read time, and
//! whose `write` (where allowed) pokes a tunable live.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::context::Context;
use crate::core_types::{OpenFlags, VEntry, VFile};
use crate::error::{ErrorKind, Result};
use crate::handler::{DirEntry, ExtEntry, Handler, HandlerBase, HandlerData, HandlerFlags, HandlerRegistry, LookupOutcome};
use crate::ops::SetAttrChange;
use crate::stat::{AvStat, FileType};

const VERSION_TEXT: &str = concat!(env!("CARGO_PKG_VERSION"), "\n");
const COPYRIGHT_TEXT: &str = "AVFS contributors. Distributed under the same terms as the original AVFS.\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Node {
    Root,
    Cache,
    Version,
    Copyright,
    Modules,
    Debug,
    CacheLimit,
    CacheKeepFree,
    CacheUsage,
    CacheClear,
}

impl Node {
    fn is_dir(self) -> bool {
        matches!(self, Node::Root | Node::Cache)
    }

    fn children(self) -> &'static [(&'static str, Node)] {
        match self {
            Node::Root => &[
                ("version", Node::Version),
                ("copyright", Node::Copyright),
                ("modules", Node::Modules),
                ("debug", Node::Debug),
                ("cache", Node::Cache),
            ],
            Node::Cache => &[
                ("limit", Node::CacheLimit),
                ("keep_free", Node::CacheKeepFree),
                ("usage", Node::CacheUsage),
                ("clear", Node::CacheClear),
            ],
            _ => &[],
        }
    }

    fn lookup_child(self, name: &str) -> Option<Node> {
        self.children().iter().find(|(n, _)| *n == name).map(|(_, node)| *node)
    }
}

/// The `avfsstat` handler.
pub struct AvfsStat {
    base: HandlerBase,
    ctx: Arc<Context>,
    /// Filled in by [`Self::set_registry`] once the full registry exists
    /// (this handler is itself one of the registry's members, so it can't
    /// borrow a finished registry at construction time).
    registry: OnceLock<Arc<HandlerRegistry>>,
}

static EXTENSIONS: &[ExtEntry] = &[];

impl AvfsStat {
    pub fn new(dev: u64, ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(AvfsStat {
            base: HandlerBase::new("avfsstat", EXTENSIONS, "1.0", HandlerFlags::ONLYROOT, dev),
            ctx,
            registry: OnceLock::new(),
        })
    }

    /// Wire the finished registry in, so `/modules` can give a read-only
    /// listing of registered handlers with their versions and extensions.
    /// A no-op if called twice; only [`crate::build_registry`] is expected
    /// to call this, once.
    pub fn set_registry(&self, registry: Arc<HandlerRegistry>) {
        let _ = self.registry.set(registry);
    }

    fn render_modules(&self) -> Vec<u8> {
        let Some(registry) = self.registry.get() else {
            return Vec::new();
        };
        let mut out = String::new();
        for handler in registry.iter() {
            let base = handler.base();
            let extensions = base
                .extensions
                .iter()
                .map(|e| e.from)
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&format!("{}\t{}\t{}\n", base.name, base.version, extensions));
        }
        out.into_bytes()
    }

    fn render(&self, node: Node) -> Vec<u8> {
        match node {
            Node::Version => VERSION_TEXT.as_bytes().to_vec(),
            Node::Copyright => COPYRIGHT_TEXT.as_bytes().to_vec(),
            Node::Modules => self.render_modules(),
            Node::Debug => format!("{:#06b}\n", self.ctx.log_mask()).into_bytes(),
            Node::CacheLimit => format!("{}\n", self.ctx.disk_cache.disk_cache_limit()).into_bytes(),
            Node::CacheKeepFree => format!("{}\n", self.ctx.disk_cache.disk_keep_free()).into_bytes(),
            Node::CacheUsage => format!("{}\n", self.ctx.disk_cache.disk_usage()).into_bytes(),
            Node::CacheClear => Vec::new(),
            Node::Root | Node::Cache => Vec::new(),
        }
    }

    fn stat_for(&self, node: Node) -> AvStat {
        let file_type = if node.is_dir() { FileType::Directory } else { FileType::Regular };
        let mut stat = AvStat::default_for(file_type, self.base.dev, node as u64 + 1);
        if !node.is_dir() {
            stat.size = self.render(node).len() as u64;
        }
        stat
    }

    fn node_of(data: &HandlerData) -> Result<Node> {
        match data {
            HandlerData::Empty => Ok(Node::Root),
            other => other.downcast::<Node>().map(|arc| *arc).ok_or(ErrorKind::InvalidArgument),
        }
    }

    fn apply_write(&self, node: Node, text: &str) -> Result<()> {
        let trimmed = text.trim();
        match node {
            Node::Debug => {
                let mask = u32::from_str_radix(trimmed.trim_start_matches("0b"), 2)
                    .or_else(|_| trimmed.parse::<u32>())
                    .map_err(|_| ErrorKind::InvalidArgument)?;
                self.ctx.set_log_mask(mask);
                Ok(())
            }
            Node::CacheLimit => {
                let limit: i64 = trimmed.parse().map_err(|_| ErrorKind::InvalidArgument)?;
                self.ctx.disk_cache.set_disk_cache_limit(limit);
                Ok(())
            }
            Node::CacheKeepFree => {
                let keep: i64 = trimmed.parse().map_err(|_| ErrorKind::InvalidArgument)?;
                self.ctx.disk_cache.set_disk_keep_free(keep);
                Ok(())
            }
            Node::CacheClear => {
                self.ctx.disk_cache.clear();
                Ok(())
            }
            _ => Err(ErrorKind::ReadOnlyFs),
        }
    }
}

#[async_trait]
impl Handler for AvfsStat {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    async fn lookup(&self, base: &Arc<VEntry>, segment: Option<&str>) -> Result<LookupOutcome> {
        let current = Self::node_of(&base.data)?;
        let node = match segment {
            None => Node::Root,
            Some(name) => current.lookup_child(name).ok_or(ErrorKind::NoEntry)?,
        };
        Ok(LookupOutcome { data: HandlerData::any(node), attr: self.stat_for(node), symlink_target: None })
    }

    async fn open(&self, entry: &Arc<VEntry>, flags: OpenFlags) -> Result<HandlerData> {
        let node = Self::node_of(&entry.data)?;
        if node.is_dir() && flags.write {
            return Err(ErrorKind::IsDir);
        }
        Ok(HandlerData::any(node))
    }

    async fn read(&self, file: &VFile, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = file.data.lock().await;
        let node = Self::node_of(&data)?;
        let content = self.render(node);
        let offset = offset as usize;
        if offset >= content.len() {
            return Ok(0);
        }
        let n = (content.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&content[offset..offset + n]);
        Ok(n)
    }

    async fn write(&self, file: &VFile, buf: &[u8], _offset: u64) -> Result<usize> {
        let data = file.data.lock().await;
        let node = Self::node_of(&data)?;
        let text = String::from_utf8_lossy(buf);
        self.apply_write(node, &text)?;
        Ok(buf.len())
    }

    async fn getattr(&self, file: &VFile) -> Result<AvStat> {
        let data = file.data.lock().await;
        let node = Self::node_of(&data)?;
        Ok(self.stat_for(node))
    }

    async fn readdir(&self, entry: &Arc<VEntry>) -> Result<Vec<DirEntry>> {
        let node = Self::node_of(&entry.data)?;
        if !node.is_dir() {
            return Err(ErrorKind::NotDir);
        }
        Ok(node
            .children()
            .iter()
            .map(|(name, child)| {
                let stat = self.stat_for(*child);
                DirEntry { name: name.to_string(), ino: stat.ino, file_type: stat.file_type }
            })
            .collect())
    }

    async fn setattr(&self, _entry: &Arc<VEntry>, _changes: &SetAttrChange) -> Result<AvStat> {
        Err(ErrorKind::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core_types::VMount;

    fn fixture() -> (Arc<AvfsStat>, Arc<VEntry>) {
        let ctx = Context::new(Config::default());
        let fs = AvfsStat::new(1, ctx);
        let mount = Arc::new(VMount { base: None, handler: fs.clone(), options: String::new(), flags: Default::default() });
        let root = VEntry::new(mount, HandlerData::Empty);
        (fs, root)
    }

    #[tokio::test]
    async fn readdir_root_lists_fixed_entries() {
        let (fs, root) = fixture();
        let entries = fs.readdir(&root).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"cache"));
        assert!(names.contains(&"version"));
    }

    #[tokio::test]
    async fn cache_usage_reflects_manager_state() {
        let (fs, root) = fixture();
        let outcome = fs.lookup(&root, Some("cache")).await.unwrap();
        let cache_entry = VEntry::new(root.mount.clone(), outcome.data);
        let usage = fs.lookup(&cache_entry, Some("usage")).await.unwrap();
        assert_eq!(usage.attr.file_type, FileType::Regular);
    }

    #[tokio::test]
    async fn writing_cache_limit_updates_manager() {
        let (fs, root) = fixture();
        let outcome = fs.lookup(&root, Some("cache")).await.unwrap();
        let cache_entry = VEntry::new(root.mount.clone(), outcome.data);
        let limit_outcome = fs.lookup(&cache_entry, Some("limit")).await.unwrap();
        let limit_entry = VEntry::new(root.mount.clone(), limit_outcome.data);
        let flags = OpenFlags { write: true, ..Default::default() };
        let data = fs.open(&limit_entry, flags).await.unwrap();
        let vfile = VFile::new(root.mount.clone(), data, flags);
        fs.write(&vfile, b"12345", 0).await.unwrap();
        assert_eq!(fs.ctx.disk_cache.disk_cache_limit(), 12345);
    }

    #[tokio::test]
    async fn writing_debug_updates_live_log_mask() {
        let (fs, root) = fixture();
        let outcome = fs.lookup(&root, Some("debug")).await.unwrap();
        let entry = VEntry::new(root.mount.clone(), outcome.data);
        let flags = OpenFlags { write: true, ..Default::default() };
        let data = fs.open(&entry, flags).await.unwrap();
        let vfile = VFile::new(root.mount.clone(), data, flags);
        fs.write(&vfile, b"15", 0).await.unwrap();
        assert_eq!(fs.ctx.log_mask(), 15);
        let mut buf = [0u8; 16];
        let n = fs.read(&vfile, &mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"0b1111\n");
    }

    #[tokio::test]
    async fn modules_lists_registered_handlers_once_wired() {
        let (fs, root) = fixture();
        let mut registry = HandlerRegistry::new();
        registry.register(fs.clone());
        fs.set_registry(Arc::new(registry));

        let outcome = fs.lookup(&root, Some("modules")).await.unwrap();
        let entry = VEntry::new(root.mount.clone(), outcome.data);
        let flags = OpenFlags::read_only();
        let data = fs.open(&entry, flags).await.unwrap();
        let vfile = VFile::new(root.mount.clone(), data, flags);
        let mut buf = [0u8; 256];
        let n = fs.read(&vfile, &mut buf, 0).await.unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.contains("avfsstat\t1.0"));
    }
}
