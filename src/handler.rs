//! Handler vtable + registry.
//!
//! Maps the fixed per-handler operation surface onto one Rust trait
//! object per handler, dispatched dynamically through `Arc<dyn Handler>`.
//! The `lookup`/`open`/`close`/`read`/`lseek`/`getattr` subset is
//! mandatory (no default); the rest default to
//! [`crate::error::ErrorKind::NotSupported`] (or `ReadOnlyFs` for the
//! mutating ops).

use std::any::Any;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::core_types::{OpenFlags, VEntry, VFile, Whence};
use crate::error::{ErrorKind, Result};
use crate::stat::AvStat;

/// Opaque per-handler data attached to a `ventry`/`vfile`, playing the
/// role an untyped `void *data` pointer would in a C implementation.
/// Each handler interprets its own variant; `Any` lets a handler stash
/// an arbitrary composite struct, as archive/zfile handlers need to.
#[derive(Clone)]
pub enum HandlerData {
    /// A plain path string, the common case for the local/native handler
    /// and any handler whose "object" is just a filesystem path.
    Path(String),
    /// Nothing yet resolved (used transiently during path parsing).
    Empty,
    /// An arbitrary per-handler structure.
    Any(Arc<dyn Any + Send + Sync>),
}

impl HandlerData {
    pub fn any<T: Any + Send + Sync>(value: T) -> Self {
        HandlerData::Any(Arc::new(value))
    }

    pub fn as_path(&self) -> Option<&str> {
        match self {
            HandlerData::Path(p) => Some(p.as_str()),
            _ => None,
        }
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            HandlerData::Any(a) => Arc::clone(a).downcast::<T>().ok(),
            _ => None,
        }
    }
}

/// Minimal bitflags support for three bits of state, without pulling in
/// a whole extra crate for it.
macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(
                $(#[$fmeta:meta])*
                const $flag:ident = $value:expr;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub $repr);

        impl $name {
            $(
                $(#[$fmeta])*
                pub const $flag: $name = $name($value);
            )*

            pub const NONE: $name = $name(0);

            pub const fn contains(self, other: $name) -> bool {
                (self.0 & other.0) == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bitflags_lite! {
    /// Handler-level flags.
    pub struct HandlerFlags: u32 {
        /// Paths into this handler must end with a trailing separator
        /// (e.g. `#` handlers that mount an archive root).
        const NEEDSLASH = 1 << 0;
        /// `lookup` only succeeds when the base ventry resolves to this
        /// handler's filesystem root.
        const ONLYROOT  = 1 << 1;
        /// Skip acquiring the handler's coarse lock around dispatch.
        const NOLOCK    = 1 << 2;
    }
}

/// A `from` extension mapping onto an optional rewritten `to` extension,
/// e.g. `.tgz -> .tar` so chained handlers compose.
#[derive(Debug, Clone)]
pub struct ExtEntry {
    pub from: &'static str,
    pub to: Option<&'static str>,
}

pub const fn ext(from: &'static str) -> ExtEntry {
    ExtEntry { from, to: None }
}

pub const fn ext_rewrite(from: &'static str, to: &'static str) -> ExtEntry {
    ExtEntry { from, to: Some(to) }
}

/// Common handler bookkeeping embedded by every concrete handler, minus
/// the operation pointers themselves, which live on the [`Handler`]
/// trait impl.
pub struct HandlerBase {
    pub name: &'static str,
    pub extensions: &'static [ExtEntry],
    pub version: &'static str,
    pub flags: HandlerFlags,
    pub dev: u64,
    inode_counter: AtomicU64,
    lock: AsyncMutex<()>,
}

impl HandlerBase {
    pub fn new(name: &'static str, extensions: &'static [ExtEntry], version: &'static str, flags: HandlerFlags, dev: u64) -> Self {
        HandlerBase { name, extensions, version, flags, dev, inode_counter: AtomicU64::new(1), lock: AsyncMutex::new(()) }
    }

    /// Allocate a fresh inode number, unique within this handler's
    /// device number, from a monotonically increasing counter.
    pub fn next_inode(&self) -> u64 {
        self.inode_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Acquire the handler's coarse lock, unless `NOLOCK` is set, in
    /// which case dispatch skips locking entirely.
    pub async fn lock_guard(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        if self.flags.contains(HandlerFlags::NOLOCK) {
            None
        } else {
            Some(self.lock.lock().await)
        }
    }
}

/// Result of [`Handler::lookup`]: the resolved data plus an optional
/// symlink target the resolver must follow.
pub struct LookupOutcome {
    pub data: HandlerData,
    pub attr: AvStat,
    pub symlink_target: Option<SymlinkTarget>,
}

#[derive(Debug, Clone)]
pub enum SymlinkTarget {
    /// Resolve relative to the current mount layer.
    Relative(PathBuf),
    /// Resolve against a fresh bottom (native) layer.
    Absolute(PathBuf),
}

/// One `readdir` entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub file_type: crate::stat::FileType,
}

/// A handler implementation: method table + per-handler state.
/// Registered handlers are held both by every mount layer using them and
/// by the global registry ([`HandlerRegistry`]).
#[async_trait]
pub trait Handler: Send + Sync {
    fn base(&self) -> &HandlerBase;

    fn name(&self) -> &'static str {
        self.base().name
    }

    // --- mandatory subset ---

    async fn lookup(&self, base: &Arc<VEntry>, segment: Option<&str>) -> Result<LookupOutcome>;

    async fn open(&self, entry: &Arc<VEntry>, flags: OpenFlags) -> Result<HandlerData>;

    async fn close(&self, _file: &VFile) -> Result<()> {
        Ok(())
    }

    async fn read(&self, file: &VFile, buf: &mut [u8], offset: u64) -> Result<usize>;

    async fn lseek(&self, file: &VFile, offset: i64, whence: Whence) -> Result<u64> {
        let mut pos = file.pos.lock().await;
        let new_pos = match whence {
            Whence::Set => offset,
            Whence::Current => *pos as i64 + offset,
            Whence::End => {
                let attr = self.getattr(file).await?;
                attr.size as i64 + offset
            }
        };
        if new_pos < 0 {
            return Err(ErrorKind::InvalidArgument);
        }
        *pos = new_pos as u64;
        Ok(*pos)
    }

    async fn getattr(&self, file: &VFile) -> Result<AvStat>;

    // --- optional subset: default to ENOSYS/EROFS as appropriate ---

    async fn write(&self, _file: &VFile, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(ErrorKind::ReadOnlyFs)
    }

    async fn readdir(&self, _entry: &Arc<VEntry>) -> Result<Vec<DirEntry>> {
        Err(ErrorKind::NotSupported)
    }

    async fn setattr(&self, _entry: &Arc<VEntry>, _changes: &crate::ops::SetAttrChange) -> Result<AvStat> {
        Err(ErrorKind::ReadOnlyFs)
    }

    async fn access(&self, entry: &Arc<VEntry>, _mask: u32) -> Result<()> {
        let _ = entry;
        Ok(())
    }

    async fn readlink(&self, _entry: &Arc<VEntry>) -> Result<PathBuf> {
        Err(ErrorKind::InvalidArgument)
    }

    async fn unlink(&self, _parent: &Arc<VEntry>, _name: &str) -> Result<()> {
        Err(ErrorKind::ReadOnlyFs)
    }

    async fn rmdir(&self, _parent: &Arc<VEntry>, _name: &str) -> Result<()> {
        Err(ErrorKind::ReadOnlyFs)
    }

    async fn mkdir(&self, _parent: &Arc<VEntry>, _name: &str, _mode: u32) -> Result<AvStat> {
        Err(ErrorKind::ReadOnlyFs)
    }

    async fn mknod(&self, _parent: &Arc<VEntry>, _name: &str, _mode: u32) -> Result<AvStat> {
        Err(ErrorKind::ReadOnlyFs)
    }

    async fn rename(&self, _from_parent: &Arc<VEntry>, _from_name: &str, _to_parent: &Arc<VEntry>, _to_name: &str) -> Result<()> {
        Err(ErrorKind::ReadOnlyFs)
    }

    async fn link(&self, _source: &Arc<VEntry>, _new_parent: &Arc<VEntry>, _new_name: &str) -> Result<()> {
        Err(ErrorKind::ReadOnlyFs)
    }

    async fn symlink(&self, _parent: &Arc<VEntry>, _name: &str, _target: &std::path::Path) -> Result<AvStat> {
        Err(ErrorKind::ReadOnlyFs)
    }
}

/// Registered handler list, in explicit, stable registration order. Used
/// by the path resolver both for name lookup and for auto-handler
/// extension matching (leftmost-registered-wins).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.push(handler);
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.iter().find(|h| h.name() == name).cloned()
    }

    /// Scan all registered handlers, in registration order, for one whose
    /// extension list matches a suffix of `segment`. Returns the handler,
    /// the matched extension, and the rewritten segment if the extension
    /// specifies a `to` suffix.
    pub fn auto_match(&self, segment: &str) -> Option<(Arc<dyn Handler>, String)> {
        for handler in &self.handlers {
            for entry in handler.base().extensions {
                if let Some(stem) = segment.strip_suffix(entry.from) {
                    let rewritten = match entry.to {
                        Some(to) => format!("{stem}{to}"),
                        None => stem.to_string(),
                    };
                    return Some((handler.clone(), rewritten));
                }
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Handler>> {
        self.handlers.iter()
    }
}

/// A weak back-reference to a handler, used where ownership must flow
/// one way only — weak back-pointers are never themselves refcounted.
pub type WeakHandler = Weak<dyn Handler>;
