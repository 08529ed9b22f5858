//! The stacked-mount data model every component shares.
//!
//! `VEntry` / `VMount` / `VFile` mirror the virtual-entry core exactly: a
//! `VEntry` is a mount reference plus an opaque per-handler data pointer;
//! a `VMount` is one layer of the stack (a ref to the base `VEntry` below
//! it, a ref to the handler, an options string, flags); a `VFile` is an
//! opened entry (owned `VMount` copy, opaque data, position,
//! open flags, a per-file lock).

use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use crate::handler::{Handler, HandlerData};

/// One layer of the mount stack.
pub struct VMount {
    /// The ventry immediately below this layer; `None` at the bottom
    /// (native/local) layer.
    pub base: Option<Arc<VEntry>>,
    pub handler: Arc<dyn Handler>,
    pub options: String,
    pub flags: MountFlags,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MountFlags {
    pub readonly: bool,
}

/// A handler's opaque reference to an object, plus the mount stack above
/// it.
pub struct VEntry {
    pub mount: Arc<VMount>,
    pub data: HandlerData,
}

impl VEntry {
    pub fn new(mount: Arc<VMount>, data: HandlerData) -> Arc<Self> {
        Arc::new(VEntry { mount, data })
    }

    /// A bottom-layer ventry addressing a native filesystem path directly,
    /// with no handler above it. Used as the starting point of path
    /// resolution and by handlers that need "a fresh
    /// bottom-layer" ventry for absolute symlink targets.
    pub fn native(local_handler: Arc<dyn Handler>, path: String) -> Arc<Self> {
        let mount =
            Arc::new(VMount { base: None, handler: local_handler, options: String::new(), flags: MountFlags::default() });
        VEntry::new(mount, HandlerData::Path(path))
    }
}

/// Open flags, a private numeric space with POSIX-equivalent meanings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    pub write: bool,
    pub read: bool,
    pub create: bool,
    pub excl: bool,
    pub trunc: bool,
    pub append: bool,
    pub nonblock: bool,
    pub sync: bool,
    pub nofollow: bool,
    pub directory: bool,
    /// `AVO_NOPERM`: open for stat only, no access check.
    pub noperm: bool,
}

impl OpenFlags {
    pub const fn read_only() -> Self {
        OpenFlags { read: true, ..Self::const_default() }
    }

    const fn const_default() -> Self {
        OpenFlags {
            write: false,
            read: false,
            create: false,
            excl: false,
            trunc: false,
            append: false,
            nonblock: false,
            sync: false,
            nofollow: false,
            directory: false,
            noperm: false,
        }
    }

    pub fn wants_write(&self) -> bool {
        self.write
    }
}

/// Seek origin for [`crate::ops::lseek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
}

/// An opened [`VEntry`].
pub struct VFile {
    /// Owned copy of the mount layer that answered `open`.
    pub mount: Arc<VMount>,
    /// Opaque per-handler open-file data.
    pub data: AsyncMutex<HandlerData>,
    /// Current file position.
    pub pos: AsyncMutex<u64>,
    pub flags: OpenFlags,
    /// Per-file lock, serializing one handle's calls.
    pub lock: AsyncMutex<()>,
}

impl VFile {
    pub fn new(mount: Arc<VMount>, data: HandlerData, flags: OpenFlags) -> Arc<Self> {
        Arc::new(VFile { mount, data: AsyncMutex::new(data), pos: AsyncMutex::new(0), flags, lock: AsyncMutex::new(()) })
    }
}
