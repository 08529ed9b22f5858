//! In-memory namespace tree.
//!
//! A [`Namespace`] is a rooted tree of [`Entry`] nodes shared by archive
//! parsers and the volatile in-memory filesystem. Parents own their
//! children through an intrusive child list; children hold a ref-counted
//! pointer back to their parent. Only one direction owns, so there is no
//! cycle.
//!
//! `Entry`'s child list is backed by `dashmap` rather than a mutex-guarded
//! `HashMap`: lookups are frequent and concurrent, structural mutation is
//! rare.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, Weak};

use dashmap::DashMap;

use crate::error::{ErrorKind, Result};
use crate::refcount::Ref;

/// Per-entry flags. `NOCASE` makes name comparisons within the owning
/// namespace case-insensitive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EntryFlags {
    pub nocase: bool,
}

/// Opaque per-entry user data, attached without the namespace's own lock:
/// set/get only ever swaps a pointer under its own internal lock.
pub struct UserData(RwLock<Option<Box<dyn std::any::Any + Send + Sync>>>);

impl UserData {
    fn new() -> Self {
        UserData(RwLock::new(None))
    }

    pub fn set<T: std::any::Any + Send + Sync>(&self, value: T) {
        *self.0.write().unwrap() = Some(Box::new(value));
    }

    pub fn clear(&self) {
        *self.0.write().unwrap() = None;
    }

    pub fn get<T: std::any::Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.0.read().unwrap().as_ref().and_then(|b| b.downcast_ref::<T>()).cloned()
    }

    pub fn with<T: std::any::Any + Send + Sync, R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let guard = self.0.read().unwrap();
        f(guard.as_ref().and_then(|b| b.downcast_ref::<T>()))
    }
}

/// A single namespace node. Belongs to exactly one [`Namespace`].
pub struct Entry {
    pub name: RwLock<String>,
    pub flags: EntryFlags,
    parent: Mutex<Option<Ref<Entry>>>,
    /// Intrusive child list, keyed by the name under which each child was
    /// inserted (not re-keyed on rename; [`Namespace::rename`] re-inserts).
    children: DashMap<String, Ref<Entry>>,
    self_weak: Mutex<Weak<()>>,
    pub data: UserData,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry").field("name", &*self.name.read().unwrap()).finish()
    }
}

fn fold_name(name: &str, nocase: bool) -> String {
    if nocase {
        name.to_lowercase()
    } else {
        name.to_string()
    }
}

impl Entry {
    fn new(name: &str, flags: EntryFlags) -> Ref<Entry> {
        Ref::new(Entry {
            name: RwLock::new(name.to_string()),
            flags,
            parent: Mutex::new(None),
            children: DashMap::new(),
            self_weak: Mutex::new(Weak::new()),
            data: UserData::new(),
        })
    }

    /// Ref to this entry's parent, or `None` at the root.
    pub fn parent(&self) -> Option<Ref<Entry>> {
        self.parent.lock().unwrap().clone()
    }

    /// Whether this entry is "orphaned": detached from its parent but
    /// still reachable through an outstanding ref.
    pub fn is_orphaned(&self) -> bool {
        self.parent.lock().unwrap().is_none() && self.children.is_empty()
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    /// All children, in no particular guaranteed order (backed by a
    /// concurrent hash map).
    pub fn children(&self) -> Vec<Ref<Entry>> {
        self.children.iter().map(|kv| kv.value().clone()).collect()
    }
}

/// A rooted tree of [`Entry`] nodes.
pub struct Namespace {
    root: Ref<Entry>,
    flags: EntryFlags,
    next_autodir_tag: AtomicU64,
}

impl Namespace {
    pub fn new(flags: EntryFlags) -> Self {
        Namespace { root: Entry::new("", flags), flags, next_autodir_tag: AtomicU64::new(0) }
    }

    pub fn root(&self) -> Ref<Entry> {
        self.root.ref_clone()
    }

    /// A tag useful for callers (e.g. the archive skeleton) that need a
    /// monotonically increasing counter scoped to this namespace, such as
    /// inode assignment.
    pub fn next_tag(&self) -> u64 {
        self.next_autodir_tag.fetch_add(1, Ordering::Relaxed)
    }

    /// `lookup(ns, parent, name)`: return the `(parent, name)` child,
    /// creating it lazily if absent. `name == None` means "parent of
    /// parent" (up). `.`/`..` are treated as identity/up by
    /// [`Namespace::resolve`], not here.
    pub fn lookup(&self, parent: &Ref<Entry>, name: Option<&str>) -> Ref<Entry> {
        let Some(name) = name else {
            return parent.parent().unwrap_or_else(|| parent.ref_clone());
        };
        let key = fold_name(name, self.flags.nocase);
        if let Some(existing) = parent.children.get(&key) {
            return existing.clone();
        }
        let child = Entry::new(name, self.flags);
        *child.parent.lock().unwrap() = Some(parent.ref_clone());
        parent.children.insert(key, child.clone());
        child
    }

    /// Look up an existing child without creating it.
    pub fn lookup_existing(&self, parent: &Ref<Entry>, name: &str) -> Option<Ref<Entry>> {
        let key = fold_name(name, self.flags.nocase);
        parent.children.get(&key).map(|kv| kv.clone())
    }

    /// Remove `name` from `parent`'s child list, detaching it. The entry
    /// remains reachable (orphaned) through any ref the caller still holds.
    pub fn unlink(&self, parent: &Ref<Entry>, name: &str) -> Option<Ref<Entry>> {
        let key = fold_name(name, self.flags.nocase);
        let (_, child) = parent.children.remove(&key)?;
        *child.parent.lock().unwrap() = None;
        Some(child)
    }

    /// Move `entry` from `(old_parent, old_name)` to `(new_parent,
    /// new_name)`, replacing any existing target.
    pub fn rename(
        &self,
        old_parent: &Ref<Entry>,
        old_name: &str,
        new_parent: &Ref<Entry>,
        new_name: &str,
    ) -> Result<()> {
        let entry = self.unlink(old_parent, old_name).ok_or(ErrorKind::NoEntry)?;
        // Drop and replace any existing entry at the destination: a rename
        // onto an existing path must make that path subsequently resolve
        // to the moved content.
        let _ = self.unlink(new_parent, new_name);
        *entry.name.write().unwrap() = new_name.to_string();
        *entry.parent.lock().unwrap() = Some(new_parent.ref_clone());
        new_parent.children.insert(fold_name(new_name, self.flags.nocase), entry);
        Ok(())
    }

    /// Split `path` on `/` and look up each component in turn, treating
    /// `.` and `..` as identity/up. Missing intermediate components are
    /// *not* created;
    /// callers that want lazy creation (e.g. `get_entry`) use
    /// [`Namespace::lookup`] directly per-segment.
    pub fn resolve(&self, from: &Ref<Entry>, path: &str) -> Result<Ref<Entry>> {
        let mut current = from.ref_clone();
        for comp in path.split('/').filter(|s| !s.is_empty()) {
            current = match comp {
                "." => current,
                ".." => self.lookup(&current, None),
                name => self.lookup_existing(&current, name).ok_or(ErrorKind::NoEntry)?,
            };
        }
        Ok(current)
    }

    /// Reconstruct the `/`-joined path from the root to `entry`.
    pub fn getpath(&self, entry: &Ref<Entry>) -> String {
        let mut segments = Vec::new();
        let mut current = entry.ref_clone();
        loop {
            let parent = current.parent();
            match parent {
                None => break,
                Some(p) => {
                    segments.push(current.name());
                    current = p;
                }
            }
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_creates_lazily_and_is_idempotent() {
        let ns = Namespace::new(EntryFlags::default());
        let root = ns.root();
        let a = ns.lookup(&root, Some("a"));
        let a2 = ns.lookup(&root, Some("a"));
        assert_eq!(ns.getpath(&a), "/a");
        assert_eq!(ns.getpath(&a2), "/a");
        assert!(Ref::ptr_eq_for_test(&a, &a2));
    }

    #[test]
    fn getpath_roundtrips_through_resolve() {
        let ns = Namespace::new(EntryFlags::default());
        let root = ns.root();
        let dir = ns.lookup(&root, Some("dir"));
        let file = ns.lookup(&dir, Some("file.txt"));
        assert_eq!(ns.getpath(&file), "/dir/file.txt");
        let resolved = ns.resolve(&root, "dir/file.txt").unwrap();
        assert_eq!(ns.getpath(&resolved), "/dir/file.txt");
    }

    #[test]
    fn nocase_namespace_folds_names() {
        let ns = Namespace::new(EntryFlags { nocase: true });
        let root = ns.root();
        let a = ns.lookup(&root, Some("Foo"));
        let b = ns.lookup_existing(&root, "foo").unwrap();
        assert_eq!(ns.getpath(&a), ns.getpath(&b));
    }

    #[test]
    fn unlink_detaches_but_ref_keeps_entry_alive() {
        let ns = Namespace::new(EntryFlags::default());
        let root = ns.root();
        let a = ns.lookup(&root, Some("a"));
        let removed = ns.unlink(&root, "a").unwrap();
        assert!(removed.is_orphaned());
        assert!(ns.lookup_existing(&root, "a").is_none());
        drop(a);
    }

    #[test]
    fn rename_moves_entry_and_replaces_target() {
        let ns = Namespace::new(EntryFlags::default());
        let root = ns.root();
        let _src = ns.lookup(&root, Some("src"));
        let _dst = ns.lookup(&root, Some("dst"));
        ns.rename(&root, "src", &root, "dst").unwrap();
        assert!(ns.lookup_existing(&root, "src").is_none());
        let dst = ns.lookup_existing(&root, "dst").unwrap();
        assert_eq!(ns.getpath(&dst), "/dst");
    }

    #[test]
    fn rename_missing_source_errors() {
        let ns = Namespace::new(EntryFlags::default());
        let root = ns.root();
        assert_eq!(ns.rename(&root, "nope", &root, "x"), Err(ErrorKind::NoEntry));
    }
}

// Test-only helper: compares that two [`Ref<Entry>`] point at the same
// underlying allocation, used to assert lookup idempotence above.
#[cfg(test)]
impl Ref<Entry> {
    fn ptr_eq_for_test(a: &Ref<Entry>, b: &Ref<Entry>) -> bool {
        std::ptr::eq(a.get() as *const Entry, b.get() as *const Entry)
    }
}
