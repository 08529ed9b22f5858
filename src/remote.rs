//! Remote-transport adapter contract: a narrow trait a real rsh/ftp/http
//! backend would implement, plus one reference implementation (`file://`)
//! so the contract is exercised without a network dependency — real
//! transports are explicitly out of scope.
//!
//! Shares the "materialize before handing to code that wants a real
//! path" shape with [`crate::archive::extfs::Extfs::materialize`], and
//! [`parse_ls`] is the richer sibling of `extfs`'s own listing parser:
//! where `extfs::parse_listing` only needs path/is_dir/size, a remote
//! directory entry also carries mode/uid/gid/mtime/link-target, since a
//! `remote` mount stands in for an entire filesystem rather than one
//! archive's flat member list.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{ErrorKind, Result};
use crate::stat::{AvStat, FileType};

/// One entry from a remote directory listing.
#[derive(Debug, Clone)]
pub struct LsEntry {
    pub name: String,
    pub attr: AvStat,
    pub link_target: Option<String>,
}

/// Result of [`ExternalFetcher::list`].
#[derive(Debug, Clone, Default)]
pub struct DirList {
    pub entries: Vec<LsEntry>,
}

/// Tracks one in-flight (or finished) [`ExternalFetcher::get`] transfer,
/// so [`ExternalFetcher::wait`] can block until enough of it has landed.
pub struct FetchHandle {
    bytes_so_far: AtomicU64,
    done: AtomicBool,
    notify: Notify,
}

impl FetchHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(FetchHandle { bytes_so_far: AtomicU64::new(0), done: AtomicBool::new(false), notify: Notify::new() })
    }

    pub fn advance(&self, bytes: u64) {
        self.bytes_so_far.fetch_add(bytes, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn bytes_so_far(&self) -> u64 {
        self.bytes_so_far.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Outcome of [`ExternalFetcher::get`]: where the fetched bytes are
/// landing locally, and a handle to track progress with.
pub struct GetResult {
    pub local_path: PathBuf,
    pub handle: Arc<FetchHandle>,
}

/// The contract a remote-transport backend implements:
/// `list` a directory, `get` a file (returning immediately with a handle
/// a caller can `wait` on rather than blocking for the whole transfer),
/// and `destroy` to release backend-side resources explicitly, for
/// backends where that can't just be a `Drop` impl (e.g. an SSH control
/// connection shared across several in-flight fetches).
#[async_trait]
pub trait ExternalFetcher: Send + Sync {
    async fn list(&self, path: &str) -> Result<DirList>;

    async fn get(&self, path: &str) -> Result<GetResult>;

    /// Blocks until the transfer behind `handle` has delivered at least
    /// `end` bytes, or has finished (successfully or not) with fewer.
    async fn wait(&self, handle: &Arc<FetchHandle>, end: u64) -> Result<()> {
        loop {
            if handle.bytes_so_far() >= end || handle.is_done() {
                return Ok(());
            }
            handle.notify.notified().await;
        }
    }

    async fn destroy(&self) {}
}

/// Parses an `ls -l`-style listing into [`LsEntry`] values. Owner/group
/// fields are kept as opaque strings — resolving them to real uid/gid is
/// out of scope, so `uid`/`gid` on the resulting [`AvStat`] are left at 0.
pub fn parse_ls(text: &str) -> Vec<LsEntry> {
    let mut out = Vec::new();
    for line in text.lines() {
        let mut rest = line;
        let mut fields: Vec<&str> = Vec::with_capacity(8);
        for _ in 0..8 {
            rest = rest.trim_start();
            match rest.find(char::is_whitespace) {
                Some(idx) => {
                    fields.push(&rest[..idx]);
                    rest = &rest[idx..];
                }
                None => break,
            }
        }
        if fields.len() < 8 {
            continue;
        }
        let name_field = rest.trim();
        if name_field.is_empty() {
            continue;
        }
        let mode = fields[0];
        let size: u64 = fields[4].parse().unwrap_or(0);
        let (is_dir, is_link) = (mode.starts_with('d'), mode.starts_with('l'));
        let (name, link_target) = match name_field.split_once(" -> ") {
            Some((n, t)) => (n.to_string(), Some(t.to_string())),
            None => (name_field.to_string(), None),
        };
        if name.is_empty() {
            continue;
        }
        let file_type = if is_dir {
            FileType::Directory
        } else if is_link {
            FileType::Symlink
        } else {
            FileType::Regular
        };
        let mut attr = AvStat::default_for(file_type, 0, 0);
        attr.size = size;
        out.push(LsEntry { name, attr, link_target });
    }
    out
}

/// Reference transport: "fetches" from another path on the same local
/// filesystem, addressed as `file:///abs/path`. Exists so [`ExternalFetcher`]
/// is exercised by tests without a real network dependency — real rsh/http
/// transports are out of scope.
pub struct FileUrlFetcher;

impl FileUrlFetcher {
    fn strip_scheme(path: &str) -> Result<&Path> {
        path.strip_prefix("file://").map(Path::new).ok_or(ErrorKind::InvalidArgument)
    }
}

#[async_trait]
impl ExternalFetcher for FileUrlFetcher {
    async fn list(&self, path: &str) -> Result<DirList> {
        let dir = Self::strip_scheme(path)?;
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir).await.map_err(|_| ErrorKind::IO)?;
        while let Some(entry) = read_dir.next_entry().await.map_err(|_| ErrorKind::IO)? {
            let meta = entry.metadata().await.map_err(|_| ErrorKind::IO)?;
            let file_type = if meta.is_dir() {
                FileType::Directory
            } else if meta.is_symlink() {
                FileType::Symlink
            } else {
                FileType::Regular
            };
            let mut attr = AvStat::default_for(file_type, 0, 0);
            attr.size = meta.len();
            let link_target = if meta.is_symlink() {
                tokio::fs::read_link(entry.path()).await.ok().map(|p| p.to_string_lossy().into_owned())
            } else {
                None
            };
            entries.push(LsEntry { name: entry.file_name().to_string_lossy().into_owned(), attr, link_target });
        }
        Ok(DirList { entries })
    }

    async fn get(&self, path: &str) -> Result<GetResult> {
        let source = Self::strip_scheme(path)?;
        let bytes = tokio::fs::read(source).await.map_err(|_| ErrorKind::NoEntry)?;
        let handle = FetchHandle::new();
        handle.advance(bytes.len() as u64);
        handle.mark_done();
        let tmp = tempfile::NamedTempFile::new().map_err(|_| ErrorKind::IO)?;
        tokio::fs::write(tmp.path(), &bytes).await.map_err(|_| ErrorKind::IO)?;
        let local_path = tmp.path().to_path_buf();
        // Leak the guard: the handler that calls `get` owns the lifetime
        // of the local copy from here via the returned path, mirroring
        // how `extfs::materialize` hands a `NamedTempFile` up rather than
        // deleting it on this function's return.
        let _ = tmp.keep();
        Ok(GetResult { local_path, handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_regular_directory_and_symlink_lines() {
        let listing = "\
-rw-r--r--   1 user     group       1234 Jan  1  1970 readme.txt
drwxr-xr-x   1 user     group          0 Jan  1  1970 sub
lrwxrwxrwx   1 user     group          5 Jan  1  1970 link -> readme.txt
";
        let entries = parse_ls(listing);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "readme.txt");
        assert_eq!(entries[0].attr.size, 1234);
        assert_eq!(entries[0].attr.file_type, FileType::Regular);
        assert_eq!(entries[1].attr.file_type, FileType::Directory);
        assert_eq!(entries[2].link_target.as_deref(), Some("readme.txt"));
    }

    #[test]
    fn ignores_malformed_lines() {
        assert!(parse_ls("garbage\n\n").is_empty());
    }

    #[tokio::test]
    async fn file_url_fetcher_lists_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        let fetcher = FileUrlFetcher;
        let url = format!("file://{}", dir.path().display());
        let listing = fetcher.list(&url).await.unwrap();
        assert!(listing.entries.iter().any(|e| e.name == "a.txt" && e.attr.size == 2));
    }

    #[tokio::test]
    async fn file_url_fetcher_get_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let fetcher = FileUrlFetcher;
        let url = format!("file://{}", path.display());
        let result = fetcher.get(&url).await.unwrap();
        assert!(result.handle.is_done());
        assert_eq!(result.handle.bytes_so_far(), 5);
        fetcher.wait(&result.handle, 5).await.unwrap();
        let bytes = tokio::fs::read(&result.local_path).await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn get_on_missing_path_is_no_entry() {
        let fetcher = FileUrlFetcher;
        assert_eq!(fetcher.get("file:///does/not/exist").await.unwrap_err(), ErrorKind::NoEntry);
    }
}
