//! Path parser / resolver.
//!
//! Walks a textual virtual path, pushing mount layers, following symlinks
//! with loop protection, and carrying per-layer mount metadata through the
//! walk via a mutable `ParseState`.

use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::core_types::{VEntry, VMount};
use crate::error::{ErrorKind, Result};
use crate::handler::{Handler, HandlerData, HandlerRegistry, SymlinkTarget};
use crate::vfs_limits::{MAX_NAME_LEN, MAX_PATH_LEN};

/// Mutable resolution state threaded through one call to [`Resolver::resolve`]:
/// the current `ventry`, the last consumed segment name, and the remaining
/// symlink-hop budget.
struct ParseState {
    current: Arc<VEntry>,
    prevseg: Option<String>,
    hops_left: u32,
    segments_consumed: u32,
}

/// Splits a segment at the first *unescaped* `#`, returning `(name,
/// Some(handler_spec))` if a handler invocation is present, or `(segment,
/// None)` otherwise. `##` within a segment collapses to a literal `#` and
/// does not start a handler invocation.
fn split_handler_marker(segment: &str) -> (String, Option<String>) {
    let bytes = segment.as_bytes();
    let mut name = String::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'#' {
            if i + 1 < bytes.len() && bytes[i + 1] == b'#' {
                name.push('#');
                i += 2;
                continue;
            }
            return (name, Some(segment[i + 1..].to_string()));
        }
        // Safe: we only special-case the ASCII '#' byte; everything else
        // is copied through one UTF-8 scalar at a time.
        let ch_len = utf8_char_len(bytes[i]);
        name.push_str(&segment[i..i + ch_len]);
        i += ch_len;
    }
    (name, None)
}

fn utf8_char_len(lead: u8) -> usize {
    if lead & 0x80 == 0 {
        1
    } else if lead & 0xE0 == 0xC0 {
        2
    } else if lead & 0xF0 == 0xE0 {
        3
    } else {
        4
    }
}

/// A named handler invocation's parsed form: `name`, optional `options`
/// string, optional `:param`.
struct NamedInvocation {
    name: String,
    options: String,
    param: Option<String>,
}

fn parse_named(spec: &str) -> NamedInvocation {
    let (head, param) = match spec.split_once(':') {
        Some((h, p)) => (h, Some(p.to_string())),
        None => (spec, None),
    };
    let name_end = head.find(|c: char| !(c.is_ascii_alphanumeric() || c == '_')).unwrap_or(head.len());
    NamedInvocation { name: head[..name_end].to_string(), options: head[name_end..].to_string(), param }
}

/// Resolves virtual paths against a [`HandlerRegistry`].
pub struct Resolver {
    pub registry: Arc<HandlerRegistry>,
    pub local_handler: Arc<dyn Handler>,
    pub config: Config,
}

impl Resolver {
    pub fn new(registry: Arc<HandlerRegistry>, local_handler: Arc<dyn Handler>, config: Config) -> Self {
        Resolver { registry, local_handler, config }
    }

    fn root_entry(&self) -> Arc<VEntry> {
        VEntry::native(self.local_handler.clone(), String::new())
    }

    /// Resolve `path` to a [`VEntry`], iterating one segment at a time.
    pub async fn resolve(&self, path: &str) -> Result<Arc<VEntry>> {
        let start = self.root_entry();
        self.resolve_from(&start, path, self.config.symlink_budget).await
    }

    async fn resolve_from(&self, start: &Arc<VEntry>, path: &str, hops_left: u32) -> Result<Arc<VEntry>> {
        if path.len() > MAX_PATH_LEN {
            return Err(ErrorKind::NameTooLong);
        }
        let mut state = ParseState { current: start.clone(), prevseg: None, hops_left, segments_consumed: 0 };
        for raw_segment in path.split('/').filter(|s| !s.is_empty()) {
            state.segments_consumed += 1;
            if state.segments_consumed > self.config.max_path_segments {
                return Err(ErrorKind::PathTooComplex);
            }
            self.step(&mut state, raw_segment).await?;
        }
        Ok(state.current)
    }

    async fn step(&self, state: &mut ParseState, raw_segment: &str) -> Result<()> {
        let (name_part, handler_spec) = split_handler_marker(raw_segment);
        if name_part.len() > MAX_NAME_LEN {
            return Err(ErrorKind::NameTooLong);
        }

        if !name_part.is_empty() {
            self.descend_name(state, &name_part).await?;
        }

        let Some(spec) = handler_spec else {
            return Ok(());
        };

        if spec.is_empty() {
            // `#` alone: auto-select by suffix match against the last
            // consumed segment. The rewritten name
            // (`.tgz` -> `.tar`) is never itself looked up as a child;
            // `lookup(seed, None)` establishes the new handler's own root
            // the same way a named invocation with no `:param` does, and
            // the rewrite only feeds `prevseg` so a following bare `#`
            // can match the next handler in the chain ("so chained
            // handlers compose").
            let last = state.prevseg.clone().unwrap_or_default();
            let (handler, rewritten) =
                self.registry.auto_match(&last).ok_or(ErrorKind::NoHandler)?;
            self.push_handler_and_lookup(state, handler, String::new(), None).await?;
            state.prevseg = Some(rewritten);
            Ok(())
        } else {
            let inv = parse_named(&spec);
            let handler = self.registry.by_name(&inv.name).ok_or(ErrorKind::NoHandler)?;
            self.push_handler_and_lookup(state, handler, inv.options, inv.param).await
        }
    }

    async fn descend_name(&self, state: &mut ParseState, name: &str) -> Result<()> {
        let handler = state.current.mount.handler.clone();
        let outcome = handler.lookup(&state.current, Some(name)).await?;
        state.prevseg = Some(name.to_string());
        let mount = state.current.mount.clone();
        self.apply_lookup_outcome(state, mount, outcome).await
    }

    async fn push_handler_and_lookup(
        &self,
        state: &mut ParseState,
        handler: Arc<dyn Handler>,
        options: String,
        param: Option<String>,
    ) -> Result<()> {
        use crate::handler::HandlerFlags;
        if handler.base().flags.contains(HandlerFlags::ONLYROOT) {
            // Only accept lookup when the base ventry resolves to the
            // filesystem root.
            let base_path = self.generate_path(&state.current);
            if base_path != "/" && !base_path.is_empty() {
                return Err(ErrorKind::Permission);
            }
        }
        let mount = Arc::new(VMount {
            base: Some(state.current.clone()),
            handler: handler.clone(),
            options,
            flags: Default::default(),
        });
        let seed = VEntry::new(mount.clone(), HandlerData::Empty);
        let outcome = handler.lookup(&seed, param.as_deref()).await?;
        state.prevseg = param;
        self.apply_lookup_outcome(state, mount, outcome).await
    }

    async fn apply_lookup_outcome(
        &self,
        state: &mut ParseState,
        mount: Arc<VMount>,
        outcome: crate::handler::LookupOutcome,
    ) -> Result<()> {
        let new_entry = VEntry::new(mount, outcome.data);
        match outcome.symlink_target {
            None => {
                state.current = new_entry;
                Ok(())
            }
            Some(target) => {
                if state.hops_left == 0 {
                    return Err(ErrorKind::Loop);
                }
                let remaining = state.hops_left - 1;
                let resolved = match target {
                    SymlinkTarget::Relative(p) => {
                        // A relative target resolves against the symlink's
                        // parent directory, not the symlink entry itself —
                        // the entry has no children of its own to look up
                        // into. `lookup(.., None)` is this handler's
                        // "go up one level" convention.
                        let handler = new_entry.mount.handler.clone();
                        let parent = handler.lookup(&new_entry, None).await?;
                        let parent_entry = VEntry::new(new_entry.mount.clone(), parent.data);
                        self.resolve_from(&parent_entry, &path_to_str(&p), remaining).await?
                    }
                    SymlinkTarget::Absolute(p) => {
                        let root = self.root_entry();
                        self.resolve_from(&root, &path_to_str(&p), remaining).await?
                    }
                };
                state.current = resolved;
                Ok(())
            }
        }
    }

    /// `generate_path(ve)`: inverts resolution, producing a canonical
    /// string.
    pub fn generate_path(&self, entry: &Arc<VEntry>) -> String {
        self.generate_path_from_mount(&entry.mount)
    }

    pub fn generate_path_from_mount(&self, mount: &Arc<VMount>) -> String {
        match &mount.base {
            None => String::new(),
            Some(base) => {
                let base_path = self.generate_path(base);
                let own = mount.handler.name();
                if mount.options.is_empty() {
                    format!("{base_path}#{own}")
                } else {
                    format!("{base_path}#{own}{}", mount.options)
                }
            }
        }
    }
}

fn path_to_str(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

/// Splits `path` into `(parent_path, last_component_name)`, used by
/// operations (`unlink`, `mkdir`, `rename`, ...) that act on a directory
/// entry rather than resolving the full target themselves.
pub fn split_parent_name(path: &str) -> Result<(String, String)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => Ok((parent.to_string(), name.to_string())),
        _ => Err(ErrorKind::InvalidArgument),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_handler_marker_finds_auto() {
        let (name, spec) = split_handler_marker("a.tar.gz#");
        assert_eq!(name, "a.tar.gz");
        assert_eq!(spec.as_deref(), Some(""));
    }

    #[test]
    fn split_handler_marker_finds_named() {
        let (name, spec) = split_handler_marker("a.dat#extfs:opt");
        assert_eq!(name, "a.dat");
        assert_eq!(spec.as_deref(), Some("extfs:opt"));
    }

    #[test]
    fn double_hash_escapes_to_literal() {
        let (name, spec) = split_handler_marker("weird##name");
        assert_eq!(name, "weird#name");
        assert!(spec.is_none());
    }

    #[test]
    fn parse_named_splits_options_and_param() {
        let inv = parse_named("extfs:/inner/path");
        assert_eq!(inv.name, "extfs");
        assert_eq!(inv.options, "");
        assert_eq!(inv.param.as_deref(), Some("/inner/path"));
    }

    #[test]
    fn parse_named_without_param() {
        let inv = parse_named("ugz");
        assert_eq!(inv.name, "ugz");
        assert_eq!(inv.param, None);
    }

    #[test]
    fn split_parent_name_rejects_bare_root() {
        assert_eq!(split_parent_name("/"), Err(ErrorKind::InvalidArgument));
    }

    #[test]
    fn split_parent_name_splits_simple_path() {
        let (parent, name) = split_parent_name("/a/b/c").unwrap();
        assert_eq!(parent, "/a/b");
        assert_eq!(name, "c");
    }

    #[tokio::test]
    async fn resolve_rejects_oversized_path() {
        let ctx = crate::context::Context::new(crate::config::Config::default());
        let dir = tempfile::tempdir().unwrap();
        let resolver = crate::bootstrap(ctx, dir.path());
        let huge = format!("/{}", "a".repeat(MAX_PATH_LEN + 1));
        assert_eq!(resolver.resolve(&huge).await.unwrap_err(), ErrorKind::NameTooLong);
    }

    #[tokio::test]
    async fn resolve_rejects_oversized_segment() {
        let ctx = crate::context::Context::new(crate::config::Config::default());
        let dir = tempfile::tempdir().unwrap();
        let resolver = crate::bootstrap(ctx, dir.path());
        let path = format!("/{}", "a".repeat(MAX_NAME_LEN + 1));
        assert_eq!(resolver.resolve(&path).await.unwrap_err(), ErrorKind::NameTooLong);
    }

    fn make_gzip(data: &[u8]) -> Vec<u8> {
        use std::io::Write as _;
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[tokio::test]
    async fn auto_hash_mounts_a_single_compressed_file() {
        let ctx = crate::context::Context::new(crate::config::Config::default());
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("note.txt.gz"), make_gzip(b"plain text inside gzip")).unwrap();
        let resolver = crate::bootstrap(ctx, dir.path());

        let file = crate::ops::open(&resolver, "/note.txt.gz#", crate::core_types::OpenFlags::read_only()).await.unwrap();
        let mut buf = [0u8; 64];
        let n = crate::ops::pread(&file, &mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"plain text inside gzip");
    }

    #[tokio::test]
    async fn chained_auto_hash_enters_tar_inside_gzip() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_path("inner.txt").unwrap();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &b"hello"[..]).unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let ctx = crate::context::Context::new(crate::config::Config::default());
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bundle.tar.gz"), make_gzip(&tar_bytes)).unwrap();
        let resolver = crate::bootstrap(ctx, dir.path());

        // First `#` peels the `.gz`, rewriting `prevseg` to `bundle.tar`;
        // the second, bare `#` component then auto-matches `.tar` and
        // mounts the archive handler on top of the decoded stream.
        let entry = resolver.resolve("/bundle.tar.gz#/#/inner.txt").await.unwrap();
        let file = crate::core_types::VFile::new(entry.mount.clone(), entry.data.clone(), crate::core_types::OpenFlags::read_only());
        let handler = entry.mount.handler.clone();
        let attr = handler.getattr(&file).await.unwrap();
        assert_eq!(attr.size, 5);

        let mut buf = [0u8; 5];
        let n = handler.read(&file, &mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
