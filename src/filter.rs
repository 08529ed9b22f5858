//! Filter/pipe codec: runs an external compressor or
//! decompressor as a child process instead of linking a Rust codec crate,
//! for formats this crate has no native decoder for. A filter handler
//! binds one extension to a forward (decompress) argv read from
//! [`crate::config::Config::filter_programs`] — the same "deployment-time
//! binding, not a built-in list" shape [`crate::archive::extfs`] uses for
//! its own helper programs.
//!
//! Unlike [`crate::codec`]'s native codecs, a filter stream has no
//! checkpoint/restore story (an arbitrary external program's internal
//! state can't be serialized), so random access is bought purely through
//! [`crate::sfile::SerialFile`] spooling the decoded output instead.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::context::Context;
use crate::core_types::{OpenFlags, VEntry, VFile};
use crate::error::{ErrorKind, Result};
use crate::handler::{DirEntry, ExtEntry, Handler, HandlerBase, HandlerData, HandlerFlags, LookupOutcome};
use crate::log::{self, Level};
use crate::sfile::{SerialFile, SerialSource};
use crate::stat::{AvStat, FileType};

/// Owns a spawned child process's pipes and reaps it on drop: closes
/// stdin to the child, waits with a timeout, and SIGKILLs on timeout
/// expiry.
struct FilterChild {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    timeout: Duration,
}

impl Drop for FilterChild {
    fn drop(&mut self) {
        self.stdin.take(); // closes the write half, signaling EOF to the child.
        let Some(mut child) = self.child.take() else {
            return;
        };
        let timeout = self.timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if tokio::time::timeout(timeout, child.wait()).await.is_err() {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                });
            }
            Err(_) => {
                let _ = child.start_kill();
            }
        }
    }
}

/// Feeds one base file into a forward program's stdin and serves its
/// stdout as the decoded stream, implementing [`SerialSource`].
struct FilterSource {
    argv: Vec<String>,
    base_file: Arc<VFile>,
    timeout: Duration,
    log_mask: u32,
    child: Option<FilterChild>,
    stdout: Option<ChildStdout>,
}

impl FilterSource {
    fn new(argv: Vec<String>, base_file: Arc<VFile>, timeout: Duration, log_mask: u32) -> Self {
        FilterSource { argv, base_file, timeout, log_mask, child: None, stdout: None }
    }
}

#[async_trait]
impl SerialSource for FilterSource {
    async fn start(&mut self) -> Result<()> {
        let (program, args) = self.argv.split_first().ok_or(ErrorKind::NoHandler)?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|_| ErrorKind::IO)?;
        let stdin = child.stdin.take().ok_or(ErrorKind::IO)?;
        let stdout = child.stdout.take().ok_or(ErrorKind::IO)?;
        let stderr = child.stderr.take().ok_or(ErrorKind::IO)?;

        let log_mask = self.log_mask;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::log(log_mask, Level::Warning, &format!("filter stderr: {line}"));
            }
        });

        let base_file = self.base_file.clone();
        let mut stdin = stdin;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            let mut offset = 0u64;
            loop {
                let n = match crate::ops::pread(&base_file, &mut buf, offset).await {
                    Ok(n) => n,
                    Err(_) => break,
                };
                if n == 0 {
                    break;
                }
                if stdin.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                offset += n as u64;
            }
            // Dropping `stdin` here closes the pipe, signaling EOF to the
            // child regardless of which branch above ended the loop.
        });

        self.child = Some(FilterChild { child: Some(child), stdin: None, timeout: self.timeout });
        self.stdout = Some(stdout);
        Ok(())
    }

    async fn read_more(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stdout = self.stdout.as_mut().ok_or(ErrorKind::ServerFault)?;
        match tokio::time::timeout(self.timeout, stdout.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(_)) => Err(ErrorKind::IO),
            Err(_) => Err(ErrorKind::Timeout),
        }
    }
}

struct FilterSession {
    serial: SerialFile<FilterSource>,
}

/// A filter handler binding one extension to a forward program. `ufilt`-
/// style: mounts `a.ext#` as the decoded stream, same shape as
/// [`crate::codec::CodecHandler`].
pub struct FilterHandler {
    base: HandlerBase,
    argv: Vec<String>,
    ctx: Arc<Context>,
}

static NO_EXTENSIONS: &[ExtEntry] = &[];

impl FilterHandler {
    /// Builds one handler per configured [`crate::config::FilterProgram`].
    /// `dev` is the device number this handler (and every instance built
    /// by this call) is assigned; callers registering several of these
    /// should assign distinct `dev` values the way [`crate::build_registry`]
    /// does for its fixed handlers.
    pub fn from_config(dev: u64, ctx: Arc<Context>) -> Vec<Arc<Self>> {
        ctx.config
            .filter_programs
            .iter()
            .enumerate()
            .map(|(i, program)| {
                // HandlerBase::name wants `&'static str`; these handlers
                // live for the process lifetime anyway (same as every
                // other registry entry), so a one-time leak per configured
                // program is the straightforward way to get there from a
                // runtime-loaded extension string.
                let name: &'static str = Box::leak(format!("filter#{}", program.extension.trim_start_matches('.')).into_boxed_str());
                Arc::new(FilterHandler {
                    base: HandlerBase::new(name, NO_EXTENSIONS, "1.0", HandlerFlags::NONE, dev + i as u64),
                    argv: program.forward.clone(),
                    ctx: ctx.clone(),
                })
            })
            .collect()
    }

    /// Builds a single handler directly, for tests or programmatic setup
    /// that doesn't want to route through [`crate::config::Config`].
    pub fn new(name: &'static str, argv: Vec<String>, dev: u64, ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(FilterHandler { base: HandlerBase::new(name, NO_EXTENSIONS, "1.0", HandlerFlags::NONE, dev), argv, ctx })
    }
}

#[async_trait]
impl Handler for FilterHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    async fn lookup(&self, base: &Arc<VEntry>, segment: Option<&str>) -> Result<LookupOutcome> {
        if segment.is_some() {
            return Err(ErrorKind::NoEntry);
        }
        let _ = base.mount.base.clone().ok_or(ErrorKind::InvalidArgument)?;
        let attr = AvStat::default_for(FileType::Regular, self.base.dev, 2);
        Ok(LookupOutcome { data: HandlerData::Empty, attr, symlink_target: None })
    }

    async fn open(&self, entry: &Arc<VEntry>, flags: OpenFlags) -> Result<HandlerData> {
        if flags.wants_write() {
            // Write-back would need to stage plaintext and invoke the
            // reverse program on close; not exposed (DESIGN.md: "archive
            // and filter write support").
            return Err(ErrorKind::ReadOnlyFs);
        }
        let base_entry = entry.mount.base.clone().ok_or(ErrorKind::InvalidArgument)?;
        let base_handler = base_entry.mount.handler.clone();
        let base_open_flags = OpenFlags { read: true, ..Default::default() };
        let base_data = base_handler.open(&base_entry, base_open_flags).await?;
        let base_file = Arc::new(VFile::new(base_entry.mount.clone(), base_data, base_open_flags));

        let source = FilterSource::new(
            self.argv.clone(),
            base_file,
            Duration::from_secs(self.ctx.config.filter_timeout_secs),
            self.ctx.log_mask(),
        );
        let serial = SerialFile::new(source, &self.ctx.config.temp_dir_base, false).await?;
        Ok(HandlerData::any(FilterSession { serial }))
    }

    async fn read(&self, file: &VFile, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = file.data.lock().await;
        let session = data.downcast::<FilterSession>().ok_or(ErrorKind::InvalidArgument)?;
        session.serial.pread(buf, offset).await
    }

    async fn getattr(&self, file: &VFile) -> Result<AvStat> {
        let data = file.data.lock().await;
        let session = data.downcast::<FilterSession>().ok_or(ErrorKind::InvalidArgument)?;
        let mut attr = AvStat::default_for(FileType::Regular, self.base.dev, 2);
        attr.size = session.serial.bytes_so_far().await;
        Ok(attr)
    }

    async fn readdir(&self, _entry: &Arc<VEntry>) -> Result<Vec<DirEntry>> {
        Err(ErrorKind::NotDir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core_types::VMount;

    fn ctx_with_timeout(secs: u64) -> Arc<Context> {
        let mut cfg = Config::default();
        cfg.filter_timeout_secs = secs;
        Context::new(cfg)
    }

    #[tokio::test]
    async fn cat_as_forward_program_roundtrips_plaintext() {
        let ctx = ctx_with_timeout(5);
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("plain.txt");
        std::fs::write(&base_path, b"hello from the base file").unwrap();

        let local = crate::local_handler(dir.path());
        let base_mount = Arc::new(VMount { base: None, handler: local, options: String::new(), flags: Default::default() });
        let base_entry = VEntry::new(base_mount, HandlerData::Path("plain.txt".to_string()));

        let filter = FilterHandler::new("filter#cat", vec!["cat".to_string()], 1, ctx);
        let mount = Arc::new(VMount { base: Some(base_entry), handler: filter.clone(), options: String::new(), flags: Default::default() });
        let entry = VEntry::new(mount, HandlerData::Empty);

        let data = filter.open(&entry, OpenFlags::read_only()).await.unwrap();
        let vfile = VFile::new(entry.mount.clone(), data, OpenFlags::read_only());

        let mut buf = [0u8; 64];
        let n = filter.read(&vfile, &mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"hello from the base file");
    }

    #[tokio::test]
    async fn write_is_rejected() {
        let ctx = ctx_with_timeout(5);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plain.txt"), b"x").unwrap();
        let local = crate::local_handler(dir.path());
        let base_mount = Arc::new(VMount { base: None, handler: local, options: String::new(), flags: Default::default() });
        let base_entry = VEntry::new(base_mount, HandlerData::Path("plain.txt".to_string()));
        let filter = FilterHandler::new("filter#cat", vec!["cat".to_string()], 1, ctx);
        let mount = Arc::new(VMount { base: Some(base_entry), handler: filter.clone(), options: String::new(), flags: Default::default() });
        let entry = VEntry::new(mount, HandlerData::Empty);
        let flags = OpenFlags { write: true, ..Default::default() };
        assert_eq!(filter.open(&entry, flags).await.unwrap_err(), ErrorKind::ReadOnlyFs);
    }
}
