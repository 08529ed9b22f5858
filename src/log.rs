//! Logging plumbing: four levels selected by a runtime mask,
//! lines truncated at 1024 bytes, `AVFS_LOGFILE` redirects to a file with
//! timestamps instead of the default `tracing-subscriber` formatter.
//!
//! Built on `tracing` + `tracing-subscriber`. The mask itself is plain
//! data (`u32`, see [`crate::config::log_mask`]); this module only wires
//! up the global subscriber and the truncation rule.

use std::fmt;
use std::io::Write as _;
use std::sync::Mutex;

use tracing_subscriber::fmt::MakeWriter;

use crate::config::log_mask;

const MAX_LOG_LINE: usize = 1024;

/// One of the four log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warning,
    Syscall,
    Debug,
}

impl Level {
    fn mask_bit(self) -> u32 {
        match self {
            Level::Error => log_mask::ERROR,
            Level::Warning => log_mask::WARNING,
            Level::Syscall => log_mask::SYSCALL,
            Level::Debug => log_mask::DEBUG,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Error => "ERROR",
            Level::Warning => "WARNING",
            Level::Syscall => "SYSCALL",
            Level::Debug => "DEBUG",
        })
    }
}

/// Whether `level` is enabled under `mask`.
pub fn enabled(mask: u32, level: Level) -> bool {
    mask & level.mask_bit() != 0
}

/// Emit a log line if `level` is enabled under `mask`, truncating the
/// message at [`MAX_LOG_LINE`] bytes.
pub fn log(mask: u32, level: Level, message: &str) {
    if !enabled(mask, level) {
        return;
    }
    let truncated = truncate_utf8(message, MAX_LOG_LINE);
    match level {
        Level::Error => tracing::error!(target: "avfs", "{truncated}"),
        Level::Warning => tracing::warn!(target: "avfs", "{truncated}"),
        Level::Syscall => tracing::info!(target: "avfs::syscall", "{truncated}"),
        Level::Debug => tracing::debug!(target: "avfs", "{truncated}"),
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// A `tracing_subscriber` writer appending timestamped lines to
/// `AVFS_LOGFILE` when set, overriding the default stderr/syslog target.
#[derive(Clone)]
pub struct LogFileWriter {
    file: std::sync::Arc<Mutex<std::fs::File>>,
}

impl LogFileWriter {
    pub fn open(path: &std::path::Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(LogFileWriter { file: std::sync::Arc::new(Mutex::new(file)) })
    }
}

impl<'a> MakeWriter<'a> for LogFileWriter {
    type Writer = LogFileHandle;
    fn make_writer(&'a self) -> Self::Writer {
        LogFileHandle { file: self.file.clone() }
    }
}

pub struct LogFileHandle {
    file: std::sync::Arc<Mutex<std::fs::File>>,
}

impl std::io::Write for LogFileHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.lock().unwrap().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.file.lock().unwrap().flush()
    }
}

/// Install the global `tracing` subscriber, honoring `AVFS_LOGFILE` if
/// set. Safe to call more than once; later calls are ignored.
pub fn init_from_env() {
    let builder = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_env("AVFS_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    );
    let result = if let Ok(path) = std::env::var("AVFS_LOGFILE") {
        match LogFileWriter::open(std::path::Path::new(&path)) {
            Ok(writer) => builder.with_writer(writer).with_ansi(false).try_init(),
            Err(_) => builder.try_init(),
        }
    } else {
        builder.try_init()
    };
    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mask_enables_error_and_warning_only() {
        assert!(enabled(log_mask::DEFAULT, Level::Error));
        assert!(enabled(log_mask::DEFAULT, Level::Warning));
        assert!(!enabled(log_mask::DEFAULT, Level::Syscall));
        assert!(!enabled(log_mask::DEFAULT, Level::Debug));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "a".repeat(1023) + "é"; // é is 2 bytes, would split at 1024
        let t = truncate_utf8(&s, 1024);
        assert!(t.len() <= 1024);
        assert!(std::str::from_utf8(t.as_bytes()).is_ok());
    }

    #[test]
    fn short_message_is_unchanged() {
        assert_eq!(truncate_utf8("hello", 1024), "hello");
    }
}
