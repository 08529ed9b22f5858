//! Bridges a base [`VFile`]'s async `pread` onto `std::io::Read`, for the
//! codec libraries (`bzip2`, `xz2`, `zstd`) that only offer a synchronous
//! streaming `Read` adapter. Every codec's decode work (including gzip's)
//! runs inside `tokio::task::spawn_blocking`, so blocking
//! on the current Handle from here is the documented escape hatch, not a
//! runtime-starvation risk.

use std::io;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::core_types::VFile;
use crate::ops;

/// A forward-reading, `Read`-only cursor over a base `VFile`, starting at
/// `start_offset`. Only ever reads forward; codecs that need to rewind
/// construct a fresh reader instead.
pub struct BlockingBaseReader {
    file: Arc<VFile>,
    handle: Handle,
    pos: u64,
}

impl BlockingBaseReader {
    pub fn new(file: Arc<VFile>, start_offset: u64) -> Self {
        BlockingBaseReader { file, handle: Handle::current(), pos: start_offset }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Un-reads `by` bytes, for codecs that pull a scratch-sized chunk and
    /// then discover they only needed a prefix of it (e.g. gzip header
    /// parsing, or a deflate stream that ends mid-chunk).
    pub fn rewind(&mut self, by: u64) {
        self.pos = self.pos.saturating_sub(by);
    }
}

impl io::Read for BlockingBaseReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file.clone();
        let pos = self.pos;
        let n = self
            .handle
            .block_on(async move { ops::pread(&file, buf, pos).await })
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.pos += n as u64;
        Ok(n)
    }
}
