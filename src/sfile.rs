//! Serial-file adapter: turns a one-shot, forward-only byte
//! stream into a `pread`-able file of initially unknown size, by spooling
//! what's been read so far to a scratch file and serving repeat or
//! out-of-order reads from there instead of re-running the stream.
//!
//! [`crate::archive::extfs::Extfs`] already localizes a non-local base
//! file before handing it to an external program; [`SerialFile`] is the
//! general form of that same idea applied to the *output* side, so
//! [`crate::filter`]'s child-process output (and any other one-shot
//! producer) can be `pread` at arbitrary offsets the way every other
//! handler expects.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{ErrorKind, Result};

/// A one-shot forward-only byte source: `start` begins production;
/// `read_more` pulls the next chunk, returning `0` at end of stream.
/// Implementations are not expected to support being read twice —
/// [`SerialFile`] is what buys repeatable, random-access reads on top.
#[async_trait]
pub trait SerialSource: Send + Sync {
    async fn start(&mut self) -> Result<()>;
    async fn read_more(&mut self, buf: &mut [u8]) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Stream has not been started yet.
    Begin,
    /// Stream is live; more bytes may still arrive.
    Read,
    /// Stream has reached EOF; `total_read` is the final size.
    Idle,
}

static NEXT_SPOOL_ID: AtomicU64 = AtomicU64::new(1);

const DISCARD_CHUNK: usize = 64 * 1024;

/// Adapts one [`SerialSource`] into a `pread`-able file.
///
/// `nocache: true` skips the spool file
/// entirely — appropriate for a source so large that spooling the whole
/// thing defeats the point (e.g. a remote fetch already writing its own
/// local copy). A backward seek in that mode restarts the source from
/// scratch rather than serving stale data.
pub struct SerialFile<S: SerialSource> {
    inner: AsyncMutex<Inner<S>>,
}

struct Inner<S: SerialSource> {
    source: S,
    state: State,
    total_read: u64,
    spool: Option<tokio::fs::File>,
}

impl<S: SerialSource> SerialFile<S> {
    /// `temp_dir` is only consulted when caching is enabled; pass any
    /// path when `nocache` is true.
    pub async fn new(source: S, temp_dir: &std::path::Path, nocache: bool) -> Result<Self> {
        let spool = if nocache {
            None
        } else {
            let id = NEXT_SPOOL_ID.fetch_add(1, Ordering::Relaxed);
            let path = temp_dir.join(format!("atmp{id:06}"));
            let file = tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .await
                .map_err(|_| ErrorKind::IO)?;
            mark_cloexec(&file);
            Some(file)
        };
        Ok(SerialFile { inner: AsyncMutex::new(Inner { source, state: State::Begin, total_read: 0, spool }) })
    }

    /// Bytes produced by the source so far (not necessarily its total
    /// size unless the stream has reached EOF — see [`Self::size`]).
    pub async fn bytes_so_far(&self) -> u64 {
        self.inner.lock().await.total_read
    }

    /// Forces the source to run to completion (discarding what it isn't
    /// asked to keep) and returns its total size — the only way to learn
    /// the size of a format with no header field for it; size is
    /// discovered by exhausting the stream, not declared up front.
    pub async fn size(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        Self::ensure_started(&mut inner).await?;
        let mut discard = vec![0u8; DISCARD_CHUNK];
        while inner.state == State::Read {
            let n = Self::pull(&mut inner, &mut discard).await?;
            if n == 0 {
                break;
            }
        }
        Ok(inner.total_read)
    }

    /// Random-access read, dispatching three ways: serve
    /// from the spool when the whole request is already behind us, read
    /// straight from the live stream when the request starts exactly at
    /// the point the stream has reached, or discard-forward to catch up
    /// and then serve whatever ended up available.
    pub async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        Self::ensure_started(&mut inner).await?;

        if inner.spool.is_none() && offset < inner.total_read {
            // NOCACHE mode has nothing to serve a backward seek from:
            // restart the source.
            inner.source.start().await?;
            inner.total_read = 0;
            inner.state = State::Read;
        }

        let want_end = offset.saturating_add(buf.len() as u64);
        if inner.spool.is_some() && want_end <= inner.total_read {
            return Self::serve_from_spool(&mut inner, buf, offset).await;
        }

        if offset == inner.total_read && inner.state == State::Read {
            return Self::read_live(&mut inner, buf).await;
        }

        // Catch up: discard forward in bounded chunks so we land exactly
        // on `offset`, never past it.
        let mut discard = vec![0u8; DISCARD_CHUNK];
        while inner.total_read < offset && inner.state == State::Read {
            let want = ((offset - inner.total_read) as usize).min(discard.len());
            let n = Self::pull(&mut inner, &mut discard[..want]).await?;
            if n == 0 {
                break;
            }
        }

        if inner.total_read < offset {
            return Ok(0); // stream ended before reaching `offset`.
        }
        if offset < inner.total_read {
            return Self::serve_from_spool(&mut inner, buf, offset).await;
        }
        Self::read_live(&mut inner, buf).await
    }

    /// `pwrite`/`truncate` aren't supported — a serial source only ever
    /// flows one direction.
    pub async fn pwrite(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(ErrorKind::NotSupported)
    }

    async fn ensure_started(inner: &mut Inner<S>) -> Result<()> {
        if inner.state == State::Begin {
            inner.source.start().await?;
            inner.state = State::Read;
        }
        Ok(())
    }

    /// Pull the next chunk from the live source, spooling it if caching
    /// is on, and advance `total_read`. Used both to discard (caller
    /// throws the bytes away) and, via [`Self::read_live`], to serve.
    async fn pull(inner: &mut Inner<S>, buf: &mut [u8]) -> Result<usize> {
        let n = inner.source.read_more(buf).await?;
        if n == 0 {
            inner.state = State::Idle;
            return Ok(0);
        }
        if let Some(spool) = inner.spool.as_mut() {
            spool.seek(std::io::SeekFrom::Start(inner.total_read)).await.map_err(|_| ErrorKind::IO)?;
            spool.write_all(&buf[..n]).await.map_err(|_| ErrorKind::IO)?;
        }
        inner.total_read += n as u64;
        Ok(n)
    }

    async fn read_live(inner: &mut Inner<S>, buf: &mut [u8]) -> Result<usize> {
        Self::pull(inner, buf).await
    }

    async fn serve_from_spool(inner: &mut Inner<S>, buf: &mut [u8], offset: u64) -> Result<usize> {
        let Some(spool) = inner.spool.as_mut() else {
            return Ok(0);
        };
        let available = inner.total_read.saturating_sub(offset) as usize;
        let n = available.min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        spool.seek(std::io::SeekFrom::Start(offset)).await.map_err(|_| ErrorKind::IO)?;
        spool.read_exact(&mut buf[..n]).await.map_err(|_| ErrorKind::IO)?;
        Ok(n)
    }
}

#[cfg(unix)]
fn mark_cloexec(file: &tokio::fs::File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        let fd = file.as_raw_fd();
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
}

#[cfg(not(unix))]
fn mark_cloexec(_file: &tokio::fs::File) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Hands out fixed content in small chunks, so tests exercise the
    /// multi-pull catch-up path instead of completing in one `read_more`.
    struct ChunkedSource {
        data: Arc<Vec<u8>>,
        pos: usize,
        chunk: usize,
        starts: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl SerialSource for ChunkedSource {
        async fn start(&mut self) -> Result<()> {
            self.pos = 0;
            *self.starts.lock().await += 1;
            Ok(())
        }

        async fn read_more(&mut self, buf: &mut [u8]) -> Result<usize> {
            let remaining = self.data.len() - self.pos;
            let n = remaining.min(buf.len()).min(self.chunk);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn content() -> Vec<u8> {
        (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect()
    }

    #[tokio::test]
    async fn sequential_reads_match_source() {
        let data = Arc::new(content());
        let starts = Arc::new(Mutex::new(0));
        let source = ChunkedSource { data: data.clone(), pos: 0, chunk: 777, starts: starts.clone() };
        let dir = tempfile::tempdir().unwrap();
        let sf = SerialFile::new(source, dir.path(), false).await.unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = sf.pread(&mut buf, out.len() as u64).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, *data);
        assert_eq!(*starts.lock().await, 1);
    }

    #[tokio::test]
    async fn backward_seek_serves_from_spool_without_restarting() {
        let data = Arc::new(content());
        let starts = Arc::new(Mutex::new(0));
        let source = ChunkedSource { data: data.clone(), pos: 0, chunk: 4096, starts: starts.clone() };
        let dir = tempfile::tempdir().unwrap();
        let sf = SerialFile::new(source, dir.path(), false).await.unwrap();

        let mut buf = [0u8; 1000];
        sf.pread(&mut buf, 5000).await.unwrap();
        let mut back = [0u8; 100];
        let n = sf.pread(&mut back, 10).await.unwrap();
        assert_eq!(n, 100);
        assert_eq!(&back[..], &data[10..110]);
        assert_eq!(*starts.lock().await, 1);
    }

    #[tokio::test]
    async fn nocache_backward_seek_restarts_source() {
        let data = Arc::new(content());
        let starts = Arc::new(Mutex::new(0));
        let source = ChunkedSource { data: data.clone(), pos: 0, chunk: 4096, starts: starts.clone() };
        let dir = tempfile::tempdir().unwrap();
        let sf = SerialFile::new(source, dir.path(), true).await.unwrap();

        let mut buf = [0u8; 1000];
        sf.pread(&mut buf, 5000).await.unwrap();
        let mut back = [0u8; 100];
        let n = sf.pread(&mut back, 10).await.unwrap();
        assert_eq!(n, 100);
        assert_eq!(&back[..], &data[10..110]);
        assert_eq!(*starts.lock().await, 2);
    }

    #[tokio::test]
    async fn size_runs_the_stream_to_completion() {
        let data = Arc::new(content());
        let starts = Arc::new(Mutex::new(0));
        let source = ChunkedSource { data: data.clone(), pos: 0, chunk: 1500, starts };
        let dir = tempfile::tempdir().unwrap();
        let sf = SerialFile::new(source, dir.path(), false).await.unwrap();
        assert_eq!(sf.size().await.unwrap(), data.len() as u64);
    }

    #[tokio::test]
    async fn read_past_eof_returns_zero() {
        let data = Arc::new(b"short".to_vec());
        let starts = Arc::new(Mutex::new(0));
        let source = ChunkedSource { data: data.clone(), pos: 0, chunk: 5, starts };
        let dir = tempfile::tempdir().unwrap();
        let sf = SerialFile::new(source, dir.path(), false).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(sf.pread(&mut buf, 1000).await.unwrap(), 0);
    }
}
