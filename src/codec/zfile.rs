//! The random-access decode engine.
//!
//! A `ZFile` sits over one base file and exposes `pread` over the
//! *decoded* byte stream. It never materializes the whole decoded stream
//! on disk; instead, on every `pread` it picks the cheapest way to reach
//! the requested offset:
//!
//! 1. **Continue forward** from wherever the process-wide cached decoder
//!    for this stream currently sits, if that's behind the target offset.
//! 2. **Restore a checkpoint** from [`ZCache`] and decode forward from
//!    there, if that checkpoint is closer than continuing and the format
//!    supports checkpointing (gzip only — see [`crate::codec::gzip`]).
//! 3. **Reset** and decode from the very start of the stream.
//!
//! Whichever has the smallest "bytes to decode-and-discard" wins, with
//! `restore_cost_bytes` (`Config::restore_cost_bytes`) added as a fixed
//! penalty to the checkpoint-restore option to account for the cost of
//! reading the state back off disk and re-priming the decoder. Every
//! decode happens inside `tokio::task::spawn_blocking` since the codec
//! libraries are synchronous.
//!
//! A single process-wide slot per logical stream holds the most recently
//! used live decoder, so repeated sequential reads — the overwhelmingly
//! common access pattern — never pay a restore or reset at all.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::codec::bzip2_codec::Bzip2Codec;
use crate::codec::gzip::GzipStream;
use crate::codec::xz::XzCodec;
use crate::codec::zcache::ZCache;
use crate::codec::zstd_codec::ZstdCodec;
use crate::core_types::VFile;
use crate::error::{ErrorKind, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

enum CodecImpl {
    Gzip(GzipStream),
    Bzip2(Bzip2Codec),
    Xz(XzCodec),
    Zstd(ZstdCodec),
}

impl CodecImpl {
    fn open_fresh(format: Format, base: &Arc<VFile>, member_start: u64) -> Result<Self> {
        Ok(match format {
            Format::Gzip => CodecImpl::Gzip(GzipStream::open(base.clone(), member_start)?),
            Format::Bzip2 => CodecImpl::Bzip2(Bzip2Codec::new(base.clone(), member_start)),
            Format::Xz => CodecImpl::Xz(XzCodec::new(base.clone(), member_start)),
            Format::Zstd => CodecImpl::Zstd(ZstdCodec::new(base.clone(), member_start)?),
        })
    }

    fn total_out(&self) -> u64 {
        match self {
            CodecImpl::Gzip(s) => s.total_out(),
            CodecImpl::Bzip2(s) => s.total_out(),
            CodecImpl::Xz(s) => s.total_out(),
            CodecImpl::Zstd(s) => s.total_out(),
        }
    }

    fn read_more(&mut self, out: &mut [u8]) -> Result<usize> {
        match self {
            CodecImpl::Gzip(s) => s.read_more(out),
            CodecImpl::Bzip2(s) => s.read_more(out),
            CodecImpl::Xz(s) => s.read_more(out),
            CodecImpl::Zstd(s) => s.read_more(out),
        }
    }

    fn supports_checkpoint(&self) -> bool {
        matches!(self, CodecImpl::Gzip(_))
    }

    fn save_checkpoint_state(&self) -> Option<Vec<u8>> {
        match self {
            CodecImpl::Gzip(s) => Some(s.save_checkpoint_state()),
            _ => None,
        }
    }

    fn restore(format: Format, base: &Arc<VFile>, member_start: u64, state: &[u8]) -> Result<Self> {
        match format {
            Format::Gzip => Ok(CodecImpl::Gzip(GzipStream::restore(base.clone(), member_start, state)?)),
            _ => Err(ErrorKind::NotSupported),
        }
    }
}

/// Process-wide single-slot cache of the most recently used live decoder
/// per logical stream (`ZCache::id`).
fn stream_cache() -> &'static Mutex<HashMap<u64, CodecImpl>> {
    static CACHE: OnceLock<Mutex<HashMap<u64, CodecImpl>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A random-access view of one compressed member's decoded bytes.
pub struct ZFile {
    base: Arc<VFile>,
    member_start: u64,
    format: Format,
    zcache: Arc<ZCache>,
    restore_cost_bytes: u64,
    index_distance: u64,
}

const DISCARD_CHUNK: usize = 16 * 1024;

impl ZFile {
    pub fn new(base: Arc<VFile>, member_start: u64, format: Format, zcache: Arc<ZCache>, restore_cost_bytes: u64, index_distance: u64) -> Self {
        ZFile { base, member_start, format, zcache, restore_cost_bytes, index_distance }
    }

    pub fn cached_size(&self) -> Option<u64> {
        self.zcache.size()
    }

    pub async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if let Some(size) = self.zcache.size() {
            if offset >= size {
                return Ok(0);
            }
        }
        let base = self.base.clone();
        let zcache = self.zcache.clone();
        let format = self.format;
        let member_start = self.member_start;
        let restore_cost_bytes = self.restore_cost_bytes;
        let index_distance = self.index_distance;
        let want = buf.len();
        let (data, produced) = tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, usize)> {
            let mut out = vec![0u8; want];
            let n = Self::pread_sync(&base, &zcache, format, member_start, restore_cost_bytes, index_distance, offset, &mut out)?;
            Ok((out, n))
        })
        .await
        .map_err(|_| ErrorKind::ServerFault)??;
        buf[..produced].copy_from_slice(&data[..produced]);
        Ok(produced)
    }

    #[allow(clippy::too_many_arguments)]
    fn pread_sync(
        base: &Arc<VFile>,
        zcache: &Arc<ZCache>,
        format: Format,
        member_start: u64,
        restore_cost_bytes: u64,
        index_distance: u64,
        offset: u64,
        out: &mut [u8],
    ) -> Result<usize> {
        let mut cache = stream_cache().lock().unwrap();
        let cached = cache.remove(&zcache.id());

        let cached_cost = cached.as_ref().filter(|c| c.total_out() <= offset).map(|c| offset - c.total_out());
        let checkpoint = zcache.best_checkpoint_for(offset);
        let checkpoint_cost = checkpoint.map(|cp| (offset - cp.decoded_offset) + restore_cost_bytes);
        let reset_cost = offset;

        enum Choice {
            Continue,
            Checkpoint,
            Reset,
        }
        let mut choice = Choice::Reset;
        let mut best = reset_cost;
        if let Some(c) = cached_cost {
            if c <= best {
                best = c;
                choice = Choice::Continue;
            }
        }
        if let Some(c) = checkpoint_cost {
            if c < best {
                choice = Choice::Checkpoint;
            }
        }

        let mut decoder = match choice {
            Choice::Continue => cached.expect("continue implies a cached decoder"),
            Choice::Checkpoint => {
                let cp = checkpoint.expect("checkpoint implies a recorded checkpoint");
                let state = zcache.restore(cp)?;
                CodecImpl::restore(format, base, member_start, &state)?
            }
            Choice::Reset => CodecImpl::open_fresh(format, base, member_start)?,
        };

        let mut discard = [0u8; DISCARD_CHUNK];
        let mut last_checkpoint_at = decoder.total_out();
        while decoder.total_out() < offset {
            let to_discard = ((offset - decoder.total_out()) as usize).min(discard.len());
            let n = decoder.read_more(&mut discard[..to_discard])?;
            if n == 0 {
                zcache.set_size(decoder.total_out());
                cache.insert(zcache.id(), decoder);
                return Ok(0);
            }
            Self::maybe_checkpoint(&decoder, zcache, index_distance, &mut last_checkpoint_at);
        }

        let mut produced = 0usize;
        while produced < out.len() {
            let n = decoder.read_more(&mut out[produced..])?;
            if n == 0 {
                zcache.set_size(decoder.total_out());
                break;
            }
            produced += n;
            Self::maybe_checkpoint(&decoder, zcache, index_distance, &mut last_checkpoint_at);
        }

        cache.insert(zcache.id(), decoder);
        Ok(produced)
    }

    fn maybe_checkpoint(decoder: &CodecImpl, zcache: &Arc<ZCache>, index_distance: u64, last_checkpoint_at: &mut u64) {
        if !decoder.supports_checkpoint() {
            return;
        }
        if decoder.total_out() < *last_checkpoint_at + index_distance {
            return;
        }
        if let Some(state) = decoder.save_checkpoint_state() {
            if zcache.checkpoint(decoder.total_out(), &state).is_ok() {
                *last_checkpoint_at = decoder.total_out();
            }
        }
    }
}
