//! Gzip-family codec.
//!
//! Parses the 10-byte header plus optional extra/name/comment fields,
//! decodes the wrapped raw-deflate stream with `flate2::Decompress`, and
//! validates the 8-byte trailer (CRC-32 + ISIZE) at EOF. Multi-member
//! streams (several gzip members concatenated, as produced by `gzip
//! --rsyncable` or simple concatenation) are handled by peeking for a
//! fresh header once the current member's trailer has been consumed.
//!
//! Random access is implemented the way `zran`/`indexed_gzip` do it: we
//! keep a sliding window of the last 32 KiB of decoded output (deflate's
//! maximum back-reference distance) and hand it to a fresh
//! `Decompress::set_dictionary` on restore, rather than trying to snapshot
//! the decoder's internal bit-level state.

use std::io::Read as _;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use flate2::{Decompress, FlushDecompress, Status};

use crate::codec::blocking::BlockingBaseReader;
use crate::core_types::VFile;
use crate::error::{ErrorKind, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const DEFLATE_METHOD: u8 = 8;
const WINDOW_SIZE: usize = 32 * 1024;

const FLG_FTEXT: u8 = 1 << 0;
const FLG_FHCRC: u8 = 1 << 1;
const FLG_FEXTRA: u8 = 1 << 2;
const FLG_FNAME: u8 = 1 << 3;
const FLG_FCOMMENT: u8 = 1 << 4;

/// Parsed from the fixed 10-byte gzip header; `header_len` is the total
/// byte count consumed including any optional fields, i.e. the offset of
/// the first deflate byte relative to the start of this member.
pub struct HeaderInfo {
    pub header_len: usize,
}

/// Scans `buf` (which must start at a gzip member boundary and contain
/// enough bytes to cover the header) for the header fields and returns
/// how many bytes the header occupies.
pub fn parse_header(buf: &[u8]) -> Result<HeaderInfo> {
    if buf.len() < 10 || buf[0..2] != GZIP_MAGIC {
        return Err(ErrorKind::IO);
    }
    if buf[2] != DEFLATE_METHOD {
        return Err(ErrorKind::NotSupported);
    }
    let flg = buf[3];
    let mut pos = 10usize;
    if flg & FLG_FEXTRA != 0 {
        if buf.len() < pos + 2 {
            return Err(ErrorKind::IO);
        }
        let xlen = u16::from_le_bytes([buf[pos], buf[pos + 1]]) as usize;
        pos += 2 + xlen;
    }
    if flg & FLG_FNAME != 0 {
        pos += find_nul(buf, pos)? + 1;
    }
    if flg & FLG_FCOMMENT != 0 {
        pos += find_nul(buf, pos)? + 1;
    }
    if flg & FLG_FHCRC != 0 {
        pos += 2;
    }
    if buf.len() < pos {
        return Err(ErrorKind::IO);
    }
    Ok(HeaderInfo { header_len: pos })
}

fn find_nul(buf: &[u8], from: usize) -> Result<usize> {
    buf[from..].iter().position(|&b| b == 0).ok_or(ErrorKind::IO)
}

/// Whether `buf` looks like the start of a fresh gzip member.
pub fn looks_like_header(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[0..2] == GZIP_MAGIC
}

/// One gzip member's live decoder state.
pub struct GzipCodec {
    decompress: Decompress,
    crc: Crc32,
    window: Vec<u8>,
    total_in: u64,
    total_out: u64,
    finished_member: bool,
    crc_enabled: bool,
}

impl GzipCodec {
    /// Starts a fresh member at `total_in = total_out = 0` (relative to
    /// the member's own deflate stream start, i.e. right after its
    /// header).
    pub fn new() -> Self {
        GzipCodec {
            decompress: Decompress::new(false),
            crc: Crc32::new(),
            window: Vec::with_capacity(WINDOW_SIZE),
            total_in: 0,
            total_out: 0,
            finished_member: false,
            crc_enabled: true,
        }
    }

    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    pub fn disable_crc(&mut self) {
        self.crc_enabled = false;
    }

    /// Feed more compressed bytes, producing decoded output into `out`.
    /// Returns `(consumed, produced)`; `finished_member` becomes true once
    /// the deflate stream itself signals `StreamEnd` (trailer bytes are
    /// handled by the caller, which knows where the base file's raw bytes
    /// are).
    pub fn feed(&mut self, input: &[u8], out: &mut [u8]) -> Result<(usize, usize)> {
        let before_in = self.decompress.total_in();
        let before_out = self.decompress.total_out();
        let status = self
            .decompress
            .decompress(input, out, FlushDecompress::None)
            .map_err(|_| ErrorKind::IO)?;
        let consumed = (self.decompress.total_in() - before_in) as usize;
        let produced = (self.decompress.total_out() - before_out) as usize;
        self.total_in += consumed as u64;
        self.total_out += produced as u64;
        if self.crc_enabled {
            self.crc.update(&out[..produced]);
        }
        self.push_window(&out[..produced]);
        if status == Status::StreamEnd {
            self.finished_member = true;
        }
        Ok((consumed, produced))
    }

    pub fn is_finished_member(&self) -> bool {
        self.finished_member
    }

    fn push_window(&mut self, produced: &[u8]) {
        if produced.is_empty() {
            return;
        }
        self.window.extend_from_slice(produced);
        if self.window.len() > WINDOW_SIZE {
            let excess = self.window.len() - WINDOW_SIZE;
            self.window.drain(..excess);
        }
    }

    /// Validate the 8-byte gzip trailer (CRC-32 + ISIZE, both
    /// little-endian) against what we've decoded.
    pub fn validate_trailer(&self, trailer: &[u8; 8]) -> Result<()> {
        let stored_crc = u32::from_le_bytes(trailer[0..4].try_into().unwrap());
        let stored_isize = u32::from_le_bytes(trailer[4..8].try_into().unwrap());
        if self.crc_enabled && stored_crc != self.crc.clone().finalize() {
            return Err(ErrorKind::CrcMismatch);
        }
        if (self.total_out as u32) != stored_isize && self.total_out < u32::MAX as u64 {
            // ISIZE is the member size modulo 2^32; only meaningful for
            // members under 4 GiB, which covers everything this crate
            // exercises against.
            return Err(ErrorKind::CrcMismatch);
        }
        Ok(())
    }

    /// Serialize enough state to resume decoding from `total_out` later:
    /// the sliding window (primes `set_dictionary`), the running CRC, and
    /// the in/out counters.
    pub fn save_state(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let _ = buf.write_u64::<LittleEndian>(self.total_in);
        let _ = buf.write_u64::<LittleEndian>(self.total_out);
        let _ = buf.write_u32::<LittleEndian>(self.crc.clone().finalize());
        let _ = buf.write_u8(self.crc_enabled as u8);
        let _ = buf.write_u32::<LittleEndian>(self.window.len() as u32);
        buf.extend_from_slice(&self.window);
        buf
    }

    pub fn restore_state(state: &[u8]) -> Result<Self> {
        let mut cursor = state;
        let total_in = cursor.read_u64::<LittleEndian>().map_err(|_| ErrorKind::IO)?;
        let total_out = cursor.read_u64::<LittleEndian>().map_err(|_| ErrorKind::IO)?;
        let crc_so_far = cursor.read_u32::<LittleEndian>().map_err(|_| ErrorKind::IO)?;
        let crc_enabled = cursor.read_u8().map_err(|_| ErrorKind::IO)? != 0;
        let window_len = cursor.read_u32::<LittleEndian>().map_err(|_| ErrorKind::IO)? as usize;
        if cursor.len() < window_len {
            return Err(ErrorKind::IO);
        }
        let window = cursor[..window_len].to_vec();
        let mut decompress = Decompress::new(false);
        if !window.is_empty() {
            decompress.set_dictionary(&window).map_err(|_| ErrorKind::IO)?;
        }
        Ok(GzipCodec {
            decompress,
            crc: Crc32::new_with_initial(crc_so_far),
            window,
            total_in,
            total_out,
            finished_member: false,
            crc_enabled,
        })
    }
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self::new()
    }
}

const SCRATCH_LEN: usize = 8192;
const MAX_HEADER_PROBE: usize = 512;

/// Pulls raw bytes from a base file and drives a [`GzipCodec`] across
/// member boundaries, presenting one flat decoded stream the way a
/// multi-member `.gz` (as produced by `gzip --rsyncable` or plain
/// concatenation) is conventionally treated.
pub struct GzipStream {
    base: BlockingBaseReader,
    codec: GzipCodec,
    eof: bool,
}

impl GzipStream {
    /// `file`/`member_start` identify the base file and the byte offset of
    /// a gzip member's header (normally 0, for archive formats that nest a
    /// gzip member inside a larger container it can be nonzero).
    pub fn open(file: Arc<VFile>, member_start: u64) -> Result<Self> {
        let mut base = BlockingBaseReader::new(file, member_start);
        let header_len = Self::consume_header(&mut base)?;
        let _ = header_len;
        Ok(GzipStream { base, codec: GzipCodec::new(), eof: false })
    }

    fn consume_header(base: &mut BlockingBaseReader) -> Result<usize> {
        let mut probe = vec![0u8; MAX_HEADER_PROBE];
        let n = base.read(&mut probe).map_err(|_| ErrorKind::IO)?;
        probe.truncate(n);
        let info = parse_header(&probe)?;
        base.rewind((n - info.header_len) as u64);
        Ok(info.header_len)
    }

    pub fn total_out(&self) -> u64 {
        self.codec.total_out()
    }

    /// Restores a `GzipStream` from a saved checkpoint, repositioning the
    /// base reader to resume right after the bytes already consumed.
    pub fn restore(file: Arc<VFile>, member_start: u64, state: &[u8]) -> Result<Self> {
        let codec = GzipCodec::restore_state(state)?;
        let base = BlockingBaseReader::new(file, member_start + codec.total_in());
        Ok(GzipStream { base, codec, eof: false })
    }

    pub fn save_checkpoint_state(&self) -> Vec<u8> {
        self.codec.save_state()
    }

    /// Decodes more output into `out`, returning the number of bytes
    /// produced (`0` only at true end of stream). Transparently advances
    /// past member trailers and into the next member when one follows.
    pub fn read_more(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.eof {
            return Ok(0);
        }
        loop {
            if self.codec.is_finished_member() {
                let mut trailer = [0u8; 8];
                self.base.read_exact(&mut trailer).map_err(|_| ErrorKind::IO)?;
                self.codec.validate_trailer(&trailer)?;
                let mut probe = [0u8; 2];
                let n = self.base.read(&mut probe).map_err(|_| ErrorKind::IO)?;
                if n == 0 {
                    self.eof = true;
                    return Ok(0);
                }
                self.base.rewind(n as u64);
                if !looks_like_header(&probe[..n]) {
                    self.eof = true;
                    return Ok(0);
                }
                Self::consume_header(&mut self.base)?;
                self.codec = GzipCodec::new();
                continue;
            }
            let mut chunk = [0u8; SCRATCH_LEN];
            let n = self.base.read(&mut chunk).map_err(|_| ErrorKind::IO)?;
            if n == 0 {
                return Err(ErrorKind::IO);
            }
            let (consumed, produced) = self.codec.feed(&chunk[..n], out)?;
            if consumed < n {
                self.base.rewind((n - consumed) as u64);
            }
            if produced > 0 {
                return Ok(produced);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn make_gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn parse_header_plain() {
        let blob = make_gzip(b"hello");
        let info = parse_header(&blob).unwrap();
        assert_eq!(info.header_len, 10);
    }

    #[test]
    fn decode_full_member_matches_input() {
        let data = b"Hello, world!\n".repeat(100);
        let blob = make_gzip(&data);
        let info = parse_header(&blob).unwrap();
        let mut codec = GzipCodec::new();
        let mut out = vec![0u8; data.len() + 64];
        let (_, produced) = codec.feed(&blob[info.header_len..blob.len() - 8], &mut out).unwrap();
        assert_eq!(&out[..produced], &data[..]);
        assert!(codec.is_finished_member());
        let trailer: [u8; 8] = blob[blob.len() - 8..].try_into().unwrap();
        codec.validate_trailer(&trailer).unwrap();
    }

    #[test]
    fn checkpoint_restore_continues_decoding() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let blob = make_gzip(&data);
        let info = parse_header(&blob).unwrap();
        let body = &blob[info.header_len..blob.len() - 8];

        let mut codec = GzipCodec::new();
        let mut out = vec![0u8; data.len()];
        let mut consumed_total = 0usize;
        let mut produced_total = 0usize;
        // Decode roughly the first half.
        while produced_total < data.len() / 2 {
            let (c, p) = codec.feed(&body[consumed_total..], &mut out[produced_total..]).unwrap();
            consumed_total += c;
            produced_total += p;
        }
        let state = codec.save_state();
        let restored = GzipCodec::restore_state(&state).unwrap();
        assert_eq!(restored.total_out(), codec.total_out());

        let mut codec = restored;
        let mut rest = vec![0u8; data.len()];
        let mut rest_produced = 0usize;
        while !codec.is_finished_member() {
            let (c, p) = codec.feed(&body[consumed_total..], &mut rest[rest_produced..]).unwrap();
            consumed_total += c;
            rest_produced += p;
            if c == 0 && p == 0 {
                break;
            }
        }
        assert_eq!(&rest[..rest_produced], &data[produced_total..]);
    }
}
