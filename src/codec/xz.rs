//! xz/lzma codec. Same full-traversal-only
//! shape as [`crate::codec::bzip2_codec`]: xz2's decoder exposes no portable
//! snapshot either.

use std::io::Read;
use std::sync::Arc;

use xz2::read::XzDecoder;

use crate::codec::blocking::BlockingBaseReader;
use crate::core_types::VFile;
use crate::error::{ErrorKind, Result};

pub struct XzCodec {
    inner: XzDecoder<BlockingBaseReader>,
    total_out: u64,
}

impl XzCodec {
    pub fn new(file: Arc<VFile>, data_offset: u64) -> Self {
        XzCodec { inner: XzDecoder::new(BlockingBaseReader::new(file, data_offset)), total_out: 0 }
    }

    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    pub fn read_more(&mut self, out: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(out).map_err(|_| ErrorKind::IO)?;
        self.total_out += n as u64;
        Ok(n)
    }
}
