//! zstd codec. Same full-traversal-only
//! shape as [`crate::codec::bzip2_codec`] and [`crate::codec::xz`].

use std::io::Read;
use std::sync::Arc;

use zstd::stream::read::Decoder as ZstdDecoder;

use crate::codec::blocking::BlockingBaseReader;
use crate::core_types::VFile;
use crate::error::{ErrorKind, Result};

pub struct ZstdCodec {
    inner: ZstdDecoder<'static, std::io::BufReader<BlockingBaseReader>>,
    total_out: u64,
}

impl ZstdCodec {
    pub fn new(file: Arc<VFile>, data_offset: u64) -> Result<Self> {
        let reader = BlockingBaseReader::new(file, data_offset);
        let inner = ZstdDecoder::new(reader).map_err(|_| ErrorKind::IO)?;
        Ok(ZstdCodec { inner, total_out: 0 })
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
