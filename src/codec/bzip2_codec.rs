//! bzip2 codec. bzip2 has no public
//! mid-stream state snapshot, so unlike [`crate::codec::gzip`] this codec
//! never checkpoints: a seek behind the current position means decoding the
//! whole stream again from byte zero. `ZFile` only ever asks for forward
//! progress or a full reset, never a restore.

use std::io::Read;
use std::sync::Arc;

use bzip2::read::BzDecoder;

use crate::codec::blocking::BlockingBaseReader;
use crate::core_types::VFile;
use crate::error::{ErrorKind, Result};

pub struct Bzip2Codec {
    inner: BzDecoder<BlockingBaseReader>,
    total_out: u64,
}

impl Bzip2Codec {
    pub fn new(file: Arc<VFile>, data_offset: u64) -> Self {
        Bzip2Codec { inner: BzDecoder::new(BlockingBaseReader::new(file, data_offset)), total_out: 0 }
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
