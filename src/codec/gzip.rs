use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::Codec;
use crate::{
    compression::CompressionAlgorithm,
    error::{Error, Result},
};

const GZIP: CompressionAlgorithm = CompressionAlgorithm::Gzip;

/// log2 of the deflate window, the largest zlib supports.
const WINDOW_BITS: u8 = 15;

fn finished() -> Error {
    Error::codec(GZIP, "stream already finished")
}

pub(super) struct Encoder {
    inner: Compress,
    finished: bool,
}

impl Encoder {
    pub fn new(level: i32) -> Self {
        let level = match u32::try_from(level) {
            Ok(level) => Compression::new(level),
            Err(_) => Compression::default(),
        };
        Self {
            inner: Compress::new_gzip(level, WINDOW_BITS),
            finished: false,
        }
    }

    fn run(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        flush: FlushCompress,
    ) -> Result<(usize, usize, Status)> {
        if self.finished {
            return Err(finished());
        }
        let (total_in, total_out) = (self.inner.total_in(), self.inner.total_out());
        let status = self
            .inner
            .compress(input, output, flush)
            .map_err(|e| Error::codec(GZIP, format!("could not compress data: {e}")))?;
        Ok((
            (self.inner.total_in() - total_in) as usize,
            (self.inner.total_out() - total_out) as usize,
            status,
        ))
    }
}

impl Codec for Encoder {
    fn algorithm(&self) -> CompressionAlgorithm {
        GZIP
    }

    fn code(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize)> {
        let (consumed, produced, _) = self.run(input, output, FlushCompress::None)?;
        Ok((consumed, produced))
    }

    fn finish(&mut self, output: &mut [u8]) -> Result<(usize, bool)> {
        let (_, produced, status) = self.run(&[], output, FlushCompress::Finish)?;
        self.finished = status == Status::StreamEnd;
        Ok((produced, self.finished))
    }
}

/// Decodes a single gzip member.
pub(super) struct Decoder {
    inner: Decompress,
    done: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            inner: Decompress::new_gzip(WINDOW_BITS),
            done: false,
        }
    }
}

impl Codec for Decoder {
    fn algorithm(&self) -> CompressionAlgorithm {
        GZIP
    }

    fn code(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize)> {
        if self.done {
            return match input.is_empty() {
                true => Ok((0, 0)),
                false => Err(Error::codec(GZIP, "unexpected data after end of stream")),
            };
        }

        let (total_in, total_out) = (self.inner.total_in(), self.inner.total_out());
        let status = self
            .inner
            .decompress(input, output, FlushDecompress::None)
            .map_err(|e| Error::codec(GZIP, format!("could not decompress data: {e}")))?;
        self.done = status == Status::StreamEnd;
        Ok((
            (self.inner.total_in() - total_in) as usize,
            (self.inner.total_out() - total_out) as usize,
        ))
    }

    fn finish(&mut self, _output: &mut [u8]) -> Result<(usize, bool)> {
        Ok((0, self.done))
    }
}
