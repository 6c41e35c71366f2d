use ::zstd::stream::raw::{self, CParameter, Operation, OutBuffer};

use super::Codec;
use crate::{
    compression::{CompressionAlgorithm, CompressionSpec},
    error::{Error, Result},
};

const ZSTD: CompressionAlgorithm = CompressionAlgorithm::Zstd;

fn finished() -> Error {
    Error::codec(ZSTD, "stream already finished")
}

pub(super) struct Encoder {
    inner: raw::Encoder<'static>,
    finished: bool,
}

impl Encoder {
    pub fn new(spec: &CompressionSpec) -> Result<Self> {
        let codec_error = |e: std::io::Error| Error::codec(ZSTD, e);

        let mut inner = raw::Encoder::new(spec.level).map_err(codec_error)?;
        if let Some(workers) = spec.workers {
            let workers = u32::try_from(workers).map_err(|_| {
                Error::codec(ZSTD, format!("could not set worker count to {workers}"))
            })?;
            inner
                .set_parameter(CParameter::NbWorkers(workers))
                .map_err(codec_error)?;
        }
        if let Some(long_distance) = spec.long_distance {
            inner
                .set_parameter(CParameter::EnableLongDistanceMatching(long_distance))
                .map_err(codec_error)?;
        }

        Ok(Self {
            inner,
            finished: false,
        })
    }
}

impl Codec for Encoder {
    fn algorithm(&self) -> CompressionAlgorithm {
        ZSTD
    }

    fn code(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize)> {
        if self.finished {
            return Err(finished());
        }
        let status = self
            .inner
            .run_on_buffers(input, output)
            .map_err(|e| Error::codec(ZSTD, format!("could not compress data: {e}")))?;
        Ok((status.bytes_read, status.bytes_written))
    }

    fn finish(&mut self, output: &mut [u8]) -> Result<(usize, bool)> {
        if self.finished {
            return Err(finished());
        }
        let mut output = OutBuffer::around(output);
        let remaining = self
            .inner
            .finish(&mut output, false)
            .map_err(|e| Error::codec(ZSTD, format!("could not end compression: {e}")))?;
        self.finished = remaining == 0;
        Ok((output.pos(), self.finished))
    }
}

/// Decodes any number of concatenated frames.
pub(super) struct Decoder {
    inner: raw::Decoder<'static>,
    /// Nothing is left of the last frame started, in the input or the output.
    at_frame_end: bool,
}

impl Decoder {
    pub fn new() -> Result<Self> {
        let inner = raw::Decoder::new().map_err(|e| Error::codec(ZSTD, e))?;
        Ok(Self {
            inner,
            at_frame_end: true,
        })
    }
}

impl Codec for Decoder {
    fn algorithm(&self) -> CompressionAlgorithm {
        ZSTD
    }

    fn code(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize)> {
        if input.is_empty() && self.at_frame_end {
            return Ok((0, 0));
        }
        let status = self
            .inner
            .run_on_buffers(input, output)
            .map_err(|e| Error::codec(ZSTD, format!("could not decompress data: {e}")))?;
        if status.bytes_read > 0 || status.bytes_written > 0 {
            self.at_frame_end = status.remaining == 0;
        }
        Ok((status.bytes_read, status.bytes_written))
    }

    fn finish(&mut self, _output: &mut [u8]) -> Result<(usize, bool)> {
        Ok((0, self.at_frame_end))
    }
}
