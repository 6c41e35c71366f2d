//! LZ4 frame coding through liblz4.
//!
//! The encoder is the binding's writer, draining into a spill buffer that the
//! output window takes from. The decoder drives `LZ4F_decompress` directly,
//! since the binding only offers a pull-based reader.

use std::{
    cell::RefCell,
    io::{self, Write},
    ptr,
    rc::Rc,
};

use lz4::{
    liblz4::{
        check_error, LZ4FDecompressionContext, LZ4F_createDecompressionContext, LZ4F_decompress,
        LZ4F_freeDecompressionContext, LZ4F_VERSION,
    },
    BlockSize, EncoderBuilder,
};

use super::{Codec, OUTPUT_BLOCK_SIZE};
use crate::{
    compression::CompressionAlgorithm,
    error::{Error, Result},
};

const LZ4: CompressionAlgorithm = CompressionAlgorithm::Lz4;

fn codec_error(message: impl ToString) -> Error {
    Error::codec(LZ4, message)
}

/// Encoded bytes the output window has not taken yet.
#[derive(Clone, Default)]
struct Spill(Rc<RefCell<Vec<u8>>>);

impl Spill {
    /// Moves as much as fits into `output`, returning how much that was.
    fn drain_into(&self, output: &mut [u8]) -> usize {
        let mut data = self.0.borrow_mut();
        let n = data.len().min(output.len());
        output[..n].copy_from_slice(&data[..n]);
        data.drain(..n);
        n
    }

    fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

impl Write for Spill {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(super) struct Encoder {
    inner: Option<lz4::Encoder<Spill>>,
    spill: Spill,
}

impl Encoder {
    /// Level 0 is the fast mode; 3 and up use the high-compression coder.
    pub fn new(level: i32) -> Result<Self> {
        let level = u32::try_from(level)
            .map_err(|_| codec_error(format!("invalid compression level {level}")))?;
        let spill = Spill::default();
        let inner = EncoderBuilder::new()
            .block_size(BlockSize::Max256KB)
            .level(level)
            .build(spill.clone())
            .map_err(|e| codec_error(format!("could not create compression context: {e}")))?;
        Ok(Self {
            inner: Some(inner),
            spill,
        })
    }
}

impl Codec for Encoder {
    fn algorithm(&self) -> CompressionAlgorithm {
        LZ4
    }

    fn code(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize)> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| codec_error("stream already finished"))?;

        let produced = self.spill.drain_into(output);
        if !self.spill.is_empty() || input.is_empty() {
            return Ok((0, produced));
        }

        let consumed = input.len().min(OUTPUT_BLOCK_SIZE);
        inner
            .write_all(&input[..consumed])
            .map_err(|e| codec_error(format!("could not compress data: {e}")))?;
        let more = self.spill.drain_into(&mut output[produced..]);
        Ok((consumed, produced + more))
    }

    fn finish(&mut self, output: &mut [u8]) -> Result<(usize, bool)> {
        if let Some(inner) = self.inner.take() {
            let (_, result) = inner.finish();
            result.map_err(|e| codec_error(format!("could not end compression: {e}")))?;
        }
        let produced = self.spill.drain_into(output);
        Ok((produced, self.spill.is_empty()))
    }
}

/// Decodes any number of concatenated and skippable frames.
pub(super) struct Decoder {
    context: LZ4FDecompressionContext,
    /// Nothing is left of the last frame started, in the input or the output.
    at_frame_end: bool,
}

impl Decoder {
    pub fn new() -> Result<Self> {
        let mut context = LZ4FDecompressionContext(ptr::null_mut());
        check_error(unsafe { LZ4F_createDecompressionContext(&mut context, LZ4F_VERSION) })
            .map_err(|e| codec_error(format!("could not create decompression context: {e}")))?;
        Ok(Self {
            context,
            at_frame_end: true,
        })
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        unsafe {
            LZ4F_freeDecompressionContext(self.context);
        }
    }
}

impl Codec for Decoder {
    fn algorithm(&self) -> CompressionAlgorithm {
        LZ4
    }

    fn code(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize)> {
        if input.is_empty() && self.at_frame_end {
            return Ok((0, 0));
        }

        let mut consumed = input.len();
        let mut produced = output.len();
        // liblz4 reads at most `consumed` bytes and writes at most `produced`,
        // then stores how many it actually used in each.
        let hint = check_error(unsafe {
            LZ4F_decompress(
                self.context,
                output.as_mut_ptr(),
                &mut produced,
                input.as_ptr(),
                &mut consumed,
                ptr::null(),
            )
        })
        .map_err(|e| codec_error(format!("could not decompress data: {e}")))?;

        if consumed > 0 || produced > 0 {
            self.at_frame_end = hint == 0;
        }
        Ok((consumed, produced))
    }

    fn finish(&mut self, _output: &mut [u8]) -> Result<(usize, bool)> {
        Ok((0, self.at_frame_end))
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use lz4::{BlockMode, ContentChecksum};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use similar_asserts::assert_eq;

    use super::*;
    use crate::codec::run_codec;

    fn sample() -> Vec<u8> {
        (0..400_000u32)
            .map(|i| (i % 251) as u8 ^ (i / 4096) as u8)
            .collect()
    }

    fn encode(builder: &EncoderBuilder, data: &[u8]) -> Vec<u8> {
        let mut encoder = builder.build(vec![]).unwrap();
        encoder.write_all(data).unwrap();
        let (compressed, result) = encoder.finish();
        result.unwrap();
        compressed
    }

    fn decode(compressed: &[u8], piece: usize) -> Result<Vec<u8>> {
        run_codec(&mut Decoder::new()?, compressed, piece)
    }

    #[test]
    fn test_frame_variants() {
        let data = sample();
        let variants = [
            (BlockSize::Default, BlockMode::Linked, ContentChecksum::ChecksumEnabled),
            (BlockSize::Max64KB, BlockMode::Linked, ContentChecksum::NoChecksum),
            (BlockSize::Max64KB, BlockMode::Independent, ContentChecksum::ChecksumEnabled),
            (BlockSize::Max1MB, BlockMode::Independent, ContentChecksum::NoChecksum),
        ];
        for (size, mode, checksum) in variants {
            let mut builder = EncoderBuilder::new();
            builder.block_size(size).block_mode(mode).checksum(checksum);
            let compressed = encode(&builder, &data);
            for piece in [1, 13, 4096, compressed.len()] {
                assert_eq!(decode(&compressed, piece).unwrap(), data);
            }
        }
    }

    #[test]
    fn test_encoder_roundtrip() {
        let data = sample();
        let compressed = run_codec(&mut Encoder::new(0).unwrap(), &data, 1000).unwrap();

        let mut decoded = vec![];
        lz4::Decoder::new(compressed.as_slice())
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, data);
        assert_eq!(decode(&compressed, 777).unwrap(), data);
    }

    #[test]
    fn test_levels() {
        let words = ["wal", "segment", "checkpoint", "base", "backup", "tablespace", "standby"];
        let mut rng = StdRng::seed_from_u64(5);
        let mut data = vec![];
        while data.len() < 2_000_000 {
            data.extend_from_slice(words[rng.random_range(0..words.len())].as_bytes());
            data.push(b' ');
        }

        let fast = run_codec(&mut Encoder::new(1).unwrap(), &data, 65536).unwrap();
        let high = run_codec(&mut Encoder::new(12).unwrap(), &data, 65536).unwrap();
        assert!(high.len() < fast.len());
        assert_eq!(decode(&fast, 4096).unwrap(), data);
        assert_eq!(decode(&high, 4096).unwrap(), data);
        assert!(Encoder::new(-1).is_err());
    }

    #[test]
    fn test_concatenated_and_skippable() {
        let mut stream = encode(&EncoderBuilder::new(), b"first ");
        stream.extend_from_slice(&0x184D_2A5Au32.to_le_bytes());
        stream.extend_from_slice(&3u32.to_le_bytes());
        stream.extend_from_slice(b"xyz");
        stream.extend(encode(&EncoderBuilder::new(), b"second"));
        assert_eq!(decode(&stream, 2).unwrap(), b"first second".to_vec());
    }

    #[test]
    fn test_truncated() {
        let compressed = encode(&EncoderBuilder::new(), &sample());
        let err = decode(&compressed[..compressed.len() - 3], 100).unwrap_err();
        assert_eq!(err.to_string(), "lz4: unexpected end of compressed data");
    }

    #[test]
    fn test_corrupt() {
        let mut compressed = encode(&EncoderBuilder::new(), &sample());
        let last = compressed.len() - 1;
        compressed[last] ^= 0xff;
        assert!(decode(&compressed, 4096).is_err());

        let mut compressed = encode(&EncoderBuilder::new(), b"abc");
        compressed[5] ^= 0x01; // BD byte
        assert!(decode(&compressed, 4096).is_err());
    }
}
