//! Compression and decompression stages.
//!
//! Every algorithm is wrapped behind [`Codec`], and a single streamer type
//! drives whichever codec it was built with. Codecs never look at archive
//! structure: whatever kind of chunk arrives, only its bytes are coded and
//! the output goes downstream as [`Chunk::Unknown`].

use std::{fs::File, path::Path};

use log::debug;

use crate::{
    compression::{CompressionAlgorithm, CompressionSpec},
    error::{Error, Result},
    plain::PlainWriter,
    streamer::{Chunk, Streamer},
};

mod gzip;
mod lz4;
mod zstd;

/// Output is handed downstream in blocks of this size.
///
/// Codecs code into a window of this size, so no chunk sent downstream is
/// larger however far a single input chunk expands.
pub const OUTPUT_BLOCK_SIZE: usize = 64 * 1024;

/// A compression or decompression context driven through an output window.
pub trait Codec {
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Codes from the front of `input` into `output`.
    ///
    /// Returns how many bytes were consumed and how many were produced. A
    /// codec that filled `output` may still hold more; it is called again,
    /// with whatever input is left, once the window has been emptied.
    fn code(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize)>;

    /// Ends the stream, writing what is left into `output`.
    ///
    /// Returns how many bytes were produced and whether the stream is now
    /// complete. A decoder whose input stopped part-way through a frame never
    /// completes.
    fn finish(&mut self, output: &mut [u8]) -> Result<(usize, bool)>;
}

/// Builds the encoder for a validated specification.
pub fn encoder(spec: &CompressionSpec) -> Result<Box<dyn Codec>> {
    spec.validate()?;
    Ok(match spec.algorithm {
        CompressionAlgorithm::Gzip => Box::new(gzip::Encoder::new(spec.level)),
        CompressionAlgorithm::Lz4 => Box::new(lz4::Encoder::new(spec.level)?),
        CompressionAlgorithm::Zstd => Box::new(zstd::Encoder::new(spec)?),
        CompressionAlgorithm::None => {
            return Err(Error::codec(spec.algorithm, "no codec for uncompressed data"))
        }
    })
}

pub fn decoder(algorithm: CompressionAlgorithm) -> Result<Box<dyn Codec>> {
    Ok(match algorithm {
        CompressionAlgorithm::Gzip => Box::new(gzip::Decoder::new()),
        CompressionAlgorithm::Lz4 => Box::new(lz4::Decoder::new()?),
        CompressionAlgorithm::Zstd => Box::new(zstd::Decoder::new()?),
        CompressionAlgorithm::None => {
            return Err(Error::codec(algorithm, "no codec for uncompressed data"))
        }
    })
}

/// A streamer that runs every payload byte through a codec.
pub struct CodecStreamer<S> {
    next: S,
    codec: Box<dyn Codec>,
    buffer: Box<[u8]>,
    filled: usize,
    bytes_in: u64,
    bytes_out: u64,
}

impl<S: Streamer> CodecStreamer<S> {
    pub fn new(next: S, codec: Box<dyn Codec>) -> Self {
        Self {
            next,
            codec,
            buffer: vec![0; OUTPUT_BLOCK_SIZE].into_boxed_slice(),
            filled: 0,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// A compressor forwarding compressed bytes to `next`.
    pub fn compressor(next: S, spec: &CompressionSpec) -> Result<Self> {
        Ok(Self::new(next, encoder(spec)?))
    }

    /// A decompressor forwarding decompressed bytes to `next`.
    pub fn decompressor(next: S, algorithm: CompressionAlgorithm) -> Result<Self> {
        Ok(Self::new(next, decoder(algorithm)?))
    }

    fn emit(&mut self) -> Result<()> {
        if self.filled > 0 {
            self.bytes_out += self.filled as u64;
            self.next.content(Chunk::Unknown(&self.buffer[..self.filled]))?;
            self.filled = 0;
        }
        Ok(())
    }
}

impl<S: Streamer> Streamer for CodecStreamer<S> {
    fn content(&mut self, chunk: Chunk<'_>) -> Result<()> {
        let mut data = chunk.data();
        self.bytes_in += data.len() as u64;

        loop {
            let (consumed, produced) = self
                .codec
                .code(data, &mut self.buffer[self.filled..])?;
            data = &data[consumed..];
            self.filled += produced;

            if self.filled == self.buffer.len() {
                self.emit()?;
            } else if data.is_empty() {
                return Ok(());
            } else if consumed == 0 && produced == 0 {
                return Err(Error::codec(
                    self.codec.algorithm(),
                    "no progress on compressed data",
                ));
            }
        }
    }

    fn finalize(&mut self) -> Result<()> {
        loop {
            let (produced, done) = self.codec.finish(&mut self.buffer[self.filled..])?;
            self.filled += produced;

            if done {
                break;
            } else if self.filled == self.buffer.len() {
                self.emit()?;
            } else if produced == 0 {
                return Err(Error::codec(
                    self.codec.algorithm(),
                    "unexpected end of compressed data",
                ));
            }
        }
        self.emit()?;

        debug!(
            "{} stream done: {} bytes in, {} bytes out",
            self.codec.algorithm(),
            self.bytes_in,
            self.bytes_out
        );
        self.next.finalize()
    }
}

/// Runs `codec` over `input` in pieces of `piece` bytes through a small window.
#[cfg(test)]
pub(crate) fn run_codec(codec: &mut dyn Codec, input: &[u8], piece: usize) -> Result<Vec<u8>> {
    let mut window = [0; 1000];
    let mut out = vec![];
    for mut data in input.chunks(piece) {
        loop {
            let (consumed, produced) = codec.code(data, &mut window)?;
            out.extend_from_slice(&window[..produced]);
            data = &data[consumed..];
            if produced < window.len() && data.is_empty() {
                break;
            }
        }
    }
    loop {
        let (produced, done) = codec.finish(&mut window)?;
        out.extend_from_slice(&window[..produced]);
        if done {
            return Ok(out);
        }
        if produced == 0 {
            return Err(Error::codec(codec.algorithm(), "unexpected end of compressed data"));
        }
    }
}

/// A terminal writer producing a (possibly compressed) file.
///
/// With [`CompressionAlgorithm::None`] this is just a [`PlainWriter`].
pub fn compressed_file_writer(
    path: impl AsRef<Path>,
    file: Option<&File>,
    spec: &CompressionSpec,
) -> Result<Box<dyn Streamer>> {
    // validate before anything is created on disk
    spec.validate()?;
    let writer = PlainWriter::new(path, file)?;
    Ok(match spec.algorithm {
        CompressionAlgorithm::None => Box::new(writer),
        _ => Box::new(CodecStreamer::compressor(writer, spec)?),
    })
}

#[cfg(test)]
mod test {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::sink::MemorySink;

    fn payload(len: usize) -> Vec<u8> {
        // compressible but not trivially so
        let mut rng = StdRng::seed_from_u64(17);
        (0..len).map(|_| b"abcdefgh"[rng.random_range(0..8)]).collect()
    }

    fn roundtrip(spec: &CompressionSpec, data: &[u8], piece: usize) -> Vec<u8> {
        let (sink, handle) = MemorySink::new();
        let decompressor = CodecStreamer::decompressor(sink, spec.algorithm).unwrap();
        let mut compressor = CodecStreamer::compressor(decompressor, spec).unwrap();
        for chunk in data.chunks(piece) {
            compressor.content(Chunk::Unknown(chunk)).unwrap();
        }
        compressor.finalize().unwrap();
        assert_eq!(handle.finalize_count(), 1);
        handle.all_bytes()
    }

    #[test]
    fn test_roundtrip_all() {
        let data = payload(300_000);
        for algorithm in [
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
        ] {
            let spec = CompressionSpec::new(algorithm);
            assert_eq!(roundtrip(&spec, &data, 7777), data, "{algorithm}");
            assert_eq!(roundtrip(&spec, b"", 1), b"".to_vec(), "{algorithm}");
        }
    }

    #[test]
    fn test_zstd_options() {
        let spec =
            CompressionSpec::parse(CompressionAlgorithm::Zstd, "level=5,workers=2,long").unwrap();
        let data = payload(200_000);
        assert_eq!(roundtrip(&spec, &data, 100_000), data);
    }

    #[test]
    fn test_output_blocks() {
        let spec = CompressionSpec::parse(CompressionAlgorithm::Gzip, "1").unwrap();
        let (sink, handle) = MemorySink::new();
        let mut decompressor =
            CodecStreamer::decompressor(sink, CompressionAlgorithm::Gzip).unwrap();

        let data = payload(1 << 20);
        let compressed = run_codec(encoder(&spec).unwrap().as_mut(), &data, data.len()).unwrap();

        decompressor.content(Chunk::Unknown(&compressed)).unwrap();
        decompressor.finalize().unwrap();
        let chunks = handle.chunks();
        let (last, full) = chunks.split_last().unwrap();
        assert_eq!(full.len(), data.len() / OUTPUT_BLOCK_SIZE);
        assert!(full.iter().all(|c| c.data.len() == OUTPUT_BLOCK_SIZE));
        assert!(last.data.len() <= OUTPUT_BLOCK_SIZE);
        assert_eq!(handle.all_bytes(), data);
    }

    /// Keeps only the sizes of what goes past.
    #[derive(Default)]
    struct Measure {
        largest: usize,
        total: u64,
        all_zero: bool,
    }

    impl Streamer for Measure {
        fn content(&mut self, chunk: Chunk<'_>) -> Result<()> {
            let data = chunk.data();
            self.largest = self.largest.max(data.len());
            self.total += data.len() as u64;
            self.all_zero &= data.iter().all(|&b| b == 0);
            Ok(())
        }

        fn finalize(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_output_bounded_on_zeros() {
        const LEN: usize = 64 << 20;
        let zeros = vec![0; LEN];

        for algorithm in [
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
        ] {
            let measure = Measure {
                all_zero: true,
                ..Default::default()
            };
            let mut compressor =
                CodecStreamer::compressor(measure, &CompressionSpec::new(algorithm)).unwrap();
            compressor.content(Chunk::Unknown(&zeros)).unwrap();
            compressor.finalize().unwrap();
            assert!(compressor.next.largest <= OUTPUT_BLOCK_SIZE, "{algorithm}");

            let compressed =
                run_codec(encoder(&CompressionSpec::new(algorithm)).unwrap().as_mut(), &zeros, LEN)
                    .unwrap();
            assert!(compressed.len() < LEN / 100, "{algorithm}");

            let measure = Measure {
                all_zero: true,
                ..Default::default()
            };
            let mut decompressor = CodecStreamer::decompressor(measure, algorithm).unwrap();
            decompressor.content(Chunk::Unknown(&compressed)).unwrap();
            decompressor.finalize().unwrap();

            let measure = &decompressor.next;
            assert_eq!(measure.largest, OUTPUT_BLOCK_SIZE, "{algorithm}");
            assert_eq!(measure.total, LEN as u64, "{algorithm}");
            assert!(measure.all_zero, "{algorithm}");
        }
    }

    #[test]
    fn test_truncated_input() {
        let data = payload(200_000);
        for algorithm in [
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
        ] {
            let compressed =
                run_codec(encoder(&CompressionSpec::new(algorithm)).unwrap().as_mut(), &data, 4096)
                    .unwrap();
            let (sink, _handle) = MemorySink::new();
            let mut decompressor = CodecStreamer::decompressor(sink, algorithm).unwrap();
            decompressor
                .content(Chunk::Unknown(&compressed[..compressed.len() - 5]))
                .unwrap();
            assert_eq!(
                decompressor.finalize().unwrap_err().to_string(),
                format!("{algorithm}: unexpected end of compressed data")
            );
        }
    }

    #[test]
    fn test_invalid_spec() {
        let spec = CompressionSpec::parse(CompressionAlgorithm::Gzip, "workers=3").unwrap();
        let (sink, _handle) = MemorySink::new();
        assert!(matches!(
            CodecStreamer::compressor(sink, &spec).err().unwrap(),
            Error::InvalidCompression(_)
        ));
        assert!(decoder(CompressionAlgorithm::None).is_err());
    }

    #[test]
    fn test_corrupt_input() {
        for algorithm in [
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
        ] {
            let (sink, _handle) = MemorySink::new();
            let mut decompressor = CodecStreamer::decompressor(sink, algorithm).unwrap();
            let garbage = [0x55; 64];
            let result = decompressor
                .content(Chunk::Unknown(&garbage))
                .and_then(|()| decompressor.finalize());
            assert!(
                matches!(result, Err(Error::Codec { algorithm: a, .. }) if a == algorithm),
                "{algorithm}"
            );
        }
    }

    #[test]
    fn test_compressed_file_writer() {
        let tmp = TempDir::new().unwrap();
        let data = payload(100_000);

        for algorithm in [CompressionAlgorithm::None, CompressionAlgorithm::Zstd] {
            let path = tmp
                .path()
                .join(format!("base.tar{}", algorithm.file_suffix()));
            let mut writer =
                compressed_file_writer(&path, None, &CompressionSpec::new(algorithm)).unwrap();
            writer.content(Chunk::Unknown(&data)).unwrap();
            writer.finalize().unwrap();
            drop(writer);

            let written = std::fs::read(&path).unwrap();
            assert_eq!(CompressionAlgorithm::from_magic(&written), algorithm);
            let decoded = match algorithm {
                CompressionAlgorithm::None => written,
                _ => ::zstd::decode_all(written.as_slice()).unwrap(),
            };
            assert_eq!(decoded, data);
        }
    }
}
