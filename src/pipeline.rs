//! Assembling streamers into a pipeline and feeding it.

use std::{io::Read, path::PathBuf, str::FromStr};

use log::{debug, trace};

use crate::{
    check::ContractChecker,
    codec::{compressed_file_writer, CodecStreamer},
    compression::{CompressionAlgorithm, CompressionSpec},
    error::{Error, Result},
    extract::Extractor,
    inject::{RecoveryInjector, RecoveryOptions},
    streamer::{Chunk, Streamer, MAXPGPATH},
    tar::{TarArchiver, TarParser, TarTerminator},
    util::read_fill,
};

/// Default size of the reads feeding a pipeline.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("directory name too long")]
    TooLong,

    #[error("multiple \"=\" signs in tablespace mapping")]
    MultipleEquals,

    #[error("invalid tablespace mapping format \"{0}\", must be \"OLDDIR=NEWDIR\"")]
    InvalidFormat(String),

    #[error("old directory is not an absolute path in tablespace mapping: {0}")]
    OldNotAbsolute(String),

    #[error("new directory is not an absolute path in tablespace mapping: {0}")]
    NewNotAbsolute(String),
}

/// Relocates a tablespace: symlinks pointing at `old_dir` are created
/// pointing at `new_dir` instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TablespaceMapping {
    pub old_dir: String,
    pub new_dir: String,
}

/// Drops trailing slashes, keeping a lone "/".
fn canonicalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.is_empty() && path.starts_with('/') {
        true => "/".to_string(),
        false => trimmed.to_string(),
    }
}

impl FromStr for TablespaceMapping {
    type Err = MappingError;

    /// Parses `OLDDIR=NEWDIR`, where `\=` stands for a literal `=`.
    fn from_str(arg: &str) -> Result<Self, MappingError> {
        let mut old_dir = String::new();
        let mut new_dir = None::<String>;

        let mut chars = arg.chars().peekable();
        while let Some(c) = chars.next() {
            let in_new_dir = new_dir.is_some();
            let dst = new_dir.as_mut().unwrap_or(&mut old_dir);
            if dst.len() >= MAXPGPATH {
                return Err(MappingError::TooLong);
            }

            match c {
                '\\' if chars.peek() == Some(&'=') => {
                    chars.next();
                    dst.push('=');
                }
                '=' if in_new_dir => return Err(MappingError::MultipleEquals),
                '=' => new_dir = Some(String::new()),
                c => dst.push(c),
            }
        }

        let new_dir = new_dir.unwrap_or_default();
        if old_dir.is_empty() || new_dir.is_empty() {
            return Err(MappingError::InvalidFormat(arg.to_string()));
        }
        if !old_dir.starts_with('/') {
            return Err(MappingError::OldNotAbsolute(old_dir));
        }
        if !new_dir.starts_with('/') {
            return Err(MappingError::NewNotAbsolute(new_dir));
        }

        Ok(Self {
            old_dir: canonicalize(&old_dir),
            new_dir: canonicalize(&new_dir),
        })
    }
}

/// Applies the first mapping whose old directory is `target`.
pub fn map_tablespace(mappings: &[TablespaceMapping], target: &str) -> String {
    let canonical = canonicalize(target);
    match mappings.iter().find(|m| m.old_dir == canonical) {
        Some(mapping) => mapping.new_dir.clone(),
        None => target.to_string(),
    }
}

/// Where and in what form the archive ends up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Extract into a directory.
    Plain {
        directory: PathBuf,
        tablespace_mapping: Vec<TablespaceMapping>,
    },
    /// Write a tar file, compressed on the way out if requested.
    Tar {
        path: PathBuf,
        compression: CompressionSpec,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineOptions {
    pub format: OutputFormat,
    /// How the incoming archive is compressed.
    pub input_compression: CompressionAlgorithm,
    pub recovery: Option<RecoveryOptions>,
    /// The source may leave out the end-of-archive blocks.
    pub expect_unterminated_tarfile: bool,
    /// Verify every typed edge with a [`ContractChecker`].
    pub check_contract: bool,
}

/// Builds the chain of streamers for `options` and returns its head.
///
/// The chain is assembled from the tail up: the extractor or file writer,
/// then whatever archive handling is needed, then decompression.
pub fn build_pipeline(options: PipelineOptions) -> Result<Box<dyn Streamer>> {
    let check = options.check_contract;
    let must_parse_archive =
        matches!(options.format, OutputFormat::Plain { .. }) || options.recovery.is_some();

    let mut streamer: Box<dyn Streamer> = match options.format {
        OutputFormat::Plain {
            directory,
            tablespace_mapping,
        } => {
            debug!("extracting into {}", directory.display());
            Box::new(
                Extractor::new(directory)
                    .with_link_map(move |target| map_tablespace(&tablespace_mapping, target))
                    .with_report_output_file(|path| trace!("writing {}", path.display())),
            )
        }
        OutputFormat::Tar { path, compression } => {
            debug!(
                "writing {} with {} compression",
                path.display(),
                compression.algorithm
            );
            let writer = compressed_file_writer(&path, None, &compression)?;
            if must_parse_archive {
                Box::new(TarArchiver::new(writer))
            } else {
                writer
            }
        }
    };

    if let Some(recovery) = options.recovery {
        if check {
            streamer = Box::new(ContractChecker::new(streamer));
        }
        streamer = Box::new(RecoveryInjector::new(streamer, recovery));
    }

    if must_parse_archive {
        if check {
            streamer = Box::new(ContractChecker::new(streamer));
        }
        streamer = Box::new(TarParser::new(streamer));
    } else if options.expect_unterminated_tarfile {
        streamer = Box::new(TarTerminator::new(streamer));
    }

    if options.input_compression != CompressionAlgorithm::None {
        streamer = Box::new(CodecStreamer::decompressor(
            streamer,
            options.input_compression,
        )?);
    }

    Ok(streamer)
}

/// Feeds everything `reader` produces into `head` and then finalizes it.
///
/// Returns the number of bytes read.
pub fn pump(reader: &mut impl Read, head: &mut impl Streamer, chunk_size: usize) -> Result<u64> {
    let mut buffer = vec![0; chunk_size.max(1)];
    let mut total = 0u64;

    loop {
        let n = read_fill(reader, &mut buffer)
            .map_err(|e| Error::io("read from", "input stream", e))?;
        if n == 0 {
            break;
        }
        head.content(Chunk::Unknown(&buffer[..n]))?;
        total += n as u64;
    }

    debug!("end of input after {total} bytes");
    head.finalize()?;
    Ok(total)
}
