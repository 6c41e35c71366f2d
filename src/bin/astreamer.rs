use std::{
    fs::File,
    io::{Cursor, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use astreamer::{
    codec::CodecStreamer,
    compression::{
        parse_compress_options, CompressionAlgorithm, CompressionLocation, CompressionSpec,
    },
    inject::RecoveryOptions,
    pipeline::{
        build_pipeline, pump, OutputFormat, PipelineOptions, TablespaceMapping, DEFAULT_CHUNK_SIZE,
    },
    tar::TarParser,
    util::read_fill,
    Chunk, Streamer,
};

/// astreamer
#[derive(Debug, Parser)]
#[clap(name = "astreamer", version)]
pub struct App {
    /// Size of the reads from the input
    #[clap(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Args)]
struct RecoveryArgs {
    /// Install the settings in FILE so the result starts as a standby
    #[clap(long, value_name = "FILE")]
    recovery_conf: Option<PathBuf>,
    /// Write recovery.conf, for servers before version 12
    #[clap(long, requires = "recovery_conf")]
    legacy_recovery: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Unpacks an archive into a directory
    Extract {
        /// the archive, or '-' for stdin
        input: String,
        #[clap(short = 'D', long)]
        directory: PathBuf,
        /// Relocate symlinks pointing at OLDDIR to NEWDIR
        #[clap(short = 'T', long = "tablespace-mapping", value_name = "OLDDIR=NEWDIR")]
        tablespace_mapping: Vec<TablespaceMapping>,
        #[clap(flatten)]
        recovery: RecoveryArgs,
        /// The input may end without the end-of-archive blocks
        #[clap(long)]
        unterminated: bool,
        /// Verify the chunk stream between stages
        #[clap(long)]
        check: bool,
    },
    /// Rewrites an archive into a tar file
    Archive {
        /// the archive, or '-' for stdin
        input: String,
        #[clap(short, long)]
        output: PathBuf,
        /// [client-]ALGORITHM[:DETAIL], or a gzip level
        #[clap(long, value_name = "OPTION")]
        compress: Option<String>,
        #[clap(flatten)]
        recovery: RecoveryArgs,
        #[clap(long)]
        unterminated: bool,
        #[clap(long)]
        check: bool,
    },
    /// Prints the members of an archive
    List {
        /// the archive, or '-' for stdin
        input: String,
    },
}

/// Opens the input and sniffs its compression from the first bytes.
///
/// The sniffed bytes are put back in front of the returned reader.
fn open_input(input: &str) -> Result<(CompressionAlgorithm, Box<dyn Read>)> {
    let mut reader: Box<dyn Read> = if input == "-" {
        Box::new(std::io::stdin().lock())
    } else {
        Box::new(File::open(input).with_context(|| format!("Opening {input}"))?)
    };

    let mut magic = [0u8; 4];
    let n = read_fill(&mut reader, &mut magic).with_context(|| format!("Reading {input}"))?;
    let algorithm = CompressionAlgorithm::from_magic(&magic[..n]);
    log::debug!("{input}: detected {algorithm} compression");

    Ok((algorithm, Box::new(Cursor::new(magic[..n].to_vec()).chain(reader))))
}

fn recovery_options(args: &RecoveryArgs) -> Result<Option<RecoveryOptions>> {
    let Some(path) = &args.recovery_conf else {
        return Ok(None);
    };
    let content =
        std::fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
    Ok(Some(RecoveryOptions {
        content,
        modern: !args.legacy_recovery,
    }))
}

fn output_compression(option: Option<&str>) -> Result<CompressionSpec> {
    let Some(option) = option else {
        return Ok(CompressionSpec::new(CompressionAlgorithm::None));
    };
    let option = parse_compress_options(option);
    if option.location == CompressionLocation::Server {
        bail!("server-side compression is not possible when reading an archive");
    }
    let spec = option.spec().context("Invalid compression specification")?;
    spec.validate().context("Invalid compression specification")?;
    Ok(spec)
}

/// Appends the compression suffix unless the name already ends with it.
fn output_path(output: &Path, algorithm: CompressionAlgorithm) -> PathBuf {
    let suffix = algorithm.file_suffix();
    let name = output.as_os_str().to_string_lossy();
    if name.ends_with(suffix) {
        output.to_path_buf()
    } else {
        PathBuf::from(format!("{name}{suffix}"))
    }
}

fn run(input: &str, chunk_size: usize, mut options: PipelineOptions) -> Result<()> {
    let (algorithm, mut reader) = open_input(input)?;
    options.input_compression = algorithm;

    let mut head = build_pipeline(options)?;
    let total = pump(&mut reader, &mut head, chunk_size)?;
    log::info!("processed {total} bytes from {input}");
    Ok(())
}

/// Prints one line per member as the headers go past.
struct Lister<W: Write> {
    out: W,
}

impl<W: Write> Streamer for Lister<W> {
    fn content(&mut self, chunk: Chunk<'_>) -> astreamer::Result<()> {
        let Chunk::MemberHeader(member, _) = chunk else {
            return Ok(());
        };
        let kind = match (member.is_directory, member.is_link) {
            (true, _) => 'd',
            (_, true) => 'l',
            _ => '-',
        };
        let written = if member.is_link {
            writeln!(
                self.out,
                "{kind} {:04o} {}/{} {:>12} {} -> {}",
                member.mode, member.uid, member.gid, member.size, member.pathname, member.linktarget
            )
        } else {
            writeln!(
                self.out,
                "{kind} {:04o} {}/{} {:>12} {}",
                member.mode, member.uid, member.gid, member.size, member.pathname
            )
        };
        written.map_err(|e| astreamer::Error::io("write to", "standard output", e))
    }

    fn finalize(&mut self) -> astreamer::Result<()> {
        self.out
            .flush()
            .map_err(|e| astreamer::Error::io("write to", "standard output", e))
    }
}

fn list(input: &str, chunk_size: usize) -> Result<()> {
    let (algorithm, mut reader) = open_input(input)?;
    let lister = TarParser::new(Lister {
        out: std::io::stdout().lock(),
    });

    let mut head: Box<dyn Streamer> = match algorithm {
        CompressionAlgorithm::None => Box::new(lister),
        algorithm => Box::new(CodecStreamer::decompressor(lister, algorithm)?),
    };
    pump(&mut reader, &mut head, chunk_size)?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    match args.cmd {
        Command::Extract {
            ref input,
            directory,
            tablespace_mapping,
            ref recovery,
            unterminated,
            check,
        } => {
            let options = PipelineOptions {
                format: OutputFormat::Plain {
                    directory,
                    tablespace_mapping,
                },
                input_compression: CompressionAlgorithm::None,
                recovery: recovery_options(recovery)?,
                expect_unterminated_tarfile: unterminated,
                check_contract: check,
            };
            run(input, args.chunk_size, options)?;
        }
        Command::Archive {
            ref input,
            ref output,
            ref compress,
            ref recovery,
            unterminated,
            check,
        } => {
            let compression = output_compression(compress.as_deref())?;
            let options = PipelineOptions {
                format: OutputFormat::Tar {
                    path: output_path(output, compression.algorithm),
                    compression,
                },
                input_compression: CompressionAlgorithm::None,
                recovery: recovery_options(recovery)?,
                expect_unterminated_tarfile: unterminated,
                check_contract: check,
            };
            run(input, args.chunk_size, options)?;
        }
        Command::List { ref input } => {
            list(input, args.chunk_size)?;
        }
    }
    Ok(())
}
