//! Compression algorithms and compression specifications.
//!
//! A specification string is either a bare integer (the level) or a
//! comma-separated list of `keyword[=value]` items:
//!
//! ```text
//! level=5
//! level=19,workers=4,long
//! ```
//!
//! Parsing only checks the syntax; [`CompressionSpec::validate`] checks the
//! values against what the chosen algorithm supports.

use std::{fmt, ops::RangeInclusive, str::FromStr};

use thiserror::Error;

/// A compression algorithm, or none.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Gzip,
    Lz4,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }

    /// The usual file name suffix for data in this format.
    pub fn file_suffix(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "",
            CompressionAlgorithm::Gzip => ".gz",
            CompressionAlgorithm::Lz4 => ".lz4",
            CompressionAlgorithm::Zstd => ".zst",
        }
    }

    /// Guesses the format of a stream from its first bytes.
    ///
    /// Anything unrecognized is assumed to be uncompressed.
    pub fn from_magic(prefix: &[u8]) -> Self {
        if prefix.starts_with(&[0x1f, 0x8b]) {
            CompressionAlgorithm::Gzip
        } else if prefix.starts_with(&[0x04, 0x22, 0x4d, 0x18]) {
            CompressionAlgorithm::Lz4
        } else if prefix.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            CompressionAlgorithm::Zstd
        } else {
            CompressionAlgorithm::None
        }
    }

    /// The level used when none is given.
    pub fn default_level(self) -> i32 {
        match self {
            CompressionAlgorithm::None => 0,
            // the library default, which is 6
            CompressionAlgorithm::Gzip => -1,
            // fast mode
            CompressionAlgorithm::Lz4 => 0,
            CompressionAlgorithm::Zstd => zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }

    /// The levels accepted in addition to the default.
    pub fn level_range(self) -> RangeInclusive<i32> {
        match self {
            CompressionAlgorithm::None => 1..=1,
            CompressionAlgorithm::Gzip => 1..=9,
            CompressionAlgorithm::Lz4 => 1..=12,
            CompressionAlgorithm::Zstd => zstd::compression_level_range(),
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = ParseError;

    fn from_str(name: &str) -> Result<Self, ParseError> {
        match name {
            "none" => Ok(CompressionAlgorithm::None),
            "gzip" => Ok(CompressionAlgorithm::Gzip),
            "lz4" => Ok(CompressionAlgorithm::Lz4),
            "zstd" => Ok(CompressionAlgorithm::Zstd),
            other => Err(ParseError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// A syntax error in a compression specification.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unrecognized compression algorithm: \"{0}\"")]
    UnknownAlgorithm(String),

    #[error("found empty string where a compression option was expected")]
    EmptyOption,

    #[error("unrecognized compression option: \"{0}\"")]
    UnknownOption(String),

    #[error("compression option \"{0}\" requires a value")]
    MissingValue(String),

    #[error("value for compression option \"{0}\" must be an integer")]
    NotAnInteger(String),

    #[error("value for compression option \"{0}\" must be a Boolean value")]
    NotABoolean(String),
}

/// A specification the chosen algorithm cannot honor.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidateError {
    #[error("compression algorithm \"{0}\" does not accept a compression level")]
    LevelNotAccepted(CompressionAlgorithm),

    #[error(
        "compression algorithm \"{algorithm}\" expects a compression level between {} and {} (default at {default})",
        .range.start(), .range.end()
    )]
    LevelOutOfRange {
        algorithm: CompressionAlgorithm,
        range: RangeInclusive<i32>,
        default: i32,
    },

    #[error("compression algorithm \"{0}\" does not accept a worker count")]
    WorkersNotAccepted(CompressionAlgorithm),

    #[error("compression algorithm \"{0}\" does not support long-distance mode")]
    LongDistanceNotSupported(CompressionAlgorithm),
}

/// What to compress with and how.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressionSpec {
    pub algorithm: CompressionAlgorithm,
    pub level: i32,
    /// Worker threads; only zstd accepts this.
    pub workers: Option<i32>,
    /// Long-distance matching; only zstd accepts this.
    pub long_distance: Option<bool>,
}

impl CompressionSpec {
    /// The specification with every option at its default.
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        Self {
            algorithm,
            level: algorithm.default_level(),
            workers: None,
            long_distance: None,
        }
    }

    /// Parses `specification` as the options for `algorithm`.
    pub fn parse(algorithm: CompressionAlgorithm, specification: &str) -> Result<Self, ParseError> {
        let mut spec = Self::new(algorithm);

        if let Ok(level) = specification.parse::<i32>() {
            spec.level = level;
            return Ok(spec);
        }

        for item in specification.split(',') {
            let (keyword, value) = match item.split_once('=') {
                Some((keyword, value)) => (keyword, Some(value)),
                None => (item, None),
            };

            match keyword {
                "" => return Err(ParseError::EmptyOption),
                "level" => spec.level = expect_integer(keyword, value)?,
                "workers" => spec.workers = Some(expect_integer(keyword, value)?),
                "long" => spec.long_distance = Some(expect_boolean(keyword, value)?),
                other => return Err(ParseError::UnknownOption(other.to_string())),
            }
        }

        Ok(spec)
    }

    /// Checks the options against what the algorithm supports.
    pub fn validate(&self) -> Result<(), ValidateError> {
        let algorithm = self.algorithm;

        if algorithm == CompressionAlgorithm::None && self.level != 0 {
            return Err(ValidateError::LevelNotAccepted(algorithm));
        }

        let range = algorithm.level_range();
        let default = algorithm.default_level();
        if !range.contains(&self.level) && self.level != default {
            return Err(ValidateError::LevelOutOfRange {
                algorithm,
                range,
                default,
            });
        }

        if self.workers.is_some() && algorithm != CompressionAlgorithm::Zstd {
            return Err(ValidateError::WorkersNotAccepted(algorithm));
        }

        if self.long_distance.is_some() && algorithm != CompressionAlgorithm::Zstd {
            return Err(ValidateError::LongDistanceNotSupported(algorithm));
        }

        Ok(())
    }
}

fn expect_integer(keyword: &str, value: Option<&str>) -> Result<i32, ParseError> {
    let value = value.ok_or_else(|| ParseError::MissingValue(keyword.to_string()))?;
    value
        .parse()
        .map_err(|_| ParseError::NotAnInteger(keyword.to_string()))
}

fn expect_boolean(keyword: &str, value: Option<&str>) -> Result<bool, ParseError> {
    // a bare keyword turns the option on
    let Some(value) = value else {
        return Ok(true);
    };

    match value.to_ascii_lowercase().as_str() {
        "on" | "yes" | "true" | "1" => Ok(true),
        "off" | "no" | "false" | "0" => Ok(false),
        _ => Err(ParseError::NotABoolean(keyword.to_string())),
    }
}

/// Where the compression happens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompressionLocation {
    #[default]
    Unspecified,
    Client,
    Server,
}

/// A `--compress` argument split into its parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressionOption {
    pub location: CompressionLocation,
    pub algorithm: String,
    pub detail: Option<String>,
}

impl CompressionOption {
    /// Resolves the algorithm name and parses the detail string.
    pub fn spec(&self) -> Result<CompressionSpec, ParseError> {
        let algorithm: CompressionAlgorithm = self.algorithm.parse()?;
        match &self.detail {
            Some(detail) => CompressionSpec::parse(algorithm, detail),
            None => Ok(CompressionSpec::new(algorithm)),
        }
    }
}

/// Splits a `[client-|server-]ALGORITHM[:DETAIL]` option.
///
/// A bare integer is accepted for compatibility: zero means no compression
/// and anything else is a gzip level.
pub fn parse_compress_options(option: &str) -> CompressionOption {
    let (location, option) = if let Some(rest) = option.strip_prefix("server-") {
        (CompressionLocation::Server, rest)
    } else if let Some(rest) = option.strip_prefix("client-") {
        (CompressionLocation::Client, rest)
    } else {
        (CompressionLocation::Unspecified, option)
    };

    if option.is_empty() || option.parse::<i64>().is_ok() {
        let (algorithm, detail) = match option.parse::<i64>() {
            Ok(level) if level != 0 => ("gzip", Some(option.to_string())),
            _ => ("none", None),
        };
        return CompressionOption {
            location,
            algorithm: algorithm.to_string(),
            detail,
        };
    }

    let (algorithm, detail) = match option.split_once(':') {
        Some((algorithm, detail)) => (algorithm, Some(detail.to_string())),
        None => (option, None),
    };
    CompressionOption {
        location,
        algorithm: algorithm.to_string(),
        detail,
    }
}
