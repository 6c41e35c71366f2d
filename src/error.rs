//! Errors raised while streaming an archive.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{
    compression::{CompressionAlgorithm, ValidateError},
    streamer::ChunkContext,
    tar::HeaderError,
};

/// Everything that can stop a pipeline.
///
/// None of these are recoverable from inside the pipeline: once a stage
/// returns an error the embedder is expected to stop feeding it and drop the
/// chain.
#[derive(Debug, Error)]
pub enum Error {
    /// A system call on `path` failed.
    #[error("could not {action} \"{}\": {error}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        error: io::Error,
    },

    /// The compression library rejected its input or its parameters.
    #[error("{algorithm}: {message}")]
    Codec {
        algorithm: CompressionAlgorithm,
        message: String,
    },

    /// A compression specification failed validation when building a codec.
    #[error("invalid compression specification: {0}")]
    InvalidCompression(#[from] ValidateError),

    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error("tar member has empty name")]
    EmptyMemberName,

    #[error("stream ended before last file was finished")]
    UnfinishedMember,

    #[error("tar file trailer exceeds 2 blocks")]
    TrailerTooLong,

    /// A typed chunk reached a stage that only accepts raw bytes, or the
    /// other way around.
    #[error("unexpected {0} chunk")]
    UnexpectedChunk(ChunkContext),

    #[error("unexpected member header length {0}")]
    UnexpectedHeaderLength(usize),

    /// The stream of typed chunks broke the member/trailer ordering rules.
    #[error("archive stream contract violated: {0}")]
    ContractViolation(String),
}

impl Error {
    pub fn io(action: &'static str, path: impl Into<PathBuf>, error: io::Error) -> Self {
        Error::Io {
            action,
            path: path.into(),
            error,
        }
    }

    pub fn codec(algorithm: CompressionAlgorithm, message: impl ToString) -> Self {
        Error::Codec {
            algorithm,
            message: message.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
