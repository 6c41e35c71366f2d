//! Push-based pipeline for base backup tar streams.
//!
//! A pipeline is a chain of [`Streamer`]s. Raw bytes enter at the head as
//! [`Chunk::Unknown`] and are decompressed, split into typed tar members,
//! rewritten, re-archived and finally written to disk by the tail. Each
//! streamer owns its successor, and [`Streamer::finalize`] travels down the
//! chain once the source is exhausted.

pub mod check;
pub mod codec;
pub mod compression;
pub mod error;
pub mod extract;
pub mod inject;
pub mod pipeline;
pub mod plain;
pub mod sink;
pub mod streamer;
pub mod tar;
pub mod util;

pub use error::{Error, Result};
pub use streamer::{pad, Chunk, ChunkContext, Member, Streamer, MAXPGPATH};

/// Default file creation mode used for members we synthesize ourselves.
pub const PG_FILE_CREATE_MODE: u32 = 0o600;

/// Default directory creation mode, before the member's own mode is applied.
pub const PG_DIR_CREATE_MODE: u32 = 0o700;
