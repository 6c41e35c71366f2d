//! Turns typed chunks back into a valid tar byte stream.

use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use super::{create_header, BLOCK_SIZE};
use crate::{
    error::{Error, Result},
    streamer::{pad, Chunk, Streamer},
};

const ZERO_BLOCKS: [u8; 2 * BLOCK_SIZE] = [0; 2 * BLOCK_SIZE];

/// Re-archives a typed chunk stream.
///
/// Unmodified members pass through byte for byte. A member whose header
/// arrives empty (because an upstream stage changed it) gets a freshly built
/// header and freshly computed padding. The archive always ends with two zero
/// blocks.
pub struct TarArchiver<S> {
    next: S,
    rearchive_member: bool,
}

impl<S: Streamer> TarArchiver<S> {
    pub fn new(next: S) -> Self {
        Self {
            next,
            rearchive_member: false,
        }
    }
}

impl<S: Streamer> Streamer for TarArchiver<S> {
    fn content(&mut self, chunk: Chunk<'_>) -> Result<()> {
        match chunk {
            Chunk::Unknown(_) => Err(Error::UnexpectedChunk(chunk.context())),

            Chunk::MemberHeader(member, data) => match data.len() {
                BLOCK_SIZE => {
                    self.rearchive_member = false;
                    self.next.content(chunk)
                }
                0 => {
                    let mtime = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    let header = create_header(member, mtime)?;
                    debug!("regenerated tar header for {}", member.pathname);
                    self.rearchive_member = true;
                    self.next.content(Chunk::MemberHeader(member, &header))
                }
                len => Err(Error::UnexpectedHeaderLength(len)),
            },

            Chunk::MemberContents(..) => self.next.content(chunk),

            Chunk::MemberTrailer(member, _) if self.rearchive_member => {
                self.rearchive_member = false;
                let padding = &ZERO_BLOCKS[..pad(member.size)];
                self.next.content(Chunk::MemberTrailer(member, padding))
            }
            Chunk::MemberTrailer(..) => self.next.content(chunk),

            Chunk::ArchiveTrailer(_) => self.next.content(Chunk::ArchiveTrailer(&ZERO_BLOCKS)),
        }
    }

    fn finalize(&mut self) -> Result<()> {
        self.next.finalize()
    }
}
