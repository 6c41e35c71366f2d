//! Splits a raw tar byte stream into typed chunks.

use log::trace;

use super::{is_zero_block, UstarHeader, BLOCK_SIZE};
use crate::{
    error::{Error, Result},
    streamer::{pad, Chunk, ChunkContext, Member, Streamer},
};

/// What the parser expects the next bytes to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Header,
    Contents,
    Trailer,
    ArchiveTrailer,
}

/// Classifies an untyped byte stream carrying a tar archive.
///
/// Headers and padding are gathered in an internal buffer so they are
/// always forwarded whole, whatever the input chunking. Member contents are
/// forwarded as they arrive without being copied.
pub struct TarParser<S> {
    next: S,
    state: State,
    member: Member,
    buffer: Vec<u8>,
    bytes_sent: u64,
    pad_expected: usize,
}

impl<S: Streamer> TarParser<S> {
    pub fn new(next: S) -> Self {
        Self {
            next,
            state: State::Header,
            member: Member::default(),
            buffer: Vec::with_capacity(BLOCK_SIZE),
            bytes_sent: 0,
            pad_expected: 0,
        }
    }

    /// Moves bytes from `data` into the buffer until it holds `target` bytes.
    /// Returns true once the buffer is full.
    fn buffer_until(&mut self, data: &mut &[u8], target: usize) -> bool {
        let wanted = target.saturating_sub(self.buffer.len()).min(data.len());
        self.buffer.extend_from_slice(&data[..wanted]);
        *data = &data[wanted..];
        self.buffer.len() >= target
    }

    fn header_complete(&mut self) -> Result<()> {
        let block: &[u8; BLOCK_SIZE] = match self.buffer.as_slice().try_into() {
            Ok(block) => block,
            Err(_) => unreachable!("header buffer holds exactly one block"),
        };

        if is_zero_block(block) {
            // The zero block stays in the buffer: it is the start of the
            // archive trailer.
            self.state = State::ArchiveTrailer;
            return Ok(());
        }

        let member = UstarHeader::from_block(block).member()?;
        if member.pathname.is_empty() {
            return Err(Error::EmptyMemberName);
        }
        trace!("tar member {} ({} bytes)", member.pathname, member.size);

        self.member = member;
        self.bytes_sent = 0;
        self.pad_expected = pad(self.member.size);
        self.next
            .content(Chunk::MemberHeader(&self.member, &self.buffer))?;
        self.buffer.clear();

        if self.member.size == 0 {
            self.next.content(Chunk::MemberTrailer(&self.member, &[]))?;
            self.state = State::Header;
        } else {
            self.state = State::Contents;
        }
        Ok(())
    }
}

impl<S: Streamer> Streamer for TarParser<S> {
    fn content(&mut self, chunk: Chunk<'_>) -> Result<()> {
        let Chunk::Unknown(mut data) = chunk else {
            return Err(Error::UnexpectedChunk(chunk.context()));
        };

        while !data.is_empty() {
            match self.state {
                State::Header => {
                    if !self.buffer_until(&mut data, BLOCK_SIZE) {
                        return Ok(());
                    }
                    self.header_complete()?;
                }

                State::Contents => {
                    let remaining = self.member.size - self.bytes_sent;
                    let n = data.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    self.next
                        .content(Chunk::MemberContents(&self.member, &data[..n]))?;
                    self.bytes_sent += n as u64;
                    data = &data[n..];

                    if self.bytes_sent == self.member.size {
                        if self.pad_expected == 0 {
                            self.next.content(Chunk::MemberTrailer(&self.member, &[]))?;
                            self.state = State::Header;
                        } else {
                            self.state = State::Trailer;
                        }
                    }
                }

                State::Trailer => {
                    if !self.buffer_until(&mut data, self.pad_expected) {
                        return Ok(());
                    }
                    self.next
                        .content(Chunk::MemberTrailer(&self.member, &self.buffer))?;
                    self.buffer.clear();
                    self.state = State::Header;
                }

                State::ArchiveTrailer => {
                    if self.buffer.len() + data.len() > 2 * BLOCK_SIZE {
                        return Err(Error::TrailerTooLong);
                    }
                    self.buffer.extend_from_slice(data);
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let at_boundary = match self.state {
            State::ArchiveTrailer => true,
            State::Header => self.buffer.is_empty(),
            State::Contents | State::Trailer => false,
        };
        if !at_boundary {
            return Err(Error::UnfinishedMember);
        }

        // An archive without end-of-archive blocks still gets its (empty)
        // trailer event.
        self.next.content(Chunk::ArchiveTrailer(&self.buffer))?;
        self.buffer.clear();
        self.next.finalize()
    }
}

impl<S> TarParser<S> {
    /// The kind of chunk the parser will emit next.
    pub fn expecting(&self) -> ChunkContext {
        match self.state {
            State::Header => ChunkContext::MemberHeader,
            State::Contents => ChunkContext::MemberContents,
            State::Trailer => ChunkContext::MemberTrailer,
            State::ArchiveTrailer => ChunkContext::ArchiveTrailer,
        }
    }
}
