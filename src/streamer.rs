//! The chunk model shared by every stage of the pipeline.

use std::fmt;

use crate::{tar::BLOCK_SIZE, Result};

/// Longest pathname or link target a [`Member`] may carry.
pub const MAXPGPATH: usize = 1024;

/// Describes one archive member: a regular file, a directory or a symlink.
///
/// A descriptor is fixed once the member's header has been seen. Stages that
/// change a member's size hand a new descriptor downstream instead of
/// mutating the old one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Member {
    pub pathname: String,
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub is_directory: bool,
    pub is_link: bool,
    pub linktarget: String,
}

impl Member {
    /// A regular file descriptor with the given name and size.
    pub fn file(pathname: impl Into<String>, size: u64, mode: u32) -> Self {
        Self {
            pathname: pathname.into(),
            size,
            mode,
            ..Default::default()
        }
    }

    pub fn is_regular(&self) -> bool {
        !self.is_directory && !self.is_link
    }
}

/// The kind of a [`Chunk`], without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChunkContext {
    Unknown,
    MemberHeader,
    MemberContents,
    MemberTrailer,
    ArchiveTrailer,
}

impl fmt::Display for ChunkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChunkContext::Unknown => "unknown",
            ChunkContext::MemberHeader => "member header",
            ChunkContext::MemberContents => "member contents",
            ChunkContext::MemberTrailer => "member trailer",
            ChunkContext::ArchiveTrailer => "archive trailer",
        })
    }
}

/// One event travelling down the pipeline.
///
/// The byte slice is borrowed from the emitter for the duration of a single
/// [`Streamer::content`] call. A stage that needs the bytes later must copy
/// them into a buffer of its own.
#[derive(Clone, Copy, Debug)]
pub enum Chunk<'a> {
    /// Bytes whose archive structure is not known (or not interesting).
    Unknown(&'a [u8]),
    /// The 512-byte header of a member, or an empty slice if downstream must
    /// regenerate it from the descriptor.
    MemberHeader(&'a Member, &'a [u8]),
    MemberContents(&'a Member, &'a [u8]),
    /// The zero padding after a member's contents.
    MemberTrailer(&'a Member, &'a [u8]),
    /// Whatever followed the last member: normally two zero blocks.
    ///
    /// It carries no [`Member`]: the end of the archive belongs to none of
    /// them, and [`Chunk::member`] returns `None` for it.
    ArchiveTrailer(&'a [u8]),
}

impl<'a> Chunk<'a> {
    pub fn context(&self) -> ChunkContext {
        match self {
            Chunk::Unknown(_) => ChunkContext::Unknown,
            Chunk::MemberHeader(..) => ChunkContext::MemberHeader,
            Chunk::MemberContents(..) => ChunkContext::MemberContents,
            Chunk::MemberTrailer(..) => ChunkContext::MemberTrailer,
            Chunk::ArchiveTrailer(_) => ChunkContext::ArchiveTrailer,
        }
    }

    pub fn data(&self) -> &'a [u8] {
        match *self {
            Chunk::Unknown(data)
            | Chunk::MemberHeader(_, data)
            | Chunk::MemberContents(_, data)
            | Chunk::MemberTrailer(_, data)
            | Chunk::ArchiveTrailer(data) => data,
        }
    }

    pub fn member(&self) -> Option<&'a Member> {
        match *self {
            Chunk::MemberHeader(member, _)
            | Chunk::MemberContents(member, _)
            | Chunk::MemberTrailer(member, _) => Some(member),
            Chunk::Unknown(_) | Chunk::ArchiveTrailer(_) => None,
        }
    }

    /// Rebuilds a chunk of the same kind around a different descriptor and payload.
    pub fn with(self, member: &'a Member, data: &'a [u8]) -> Chunk<'a> {
        match self {
            Chunk::Unknown(_) => Chunk::Unknown(data),
            Chunk::MemberHeader(..) => Chunk::MemberHeader(member, data),
            Chunk::MemberContents(..) => Chunk::MemberContents(member, data),
            Chunk::MemberTrailer(..) => Chunk::MemberTrailer(member, data),
            Chunk::ArchiveTrailer(_) => Chunk::ArchiveTrailer(data),
        }
    }
}

/// A stage of the pipeline.
///
/// Events are pushed in order with [`content`](Streamer::content); once the
/// source is exhausted [`finalize`](Streamer::finalize) flushes whatever the
/// stage still holds and then finalizes its successor. Dropping a streamer
/// releases it and everything downstream of it, whether or not it was
/// finalized.
pub trait Streamer {
    fn content(&mut self, chunk: Chunk<'_>) -> Result<()>;

    fn finalize(&mut self) -> Result<()>;
}

impl<S: Streamer + ?Sized> Streamer for Box<S> {
    fn content(&mut self, chunk: Chunk<'_>) -> Result<()> {
        (**self).content(chunk)
    }

    fn finalize(&mut self) -> Result<()> {
        (**self).finalize()
    }
}

/// Number of zero bytes needed to pad `size` bytes up to a whole tar block.
pub fn pad(size: u64) -> usize {
    let block = BLOCK_SIZE as u64;
    ((block - size % block) % block) as usize
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_pad() {
        assert_eq!(pad(0), 0);
        assert_eq!(pad(1), 511);
        assert_eq!(pad(5), 507);
        assert_eq!(pad(512), 0);
        assert_eq!(pad(513), 511);
        assert_eq!(pad(1 << 40), 0);
    }

    #[test]
    fn test_chunk_accessors() {
        let member = Member::file("hello", 5, 0o644);
        let chunk = Chunk::MemberContents(&member, b"hello");
        assert_eq!(chunk.context(), ChunkContext::MemberContents);
        assert_eq!(chunk.data(), b"hello");
        assert_eq!(chunk.member(), Some(&member));

        assert_eq!(Chunk::Unknown(b"x").member(), None);
        assert_eq!(Chunk::ArchiveTrailer(&[]).member(), None);
        assert_eq!(
            Chunk::ArchiveTrailer(&[]).context().to_string(),
            "archive trailer"
        );
    }

    #[test]
    fn test_chunk_with() {
        let old = Member::file("a", 1, 0o600);
        let new = Member::file("a", 2, 0o600);
        let chunk = Chunk::MemberTrailer(&old, &[0; 511]).with(&new, &[]);
        assert_eq!(chunk.context(), ChunkContext::MemberTrailer);
        assert_eq!(chunk.member(), Some(&new));
        assert!(chunk.data().is_empty());
    }

    #[test]
    fn test_member_kinds() {
        let mut member = Member::file("pg_wal", 0, 0o700);
        assert!(member.is_regular());
        member.is_directory = true;
        assert!(!member.is_regular());
    }
}
