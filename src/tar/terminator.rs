use crate::{
    error::Result,
    streamer::{Chunk, Streamer},
};

use super::BLOCK_SIZE;

/// Appends the two end-of-archive zero blocks that some servers leave out.
///
/// Everything else passes through untouched.
pub struct TarTerminator<S> {
    next: S,
}

impl<S: Streamer> TarTerminator<S> {
    pub fn new(next: S) -> Self {
        Self { next }
    }
}

impl<S: Streamer> Streamer for TarTerminator<S> {
    fn content(&mut self, chunk: Chunk<'_>) -> Result<()> {
        self.next.content(chunk)
    }

    fn finalize(&mut self) -> Result<()> {
        self.next.content(Chunk::Unknown(&[0; 2 * BLOCK_SIZE]))?;
        self.next.finalize()
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::sink::MemorySink;

    #[test]
    fn test_terminates() {
        let (sink, handle) = MemorySink::new();
        let mut terminator = TarTerminator::new(sink);
        terminator.content(Chunk::Unknown(b"abc")).unwrap();
        terminator.finalize().unwrap();

        let mut expected = b"abc".to_vec();
        expected.extend_from_slice(&[0; 1024]);
        assert_eq!(handle.all_bytes(), expected);
        assert_eq!(handle.finalize_count(), 1);
    }
}
