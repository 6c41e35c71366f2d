//! A terminal streamer that keeps everything it is given in memory.

use std::{cell::RefCell, rc::Rc};

use crate::{
    error::Result,
    streamer::{Chunk, ChunkContext, Member, Streamer},
};

/// An owned copy of one chunk event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedChunk {
    pub context: ChunkContext,
    pub member: Option<Member>,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Recording {
    chunks: Vec<RecordedChunk>,
    finalize_count: usize,
}

/// Records every chunk it receives.
///
/// The sink itself is moved into the pipeline; the recording stays reachable
/// through the [`SinkHandle`] returned alongside it.
#[derive(Debug)]
pub struct MemorySink {
    recording: Rc<RefCell<Recording>>,
}

/// Read access to what a [`MemorySink`] recorded.
#[derive(Clone, Debug)]
pub struct SinkHandle {
    recording: Rc<RefCell<Recording>>,
}

impl MemorySink {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MemorySink, SinkHandle) {
        let recording = Rc::new(RefCell::new(Recording::default()));
        (
            MemorySink {
                recording: Rc::clone(&recording),
            },
            SinkHandle { recording },
        )
    }
}

impl Streamer for MemorySink {
    fn content(&mut self, chunk: Chunk<'_>) -> Result<()> {
        self.recording.borrow_mut().chunks.push(RecordedChunk {
            context: chunk.context(),
            member: chunk.member().cloned(),
            data: chunk.data().to_vec(),
        });
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.recording.borrow_mut().finalize_count += 1;
        Ok(())
    }
}

impl SinkHandle {
    pub fn chunks(&self) -> Vec<RecordedChunk> {
        self.recording.borrow().chunks.clone()
    }

    pub fn finalize_count(&self) -> usize {
        self.recording.borrow().finalize_count
    }

    /// Every payload byte in arrival order, regardless of context.
    pub fn all_bytes(&self) -> Vec<u8> {
        self.recording
            .borrow()
            .chunks
            .iter()
            .flat_map(|c| c.data.iter().copied())
            .collect()
    }

    /// The descriptor of each member, taken from its header event.
    pub fn members(&self) -> Vec<Member> {
        self.recording
            .borrow()
            .chunks
            .iter()
            .filter(|c| c.context == ChunkContext::MemberHeader)
            .filter_map(|c| c.member.clone())
            .collect()
    }

    /// The concatenated contents of the last member called `pathname`.
    pub fn contents_of(&self, pathname: &str) -> Vec<u8> {
        let recording = self.recording.borrow();
        let start = recording
            .chunks
            .iter()
            .rposition(|c| {
                c.context == ChunkContext::MemberHeader
                    && c.member.as_ref().is_some_and(|m| m.pathname == pathname)
            })
            .map_or(recording.chunks.len(), |i| i + 1);

        recording.chunks[start..]
            .iter()
            .take_while(|c| c.context == ChunkContext::MemberContents)
            .flat_map(|c| c.data.iter().copied())
            .collect()
    }

    pub fn archive_trailer(&self) -> Option<Vec<u8>> {
        self.recording
            .borrow()
            .chunks
            .iter()
            .find(|c| c.context == ChunkContext::ArchiveTrailer)
            .map(|c| c.data.clone())
    }
}
