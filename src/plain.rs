//! Writes untyped bytes to a single file.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    error::{Error, Result},
    streamer::{Chunk, Streamer},
    util::{close_buffered, normalize_write_error},
};

/// The plain file writer.
///
/// Chunk kinds and descriptors are ignored: every payload byte is written in
/// order. The file is closed by [`finalize`](Streamer::finalize).
#[derive(Debug)]
pub struct PlainWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
}

impl PlainWriter {
    /// Creates a writer for `path`.
    ///
    /// If `file` is given the writer works on a duplicate of it and leaves
    /// the caller's handle open; otherwise `path` is created (or truncated).
    /// `path` is used for error messages in either case.
    pub fn new(path: impl AsRef<Path>, file: Option<&File>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = match file {
            Some(file) => file.try_clone(),
            None => File::create(&path),
        }
        .map_err(|e| Error::io("create file", &path, e))?;

        Ok(Self {
            path,
            file: Some(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Streamer for PlainWriter {
    fn content(&mut self, chunk: Chunk<'_>) -> Result<()> {
        let data = chunk.data();
        if data.is_empty() {
            return Ok(());
        }

        let file = self.file.as_mut().ok_or_else(|| {
            Error::io(
                "write to file",
                &self.path,
                io::Error::other("file already closed"),
            )
        })?;
        file.write_all(data)
            .map_err(|e| Error::io("write to file", &self.path, normalize_write_error(e)))
    }

    fn finalize(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            close_buffered(file).map_err(|e| Error::io("close file", &self.path, e))?;
            debug!("closed {}", self.path.display());
        }
        Ok(())
    }
}
