use std::{
    fs::File,
    io::{BufWriter, Error, ErrorKind, Read, Result},
};

/// This function reads from `reader` until the buffer is full or the reader reports EOF, possibly
/// performing multiple reads to do so (and also retrying if required to deal with EINTR).
///
/// Unlike the standard Read::read_exact() method, hitting EOF part-way through is not an error:
/// the byte source feeding a pipeline ends wherever it ends and the streamers decide whether that
/// was a legitimate place to stop.
///
/// # Return value
///
/// Returns the number of bytes placed at the start of `buf`.  This is less than `buf.len()` only
/// if EOF was reached, and zero only if EOF was reached immediately.  Errors from the underlying
/// Read implementation (other than Interrupted) are returned directly.
pub fn read_fill(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

/// Turns the "wrote zero bytes" error that write_all() reports for a short write into the
/// out-of-space error that a short write almost always means.
pub(crate) fn normalize_write_error(err: Error) -> Error {
    if err.kind() != ErrorKind::WriteZero {
        return err;
    }

    #[cfg(unix)]
    {
        Error::from(rustix::io::Errno::NOSPC)
    }
    #[cfg(not(unix))]
    {
        Error::new(ErrorKind::Other, "no space left on device")
    }
}

/// Flushes `writer` and closes its file.
///
/// Dropping a `File` ignores the result of close(2), which is where some
/// filesystems report that the data never made it out.
pub(crate) fn close_buffered(writer: BufWriter<File>) -> Result<()> {
    let file = writer
        .into_inner()
        .map_err(|e| normalize_write_error(e.into_error()))?;

    #[cfg(unix)]
    {
        use std::os::fd::IntoRawFd;

        // into_raw_fd() gives up ownership, so this is the only close
        unsafe { rustix::io::try_close(file.into_raw_fd()) }.map_err(Error::from)
    }
    #[cfg(not(unix))]
    {
        drop(file);
        Ok(())
    }
}
