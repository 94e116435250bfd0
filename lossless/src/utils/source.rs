//! Byte sources the decoders read from.
//!
//! Decoders accept any `Read + Seek`. [`ExternalSource`] adapts caller
//! supplied callbacks to that shape, and [`StreamSource`] makes a purely
//! sequential reader (a pipe, a socket) seekable within the data it has
//! already pulled by retaining it in a rewindable [`ByteBuffer`].

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

use crate::utils::byte_buffer::ByteBuffer;
use crate::utils::errors::StreamError;

pub type ReadFn = Box<dyn FnMut(&mut [u8]) -> io::Result<usize> + Send>;
pub type SeekFn = Box<dyn FnMut(SeekFrom) -> io::Result<u64> + Send>;
pub type CloseFn = Box<dyn FnOnce() -> io::Result<()> + Send>;

/// A byte source backed by caller-supplied read, seek and close callbacks.
pub struct ExternalSource {
    read: ReadFn,
    seek: Option<SeekFn>,
    close: Option<CloseFn>,
    closed: bool,
}

impl ExternalSource {
    pub fn new<F>(read: F) -> Self
    where
        F: FnMut(&mut [u8]) -> io::Result<usize> + Send + 'static,
    {
        Self {
            read: Box::new(read),
            seek: None,
            close: None,
            closed: false,
        }
    }

    pub fn with_seek<F>(mut self, seek: F) -> Self
    where
        F: FnMut(SeekFrom) -> io::Result<u64> + Send + 'static,
    {
        self.seek = Some(Box::new(seek));
        self
    }

    pub fn with_close<F>(mut self, close: F) -> Self
    where
        F: FnOnce() -> io::Result<()> + Send + 'static,
    {
        self.close = Some(Box::new(close));
        self
    }

    pub fn is_seekable(&self) -> bool {
        self.seek.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Runs the close callback once. Later reads fail.
    pub fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        match self.close.take() {
            Some(close) => close(),
            None => Ok(()),
        }
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "source is closed")
    }
}

impl fmt::Debug for ExternalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalSource")
            .field("seekable", &self.seek.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Read for ExternalSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(Self::closed_error());
        }
        (self.read)(buf)
    }
}

impl Seek for ExternalSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if self.closed {
            return Err(Self::closed_error());
        }
        match self.seek.as_mut() {
            Some(seek) => seek(pos),
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                StreamError::NotSeekable,
            )),
        }
    }
}

impl Drop for ExternalSource {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Error closing external source: {e}");
        }
    }
}

const PULL_SIZE: usize = 16 * 1024;

/// Sequential reader made seekable over everything read so far.
///
/// Seeking forward pulls data from the inner reader until the target is
/// buffered; seeking relative to the end is not supported.
#[derive(Debug)]
pub struct StreamSource<R: Read> {
    inner: R,
    buffer: ByteBuffer,
    eof: bool,
}

impl<R: Read> StreamSource<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: ByteBuffer::rewindable(),
            eof: false,
        }
    }

    fn pull(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }

        let mut chunk = [0u8; PULL_SIZE];
        let n = loop {
            match self.inner.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if n == 0 {
            self.eof = true;
        }
        self.buffer.push(&chunk[..n]);
        Ok(n)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for StreamSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffer.is_empty() && self.pull()? == 0 {
            return Ok(0);
        }
        Ok(self.buffer.pop(buf))
    }
}

impl<R: Read> Seek for StreamSource<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => {
                self.buffer.position().checked_add_signed(delta).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "seek before start")
                })?
            }
            SeekFrom::End(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "cannot seek from the end of a sequential stream",
                ));
            }
        };

        while target > self.buffer.end_position() {
            if self.pull()? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("seek to {target} past end of stream"),
                ));
            }
        }

        self.buffer.seek(SeekFrom::Start(target))
    }
}
