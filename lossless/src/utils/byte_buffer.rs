//! Growable FIFO byte buffer with an explicit read window.
//!
//! Unread bytes live in `data[window_start..window_end]`. A non-rewindable
//! buffer compacts the unread region to offset 0 before appending, so memory
//! stays proportional to what has not been consumed yet. A rewindable buffer
//! never discards consumed bytes, which lets a [`BitCursor`] seek back to a
//! mark anywhere in the retained region.
//!
//! [`BitCursor`]: crate::utils::bitstream_io::BitCursor

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::utils::errors::BitstreamError;

const MIN_CAPACITY: usize = 256;

#[derive(Debug, Default, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
    window_start: usize,
    window_end: usize,
    rewindable: bool,
    /// Absolute stream offset of `data[0]`.
    origin: u64,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rewindable() -> Self {
        Self {
            rewindable: true,
            ..Self::default()
        }
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.window_end - self.window_start
    }

    pub fn is_empty(&self) -> bool {
        self.window_start == self.window_end
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_rewindable(&self) -> bool {
        self.rewindable
    }

    pub fn set_rewindable(&mut self, rewindable: bool) {
        self.rewindable = rewindable;
    }

    /// Absolute offset of the next unread byte.
    pub fn position(&self) -> u64 {
        self.origin + self.window_start as u64
    }

    /// Absolute offset one past the last buffered byte.
    pub fn end_position(&self) -> u64 {
        self.origin + self.window_end as u64
    }

    pub fn unread(&self) -> &[u8] {
        &self.data[self.window_start..self.window_end]
    }

    /// Appends `bytes`, compacting first when consumed data may be dropped.
    pub fn push(&mut self, bytes: &[u8]) {
        if !self.rewindable && self.window_start > 0 {
            self.compact();
        }

        let needed = self.window_end + bytes.len();
        if needed > self.data.len() {
            let mut capacity = self.data.len().max(MIN_CAPACITY);
            while capacity < needed {
                capacity *= 2;
            }
            self.data.resize(capacity, 0);
        }

        self.data[self.window_end..needed].copy_from_slice(bytes);
        self.window_end = needed;
    }

    /// Copies up to `buf.len()` unread bytes and returns the count copied.
    pub fn pop(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.len());
        buf[..n].copy_from_slice(&self.data[self.window_start..self.window_start + n]);
        self.window_start += n;
        n
    }

    /// Advances past up to `n` unread bytes and returns the count skipped.
    pub fn skip(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.window_start += n;
        n
    }

    /// Empties the buffer and disables rewinding. Absolute positions keep
    /// counting from where the buffered data ended.
    pub fn reset(&mut self) {
        self.origin = self.end_position();
        self.window_start = 0;
        self.window_end = 0;
        self.rewindable = false;
    }

    fn compact(&mut self) {
        self.data.copy_within(self.window_start..self.window_end, 0);
        self.origin += self.window_start as u64;
        self.window_end -= self.window_start;
        self.window_start = 0;
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(data: Vec<u8>) -> Self {
        let window_end = data.len();
        Self {
            data,
            window_start: 0,
            window_end,
            rewindable: true,
            origin: 0,
        }
    }
}

impl Read for ByteBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.pop(buf))
    }
}

impl Write for ByteBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ByteBuffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.end_position().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position().checked_add_signed(delta),
        };

        match target {
            Some(target) if target >= self.origin && target <= self.end_position() => {
                self.window_start = (target - self.origin) as usize;
                Ok(target)
            }
            Some(target) if target < self.origin => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                BitstreamError::SeekBeforeRetained(target),
            )),
            Some(target) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek to {target} past end {}", self.end_position()),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}
