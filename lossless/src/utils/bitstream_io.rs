//! Bit-level cursor over a seekable byte source.
//!
//! [`BitCursor`] wraps a `bitstream_io::BitReader` and adds the operations
//! the decoders share: unary and table-driven codes, byte alignment and a
//! stack of marks for speculative parsing. Marks store absolute bit
//! positions, so rewinding restores both the byte and the bit offset.

use std::io;
use std::io::SeekFrom;

use anyhow::Result;
use bitstream_io::{
    BigEndian, BitRead, BitReader, Endianness, LittleEndian, SignedInteger, UnsignedInteger,
    define_huffman_tree,
};

use crate::utils::errors::BitstreamError;

// ALAC residual prefix: up to eight ones then a zero, nine ones escape.
define_huffman_tree!(AlacPrefixTree : i32 = [
        0,
        [1, [2, [3, [4, [5, [6, [7, [8, (-1)]]]]]]]]
    ]
);

/// Variable-length code tables understood by [`BitCursor::read_huffman`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HuffmanTable {
    /// Count of leading ones, capped at 9.
    AlacPrefix,
}

#[derive(Debug)]
pub struct BitCursor<R: io::Read + io::Seek, E: Endianness> {
    bs: BitReader<R, E>,
    /// Total length in bits, when known.
    len: Option<u64>,
    marks: Vec<u64>,
}

pub type BeCursor<R> = BitCursor<R, BigEndian>;
pub type LeCursor<R> = BitCursor<R, LittleEndian>;
pub type BeSliceCursor<'a> = BitCursor<io::Cursor<&'a [u8]>, BigEndian>;
pub type LeSliceCursor<'a> = BitCursor<io::Cursor<&'a [u8]>, LittleEndian>;

impl<R, E> BitCursor<R, E>
where
    R: io::Read + io::Seek,
    E: Endianness,
{
    pub fn new(read: R) -> Self {
        Self {
            bs: BitReader::new(read),
            len: None,
            marks: Vec::new(),
        }
    }

    pub fn with_len(read: R, len_bytes: u64) -> Self {
        Self {
            bs: BitReader::new(read),
            len: Some(len_bytes << 3),
            marks: Vec::new(),
        }
    }

    pub fn into_inner(self) -> R {
        self.bs.into_reader()
    }

    fn out_of_bounds(&mut self, op: &str, n: u32) -> io::Error {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "{op}({n}): out of bounds bits at {}",
                self.bs.position_in_bits().unwrap_or(0)
            ),
        )
    }

    #[inline(always)]
    pub fn read_bit(&mut self) -> io::Result<bool> {
        match self.bs.read_bit() {
            Ok(bit) => Ok(bit),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(self.out_of_bounds("read_bit", 1))
            }
            Err(e) => Err(e),
        }
    }

    #[inline(always)]
    pub fn read_unsigned<U: UnsignedInteger>(&mut self, n: u32) -> io::Result<U> {
        match self.bs.read_unsigned_var(n) {
            Ok(val) => Ok(val),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(self.out_of_bounds("read_unsigned", n))
            }
            Err(e) => Err(e),
        }
    }

    #[inline(always)]
    pub fn read_signed<S: SignedInteger>(&mut self, n: u32) -> io::Result<S> {
        match self.bs.read_signed_var(n) {
            Ok(val) => Ok(val),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(self.out_of_bounds("read_signed", n))
            }
            Err(e) => Err(e),
        }
    }

    /// Unsigned read that accepts a zero width.
    #[inline(always)]
    pub fn read_u32(&mut self, n: u32) -> io::Result<u32> {
        if n == 0 {
            Ok(0)
        } else {
            self.read_unsigned::<u32>(n)
        }
    }

    /// Signed read that accepts a zero width.
    #[inline(always)]
    pub fn read_i32(&mut self, n: u32) -> io::Result<i32> {
        if n == 0 {
            Ok(0)
        } else {
            self.read_signed::<i32>(n)
        }
    }

    /// Counts bits differing from `stop_bit`, consuming the terminator.
    #[inline(always)]
    pub fn read_unary(&mut self, stop_bit: bool) -> io::Result<u32> {
        let mut count = 0;
        while self.read_bit()? != stop_bit {
            count += 1;
        }

        Ok(count)
    }

    /// Like [`read_unary`](Self::read_unary) but gives up after `limit`
    /// non-stop bits, returning `None` with those bits consumed.
    #[inline(always)]
    pub fn read_limited_unary(&mut self, stop_bit: bool, limit: u32) -> io::Result<Option<u32>> {
        for count in 0..limit {
            if self.read_bit()? == stop_bit {
                return Ok(Some(count));
            }
        }

        Ok(None)
    }

    /// Decodes one code from `table`. `None` is the escape sentinel.
    #[inline(always)]
    pub fn read_huffman(&mut self, table: HuffmanTable) -> io::Result<Option<u32>> {
        let value = match table {
            HuffmanTable::AlacPrefix => self.bs.read_huffman::<AlacPrefixTree>(),
        };

        match value {
            Ok(v) if v < 0 => Ok(None),
            Ok(v) => Ok(Some(v as u32)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(self.out_of_bounds("read_huffman", 0))
            }
            Err(e) => Err(e),
        }
    }

    #[inline(always)]
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match self.bs.read_bytes(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(self.out_of_bounds("read_bytes", (buf.len() as u32).saturating_mul(8)))
            }
            Err(e) => Err(e),
        }
    }

    /// Reads `len` bytes. The buffer grows as data arrives, so a length
    /// the source cannot supply fails with `UnexpectedEof` without first
    /// being allocated.
    pub fn read_to_vec(&mut self, len: usize) -> io::Result<Vec<u8>> {
        const CHUNK: usize = 1 << 16;

        if let Some(avail) = self.len_remaining()? {
            if (len as u64).saturating_mul(8) > avail {
                let bits = u32::try_from(len.saturating_mul(8)).unwrap_or(u32::MAX);
                return Err(self.out_of_bounds("read_to_vec", bits));
            }
        }

        let mut buf = Vec::with_capacity(len.min(CHUNK));
        while buf.len() < len {
            let start = buf.len();
            buf.resize(start + (len - start).min(CHUNK), 0);
            self.read_bytes(&mut buf[start..])?;
        }
        Ok(buf)
    }

    /// Reads a four-byte chunk or atom tag.
    #[inline(always)]
    pub fn read_tag(&mut self) -> io::Result<[u8; 4]> {
        let mut tag = [0u8; 4];
        self.read_bytes(&mut tag)?;
        Ok(tag)
    }

    #[inline(always)]
    pub fn skip_bits(&mut self, n: u32) -> io::Result<()> {
        match self.bs.skip(n) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(self.out_of_bounds("skip_bits", n))
            }
            Err(e) => Err(e),
        }
    }

    /// Skips whole bytes. Large skips seek instead of reading through.
    pub fn skip_bytes(&mut self, n: u64) -> io::Result<()> {
        if let Some(avail) = self.len_remaining()? {
            if n << 3 > avail {
                return Err(self.out_of_bounds("skip_bytes", u32::try_from(n).unwrap_or(u32::MAX)));
            }
        }

        if n <= 8 {
            self.skip_bits((n << 3) as u32)
        } else {
            self.bs.seek_bits(SeekFrom::Current((n << 3) as i64)).map(|_| ())
        }
    }

    #[inline(always)]
    pub fn byte_align(&mut self) {
        self.bs.byte_align();
    }

    #[inline(always)]
    pub fn byte_aligned(&self) -> bool {
        self.bs.byte_aligned()
    }

    #[inline(always)]
    pub fn position(&mut self) -> io::Result<u64> {
        self.bs.position_in_bits()
    }

    /// Current byte offset; any partially consumed byte counts as consumed.
    pub fn byte_position(&mut self) -> io::Result<u64> {
        self.position().map(|bits| bits.div_ceil(8))
    }

    fn len_remaining(&mut self) -> io::Result<Option<u64>> {
        match self.len {
            Some(len) => self.position().map(|pos| Some(len.saturating_sub(pos))),
            None => Ok(None),
        }
    }

    /// Bits left before the end of a cursor created with a known length.
    pub fn available(&mut self) -> io::Result<u64> {
        self.len_remaining()?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "available: length unknown")
        })
    }

    /// Moves to an absolute byte offset, discarding any partial byte.
    pub fn seek_to_byte(&mut self, offset: u64) -> io::Result<()> {
        self.bs.seek_bits(SeekFrom::Start(offset << 3)).map(|_| ())
    }

    pub fn mark(&mut self) -> io::Result<()> {
        let position = self.position()?;
        self.marks.push(position);
        Ok(())
    }

    /// Restores the most recent mark without removing it.
    pub fn rewind(&mut self) -> Result<()> {
        let Some(&position) = self.marks.last() else {
            anyhow::bail!(BitstreamError::NoMark);
        };
        self.bs.seek_bits(SeekFrom::Start(position))?;
        Ok(())
    }

    pub fn unmark(&mut self) -> Result<()> {
        if self.marks.pop().is_none() {
            anyhow::bail!(BitstreamError::NoMark);
        }
        Ok(())
    }

    pub fn mark_depth(&self) -> usize {
        self.marks.len()
    }

    /// Runs `f` inside a mark. On `Err` the cursor is rewound to where it
    /// was before `f` started; the mark is dropped either way.
    pub fn speculate<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.mark()?;
        let result = f(self);
        if result.is_err() {
            self.rewind()?;
        }
        self.unmark()?;
        result
    }

    /// Runs `f` and always restores the cursor afterwards.
    pub fn lookahead<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.mark()?;
        let result = f(self);
        self.rewind()?;
        self.unmark()?;
        result
    }
}

impl<'a, E: Endianness> BitCursor<io::Cursor<&'a [u8]>, E> {
    pub fn from_slice(buf: &'a [u8]) -> Self {
        let len = buf.len() as u64;
        Self::with_len(io::Cursor::new(buf), len)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Bit writers used by decoder tests to build synthetic streams.

    use std::io;

    use bitstream_io::{BitWrite, BitWriter, Endianness};

    pub struct BitSink<E: Endianness> {
        bw: BitWriter<Vec<u8>, E>,
    }

    impl<E: Endianness> BitSink<E> {
        pub fn new() -> Self {
            Self {
                bw: BitWriter::new(Vec::new()),
            }
        }

        pub fn bit(&mut self, bit: bool) -> io::Result<&mut Self> {
            self.bw.write_bit(bit)?;
            Ok(self)
        }

        pub fn u(&mut self, n: u32, value: u32) -> io::Result<&mut Self> {
            if n > 0 {
                self.bw.write_unsigned_var::<u32>(n, value)?;
            }
            Ok(self)
        }

        pub fn u64(&mut self, n: u32, value: u64) -> io::Result<&mut Self> {
            self.bw.write_unsigned_var::<u64>(n, value)?;
            Ok(self)
        }

        pub fn s(&mut self, n: u32, value: i32) -> io::Result<&mut Self> {
            self.bw.write_signed_var::<i32>(n, value)?;
            Ok(self)
        }

        /// `count` copies of `!stop_bit` followed by `stop_bit`.
        pub fn unary(&mut self, count: u32, stop_bit: bool) -> io::Result<&mut Self> {
            for _ in 0..count {
                self.bw.write_bit(!stop_bit)?;
            }
            self.bw.write_bit(stop_bit)?;
            Ok(self)
        }

        pub fn bytes(&mut self, bytes: &[u8]) -> io::Result<&mut Self> {
            self.bw.write_bytes(bytes)?;
            Ok(self)
        }

        pub fn align(&mut self) -> io::Result<&mut Self> {
            self.bw.byte_align()?;
            Ok(self)
        }

        /// Pads to a byte boundary with zero bits and returns the bytes.
        pub fn finish(mut self) -> io::Result<Vec<u8>> {
            self.bw.byte_align()?;
            Ok(self.bw.into_writer())
        }
    }
}
