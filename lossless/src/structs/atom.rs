//! MP4 atom (box) navigation.
//!
//! Atoms are `size(32) tag(32) payload`, with `size == 1` announcing a
//! 64-bit size after the tag and `size == 0` meaning the atom runs to the
//! end of its parent. Navigation only locates atoms; payload layouts are
//! parsed by the codec that owns them.

use std::io::{self, Read, Seek};

use anyhow::{Result, bail};
use bitstream_io::BigEndian;
use log::debug;

use crate::utils::bitstream_io::BitCursor;
use crate::utils::errors::AtomError;

/// Byte range searched for child atoms. `end == None` means "until EOF".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomSpan {
    pub start: u64,
    pub end: Option<u64>,
}

impl AtomSpan {
    pub const FILE: AtomSpan = AtomSpan {
        start: 0,
        end: None,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomHeader {
    pub tag: [u8; 4],
    /// Absolute offset of the size field.
    pub offset: u64,
    pub header_len: u64,
    /// Absolute end offset, `None` for a trailing size-0 atom at file level.
    pub end: Option<u64>,
}

impl AtomHeader {
    pub fn payload_start(&self) -> u64 {
        self.offset + self.header_len
    }

    pub fn payload_len(&self) -> Option<u64> {
        self.end.map(|end| end - self.payload_start())
    }

    pub fn payload_span(&self) -> AtomSpan {
        AtomSpan {
            start: self.payload_start(),
            end: self.end,
        }
    }

    /// Reads the header at the cursor. `None` if the source ends first.
    pub fn read<R: Read + Seek>(
        cursor: &mut BitCursor<R, BigEndian>,
        parent: AtomSpan,
    ) -> Result<Option<Self>> {
        let offset = cursor.byte_position()?;

        let raw = (|| -> io::Result<(u32, [u8; 4])> {
            let size = cursor.read_unsigned::<u32>(32)?;
            let tag = cursor.read_tag()?;
            Ok((size, tag))
        })();
        let (size, tag) = match raw {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && parent.end.is_none() => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let (header_len, size) = match size {
            0 => (8, None),
            1 => (16, Some(cursor.read_unsigned::<u64>(64)?)),
            _ => (8, Some(u64::from(size))),
        };
        let end = match size {
            None => parent.end,
            Some(size) => match offset.checked_add(size) {
                Some(end) if size >= header_len => Some(end),
                _ => bail!(AtomError::InvalidSize {
                    tag: tag_name(&tag),
                    size,
                    header: header_len,
                }),
            },
        };

        if let (Some(end), Some(limit)) = (end, parent.end) {
            if end > limit {
                bail!(AtomError::Overrun {
                    tag: tag_name(&tag),
                    end,
                    limit,
                });
            }
        }

        debug!(
            "Atom '{}' at {offset}, {} bytes",
            tag_name(&tag),
            end.map_or_else(|| "open-ended".to_string(), |end| (end - offset).to_string())
        );

        Ok(Some(Self {
            tag,
            offset,
            header_len,
            end,
        }))
    }
}

pub fn tag_name(tag: &[u8; 4]) -> String {
    String::from_utf8_lossy(tag).into_owned()
}

/// Finds the first direct child of `parent` tagged `tag`.
pub fn find_child<R: Read + Seek>(
    cursor: &mut BitCursor<R, BigEndian>,
    parent: AtomSpan,
    tag: &[u8; 4],
) -> Result<Option<AtomHeader>> {
    let mut position = parent.start;

    loop {
        if let Some(end) = parent.end {
            if position + 8 > end {
                return Ok(None);
            }
        }

        if let Err(e) = cursor.seek_to_byte(position) {
            if e.kind() == io::ErrorKind::UnexpectedEof && parent.end.is_none() {
                return Ok(None);
            }
            return Err(e.into());
        }

        let Some(header) = AtomHeader::read(cursor, parent)? else {
            return Ok(None);
        };

        if &header.tag == tag {
            return Ok(Some(header));
        }

        match header.end {
            Some(end) => position = end,
            None => return Ok(None),
        }
    }
}

/// Descends `path` from `parent`, returning the header of the last atom.
pub fn find_path<R: Read + Seek>(
    cursor: &mut BitCursor<R, BigEndian>,
    parent: AtomSpan,
    path: &[&[u8; 4]],
) -> Result<AtomHeader> {
    let mut span = parent;
    let mut found = None;

    for (depth, tag) in path.iter().enumerate() {
        match find_child(cursor, span, tag)? {
            Some(header) => {
                span = header.payload_span();
                found = Some(header);
            }
            None => {
                let walked: Vec<String> = path[..=depth].iter().map(|t| tag_name(t)).collect();
                bail!(AtomError::NotFound(walked.join("/")));
            }
        }
    }

    match found {
        Some(header) => Ok(header),
        None => bail!(AtomError::NotFound(String::new())),
    }
}

/// Reads a sized atom's payload into memory.
pub fn read_payload<R: Read + Seek>(
    cursor: &mut BitCursor<R, BigEndian>,
    header: &AtomHeader,
) -> Result<Vec<u8>> {
    cursor.seek_to_byte(header.payload_start())?;
    match header.payload_len() {
        Some(len) => {
            let len = usize::try_from(len).map_err(|_| AtomError::InvalidSize {
                tag: tag_name(&header.tag),
                size: len,
                header: header.header_len,
            })?;
            Ok(cursor.read_to_vec(len)?)
        }
        None => {
            let mut payload = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                match cursor.read_bytes(&mut byte) {
                    Ok(()) => payload.push(byte[0]),
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(payload)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    /// Serializes an atom with a 32-bit size.
    pub fn atom(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
        out.extend_from_slice(tag);
        out.extend_from_slice(payload);
        out
    }

    /// Serializes an atom whose children are already serialized.
    pub fn container(tag: &[u8; 4], children: &[Vec<u8>]) -> Vec<u8> {
        atom(tag, &children.concat())
    }
}
