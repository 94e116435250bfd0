//! WAVE and AIFF headers embedded in Shorten verbatim sections.
//!
//! Shorten keeps the source file header as opaque bytes; the only fields
//! recovered from it are the sample rate and the channel layout.

use std::io::{Read, Seek};

use anyhow::{Result, bail};
use bitstream_io::{BigEndian, LittleEndian};
use log::debug;

use crate::structs::channel::default_mask;
use crate::utils::bitstream_io::{BeSliceCursor, BitCursor, LeSliceCursor};
use crate::utils::errors::ShortenError;

const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// Format fields recovered from an embedded header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub channel_mask: u32,
}

impl EmbeddedFormat {
    /// Parses a `RIFF`/`WAVE` or `FORM`/`AIFF` header prefix.
    pub fn parse(header: &[u8]) -> Result<Self> {
        let format = match header.get(..4) {
            Some(b"RIFF") => Self::read_wave(&mut LeSliceCursor::from_slice(header))?,
            Some(b"FORM") => Self::read_aiff(&mut BeSliceCursor::from_slice(header))?,
            _ => bail!(ShortenError::InvalidEmbeddedHeader("neither RIFF nor FORM")),
        };
        if format.sample_rate == 0 || format.channels == 0 {
            bail!(ShortenError::InvalidEmbeddedHeader("zero rate or channels"));
        }

        debug!("Embedded header: {format:?}");
        Ok(format)
    }

    fn read_wave<R: Read + Seek>(reader: &mut BitCursor<R, LittleEndian>) -> Result<Self> {
        reader.skip_bytes(8)?;
        if reader.read_tag()? != *b"WAVE" {
            bail!(ShortenError::InvalidEmbeddedHeader("RIFF form is not WAVE"));
        }

        loop {
            let tag = reader.read_tag()?;
            let size = reader.read_unsigned::<u32>(32)?;
            match &tag {
                b"fmt " => return Self::read_fmt(reader, size),
                b"data" => bail!(ShortenError::InvalidEmbeddedHeader("data before fmt chunk")),
                _ => reader.skip_bytes(u64::from(size) + u64::from(size & 1))?,
            }
        }
    }

    fn read_fmt<R: Read + Seek>(reader: &mut BitCursor<R, LittleEndian>, size: u32) -> Result<Self> {
        if size < 16 {
            bail!(ShortenError::InvalidEmbeddedHeader("short fmt chunk"));
        }

        let format_tag = reader.read_unsigned::<u16>(16)?;
        let channels = reader.read_unsigned::<u16>(16)?;
        let sample_rate = reader.read_unsigned::<u32>(32)?;
        reader.skip_bytes(6)?; // byte rate, block align
        let bits_per_sample = reader.read_unsigned::<u16>(16)?;

        let channel_mask = match format_tag {
            WAVE_FORMAT_PCM => default_mask(channels as usize),
            WAVE_FORMAT_EXTENSIBLE if size >= 40 => {
                reader.skip_bytes(4)?; // cbSize, valid bits
                reader.read_unsigned::<u32>(32)?
            }
            _ => bail!(ShortenError::InvalidEmbeddedHeader("fmt chunk is not integer PCM")),
        };

        Ok(Self {
            sample_rate,
            channels,
            bits_per_sample,
            channel_mask,
        })
    }

    fn read_aiff<R: Read + Seek>(reader: &mut BitCursor<R, BigEndian>) -> Result<Self> {
        reader.skip_bytes(8)?;
        if !matches!(&reader.read_tag()?, b"AIFF" | b"AIFC") {
            bail!(ShortenError::InvalidEmbeddedHeader("FORM type is not AIFF"));
        }

        loop {
            let tag = reader.read_tag()?;
            let size = reader.read_unsigned::<u32>(32)?;
            if &tag != b"COMM" {
                reader.skip_bytes(u64::from(size) + u64::from(size & 1))?;
                continue;
            }
            if size < 18 {
                bail!(ShortenError::InvalidEmbeddedHeader("short COMM chunk"));
            }

            let channels = reader.read_unsigned::<u16>(16)?;
            reader.skip_bytes(4)?; // sample frames
            let bits_per_sample = reader.read_unsigned::<u16>(16)?;
            let exponent = reader.read_unsigned::<u16>(16)?;
            let mantissa = reader.read_unsigned::<u64>(64)?;

            return Ok(Self {
                sample_rate: extended_to_rate(exponent, mantissa)?,
                channels,
                bits_per_sample,
                channel_mask: default_mask(channels as usize),
            });
        }
    }
}

/// Converts an 80-bit IEEE extended sample rate to an integer rate.
fn extended_to_rate(exponent: u16, mantissa: u64) -> Result<u32> {
    // 16383 bias, 63 fraction bits
    const ONE: u16 = 0x3FFF + 63;
    if exponent & 0x8000 != 0 || exponent < 0x3FFF || exponent > ONE {
        bail!(ShortenError::InvalidEmbeddedHeader("sample rate out of range"));
    }

    let rate = mantissa >> (ONE - exponent);
    u32::try_from(rate)
        .map_err(|_| ShortenError::InvalidEmbeddedHeader("sample rate out of range").into())
}


#[cfg(test)]
mod tests {
    use super::testing::wave_header;
    use super::*;

    #[test]
    fn wave_headers() -> Result<()> {
        let plain = EmbeddedFormat::parse(&wave_header(2, 44100, 16, None))?;
        assert_eq!(
            plain,
            EmbeddedFormat {
                sample_rate: 44100,
                channels: 2,
                bits_per_sample: 16,
                channel_mask: 0x3,
            }
        );

        let extensible = EmbeddedFormat::parse(&wave_header(6, 48000, 16, Some(0x3F)))?;
        assert_eq!(extensible.channel_mask, 0x3F);
        assert_eq!(extensible.sample_rate, 48000);
        Ok(())
    }

    #[test]
    fn aiff_header() -> Result<()> {
        let mut header = Vec::new();
        header.extend_from_slice(b"FORM");
        header.extend_from_slice(&0u32.to_be_bytes());
        header.extend_from_slice(b"AIFF");
        header.extend_from_slice(b"COMM");
        header.extend_from_slice(&18u32.to_be_bytes());
        header.extend_from_slice(&1u16.to_be_bytes());
        header.extend_from_slice(&1000u32.to_be_bytes());
        header.extend_from_slice(&8u16.to_be_bytes());
        // 44100 as an 80-bit extended float
        header.extend_from_slice(&[0x40, 0x0E, 0xAC, 0x44, 0, 0, 0, 0, 0, 0]);

        let format = EmbeddedFormat::parse(&header)?;
        assert_eq!(format.sample_rate, 44100);
        assert_eq!(format.channels, 1);
        assert_eq!(format.bits_per_sample, 8);
        assert_eq!(format.channel_mask, 0x4);
        Ok(())
    }

    #[test]
    fn rejects_other_headers() {
        for header in [&b"OggS\0\0\0\0"[..], b"RIFF\0\0\0\0AVI ", b"RIFF\0\0\0\0WAVEdata"] {
            assert!(EmbeddedFormat::parse(header).is_err());
        }
    }
}
