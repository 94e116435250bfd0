use std::io::{self, BufWriter, Seek, SeekFrom, Write};

use lossless::process::{FrameList, StreamInfo};
use losslessd_macros::{ToBytes, riff_chunk};

pub const WAVE_FORMAT_PCM: u16 = 0x0001;
pub const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// KSDATAFORMAT_SUBTYPE_PCM
pub const SUBTYPE_PCM_GUID: [u8; 16] = [
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
];

pub trait RiffChunk {
    fn chunk_id(&self) -> &[u8; 4];
    fn chunk_data(&self) -> Vec<u8>;

    fn write_all<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let data = self.chunk_data();
        writer.write_all(self.chunk_id())?;
        writer.write_all(&(data.len() as u32).to_le_bytes())?;
        writer.write_all(&data)?;
        if data.len() % 2 == 1 {
            writer.write_all(&[0])?;
        }
        Ok(())
    }
}

#[derive(Debug, ToBytes)]
#[riff_chunk(b"fmt ")]
pub struct PcmFormatChunk {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

#[derive(Debug, ToBytes)]
#[riff_chunk(b"fmt ")]
pub struct ExtensibleFormatChunk {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub container_bits: u16,
    pub extension_size: u16,
    pub valid_bits: u16,
    pub channel_mask: u32,
    pub sub_format: [u8; 16],
}

/// Whether `info` needs WAVE_FORMAT_EXTENSIBLE.
pub fn needs_extensible(info: &StreamInfo) -> bool {
    info.channels > 2 || info.bits_per_sample > 16 || info.bits_per_sample % 8 != 0
}

/// RIFF WAVE writer for integer PCM. Chunk sizes are patched by
/// [`finish`](WAVWriter::finish).
pub struct WAVWriter<W: Write + Seek> {
    writer: BufWriter<W>,
    info: StreamInfo,
    data_written: u64,
    data_size_position: u64,
}

impl<W: Write + Seek> WAVWriter<W> {
    pub fn new(writer: W, info: StreamInfo) -> Self {
        Self {
            writer: BufWriter::new(writer),
            info,
            data_written: 0,
            data_size_position: 0,
        }
    }

    fn container_bytes(&self) -> u32 {
        self.info.bits_per_sample.div_ceil(8)
    }

    pub fn write_header(&mut self) -> io::Result<()> {
        if self.info.channels == 0 || self.info.channels > u16::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot write {} channels to WAVE", self.info.channels),
            ));
        }

        let channels = self.info.channels as u16;
        let bytes = self.container_bytes();
        let block_align = bytes * u32::from(channels);
        let byte_rate = self.info.sample_rate * block_align;

        self.writer.write_all(b"RIFF")?;
        // RIFF size (to be updated later)
        self.writer.write_all(&0u32.to_le_bytes())?;
        self.writer.write_all(b"WAVE")?;

        if needs_extensible(&self.info) {
            ExtensibleFormatChunk {
                format_tag: WAVE_FORMAT_EXTENSIBLE,
                channels,
                sample_rate: self.info.sample_rate,
                byte_rate,
                block_align: block_align as u16,
                container_bits: (bytes * 8) as u16,
                extension_size: 22,
                valid_bits: self.info.bits_per_sample as u16,
                channel_mask: self.info.channel_mask,
                sub_format: SUBTYPE_PCM_GUID,
            }
            .write_all(&mut self.writer)?;
        } else {
            PcmFormatChunk {
                format_tag: WAVE_FORMAT_PCM,
                channels,
                sample_rate: self.info.sample_rate,
                byte_rate,
                block_align: block_align as u16,
                bits_per_sample: self.info.bits_per_sample as u16,
            }
            .write_all(&mut self.writer)?;
        }

        self.writer.write_all(b"data")?;
        self.data_size_position = self.writer.stream_position()?;
        // data size (to be updated later)
        self.writer.write_all(&0u32.to_le_bytes())?;

        Ok(())
    }

    pub fn write_frames(&mut self, frames: &FrameList) -> io::Result<()> {
        let bytes = frames.to_le_bytes(self.info.bits_per_sample);
        self.writer.write_all(&bytes)?;
        self.data_written += bytes.len() as u64;
        Ok(())
    }

    /// Pads the data chunk and patches the RIFF and data sizes. Sizes beyond
    /// 4 GiB are clamped.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.data_written % 2 == 1 {
            self.writer.write_all(&[0])?;
        }
        self.writer.flush()?;

        let end = self.writer.stream_position()?;
        let data_size = u32::try_from(self.data_written).unwrap_or(u32::MAX);
        let riff_size = u32::try_from(end - 8).unwrap_or(u32::MAX);

        self.writer.seek(SeekFrom::Start(4))?;
        self.writer.write_all(&riff_size.to_le_bytes())?;
        self.writer.seek(SeekFrom::Start(self.data_size_position))?;
        self.writer.write_all(&data_size.to_le_bytes())?;

        self.writer.seek(SeekFrom::Start(end))?;
        self.writer.flush()?;

        Ok(())
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error())
    }

    pub fn data_written(&self) -> u64 {
        self.data_written
    }
}
