//! TTA header, seek table and frame decoding.
//!
//! A frame holds `frame_length` samples per channel, interleaved. Each sample
//! goes through three stages: an adaptive two-level Rice code, an eight-tap
//! sign-sign LMS filter and a fixed first-order predictor. Multi-channel
//! frames are finally decorrelated across channels.

use std::io::{Read, Seek};

use anyhow::{Result, bail};
use bitstream_io::LittleEndian;
use log::trace;

use crate::utils::bitstream_io::{BitCursor, LeSliceCursor};
use crate::utils::crc::CRC32;
use crate::utils::errors::TtaError;

pub const MAGIC: [u8; 4] = *b"TTA1";
pub const FORMAT_PCM: u16 = 1;
/// Header bytes including the trailing CRC.
pub const HEADER_SIZE: u64 = 22;

const MAX_RICE_PARAMETER: u32 = 24;

fn check_crc(section: &str, data: &[u8], read: u32) -> Result<()> {
    let calculated = CRC32.checksum(data);
    if calculated != read {
        bail!(TtaError::CrcMismatch {
            section: section.to_string(),
            calculated,
            read,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtaHeader {
    pub format: u16,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub sample_rate: u32,
    /// PCM frames in the stream.
    pub total_samples: u32,
}

impl TtaHeader {
    pub fn read<R: Read + Seek>(reader: &mut BitCursor<R, LittleEndian>) -> Result<Self> {
        let bytes = reader.read_to_vec(HEADER_SIZE as usize - 4)?;
        let crc = reader.read_unsigned::<u32>(32)?;

        let mut fields = LeSliceCursor::from_slice(&bytes);
        let magic = fields.read_tag()?;
        if magic != MAGIC {
            bail!(TtaError::InvalidMagic(magic));
        }
        check_crc("header", &bytes, crc)?;

        let header = Self {
            format: fields.read_unsigned::<u16>(16)?,
            channels: fields.read_unsigned::<u16>(16)?,
            bits_per_sample: fields.read_unsigned::<u16>(16)?,
            sample_rate: fields.read_unsigned::<u32>(32)?,
            total_samples: fields.read_unsigned::<u32>(32)?,
        };

        if header.format != FORMAT_PCM {
            bail!(TtaError::UnsupportedFormat(header.format));
        }
        if header.channels == 0 {
            bail!(TtaError::InvalidChannelCount(header.channels));
        }
        if !matches!(header.bits_per_sample, 8 | 16 | 24) {
            bail!(TtaError::UnsupportedBitsPerSample(header.bits_per_sample));
        }
        if header.sample_rate == 0 || header.frame_length() == 0 {
            bail!(TtaError::InvalidSampleRate(header.sample_rate));
        }

        Ok(header)
    }

    /// Samples per channel in every frame but the last.
    pub fn frame_length(&self) -> u32 {
        (u64::from(self.sample_rate) * 256 / 245) as u32
    }

    pub fn frame_count(&self) -> usize {
        self.total_samples.div_ceil(self.frame_length()) as usize
    }

    /// Samples per channel in frame `index`.
    pub fn frame_samples(&self, index: usize) -> u32 {
        let length = self.frame_length();
        if index + 1 < self.frame_count() {
            return length;
        }
        match self.total_samples % length {
            0 => length,
            rest => rest,
        }
    }
}

/// Byte sizes of every frame, and their offsets from the first frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekTable {
    pub frame_sizes: Vec<u32>,
    pub frame_offsets: Vec<u64>,
}

impl SeekTable {
    pub fn read<R: Read + Seek>(
        reader: &mut BitCursor<R, LittleEndian>,
        header: &TtaHeader,
    ) -> Result<Self> {
        let count = header.frame_count();
        let bytes = reader.read_to_vec(count * 4)?;
        let crc = reader.read_unsigned::<u32>(32)?;
        check_crc("seek table", &bytes, crc)?;

        let frame_sizes: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        for (index, &size) in frame_sizes.iter().enumerate() {
            if size < 4 {
                bail!(TtaError::InvalidFrameSize { index, size });
            }
        }

        let frame_offsets = frame_sizes
            .iter()
            .scan(0u64, |offset, &size| {
                let start = *offset;
                *offset += u64::from(size);
                Some(start)
            })
            .collect();

        Ok(Self {
            frame_sizes,
            frame_offsets,
        })
    }

    /// Bytes taken by the table and its CRC.
    pub fn byte_len(&self) -> u64 {
        self.frame_sizes.len() as u64 * 4 + 4
    }
}

/// Two-level adaptive Rice parameters of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rice {
    k0: u32,
    k1: u32,
    sum0: u32,
    sum1: u32,
}

impl Default for Rice {
    fn default() -> Self {
        Self {
            k0: 10,
            k1: 10,
            sum0: threshold(10),
            sum1: threshold(10),
        }
    }
}

fn threshold(k: u32) -> u32 {
    16u32.wrapping_shl(k)
}

fn adapt(k: &mut u32, sum: &mut u32, value: u32) -> Result<()> {
    *sum = sum.wrapping_add(value).wrapping_sub(*sum >> 4);
    if *k > 0 && *sum < threshold(*k) {
        *k -= 1;
    } else if *sum > threshold(*k + 1) {
        *k += 1;
        if *k > MAX_RICE_PARAMETER {
            bail!(TtaError::RiceParameterOverflow(*k));
        }
    }
    Ok(())
}

impl Rice {
    fn read<R: Read + Seek>(&mut self, reader: &mut BitCursor<R, LittleEndian>) -> Result<i32> {
        let unary = reader.read_unary(false)?;
        let value = if unary == 0 {
            let value = reader.read_u32(self.k0)?;
            adapt(&mut self.k0, &mut self.sum0, value)?;
            value
        } else {
            let high = (unary - 1).wrapping_shl(self.k1);
            let value = high.wrapping_add(reader.read_u32(self.k1)?);
            adapt(&mut self.k1, &mut self.sum1, value)?;
            let value = value.wrapping_add(1 << self.k0);
            adapt(&mut self.k0, &mut self.sum0, value)?;
            value
        };

        // odd codes are positive
        let magnitude = (value >> 1) as i32;
        Ok(if value & 1 != 0 {
            magnitude.wrapping_add(1)
        } else {
            magnitude.wrapping_neg()
        })
    }
}

/// Eight-tap adaptive filter run on every residual.
#[derive(Debug, Clone, Default)]
pub struct HybridFilter {
    shift: u32,
    error: i32,
    qm: [i32; 8],
    dx: [i32; 8],
    dl: [i32; 8],
}

impl HybridFilter {
    pub fn new(bits_per_sample: u16) -> Self {
        let shift = match bits_per_sample {
            16 => 9,
            _ => 10,
        };
        Self {
            shift,
            ..Default::default()
        }
    }

    /// Adapts the taps from the previous residual's sign and returns the
    /// filter's contribution for the next sample.
    fn prediction(&mut self) -> i32 {
        match self.error.signum() {
            -1 => self
                .qm
                .iter_mut()
                .zip(&self.dx)
                .for_each(|(q, &d)| *q = q.wrapping_sub(d)),
            1 => self
                .qm
                .iter_mut()
                .zip(&self.dx)
                .for_each(|(q, &d)| *q = q.wrapping_add(d)),
            _ => {}
        }

        let sum = self
            .dl
            .iter()
            .zip(&self.qm)
            .fold(1i32 << (self.shift - 1), |sum, (&l, &q)| {
                sum.wrapping_add(l.wrapping_mul(q))
            });

        self.dx.copy_within(1..5, 0);
        self.dl.copy_within(1..5, 0);
        self.dx[4] = (self.dl[4] >> 30) | 1;
        self.dx[5] = ((self.dl[5] >> 30) | 2) & !1;
        self.dx[6] = ((self.dl[6] >> 30) | 2) & !1;
        self.dx[7] = ((self.dl[7] >> 30) | 4) & !3;

        sum >> self.shift
    }

    fn update(&mut self, residual: i32, value: i32) {
        self.error = residual;
        self.dl[4] = self.dl[5].wrapping_neg();
        self.dl[5] = self.dl[6].wrapping_neg();
        self.dl[6] = value.wrapping_sub(self.dl[7]);
        self.dl[7] = value;
        self.dl[5] = self.dl[5].wrapping_add(self.dl[6]);
        self.dl[4] = self.dl[4].wrapping_add(self.dl[5]);
    }

    pub fn decode(&mut self, residual: i32) -> i32 {
        let value = residual.wrapping_add(self.prediction());
        self.update(residual, value);
        value
    }
}

/// `x * (2^k - 1) / 2^k`, the fixed first-order prediction.
fn fixed_prediction(previous: i32, bits_per_sample: u16) -> i32 {
    let k = if bits_per_sample == 8 { 4 } else { 5 };
    let x = i64::from(previous);
    (((x << k) - x) >> k) as i32
}

/// Per-channel state, reset at every frame.
#[derive(Debug, Clone)]
struct ChannelState {
    rice: Rice,
    filter: HybridFilter,
    previous: i32,
}

impl ChannelState {
    fn new(bits_per_sample: u16) -> Self {
        Self {
            rice: Rice::default(),
            filter: HybridFilter::new(bits_per_sample),
            previous: 0,
        }
    }
}

/// Undoes inter-channel decorrelation of one PCM frame in place.
pub fn restore_channels(values: &mut [i32]) {
    let n = values.len();
    if n < 2 {
        return;
    }
    values[n - 1] = values[n - 1].wrapping_add(values[n - 2] / 2);
    for i in (0..n - 1).rev() {
        values[i] = values[i + 1].wrapping_sub(values[i]);
    }
}

/// Decodes one frame, verifying its trailing CRC first.
pub fn decode_frame(
    frame: &[u8],
    header: &TtaHeader,
    index: usize,
    samples: u32,
) -> Result<Vec<Vec<i32>>> {
    if frame.len() < 4 {
        bail!(TtaError::InvalidFrameSize {
            index,
            size: frame.len() as u32,
        });
    }
    let (payload, crc) = frame.split_at(frame.len() - 4);
    let read = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    check_crc(&format!("frame {index}"), payload, read)?;

    let channels = usize::from(header.channels);
    let bits = header.bits_per_sample;
    let mut states = vec![ChannelState::new(bits); channels];
    let mut output = vec![Vec::with_capacity(samples as usize); channels];
    let mut values = vec![0i32; channels];
    let mut reader = LeSliceCursor::from_slice(payload);

    for _ in 0..samples {
        for (value, state) in values.iter_mut().zip(&mut states) {
            let residual = state.rice.read(&mut reader)?;
            let filtered = state.filter.decode(residual);
            *value = filtered.wrapping_add(fixed_prediction(state.previous, bits));
            state.previous = *value;
        }

        restore_channels(&mut values);
        for (channel, &value) in output.iter_mut().zip(&values) {
            channel.push(value);
        }
    }

    trace!(
        "TTA frame {index}: {samples} samples, {} of {} payload bytes used",
        reader.byte_position()?,
        payload.len()
    );
    Ok(output)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::utils::bitstream_io::testing::BitSink;

    fn header(channels: u16, bits_per_sample: u16, total_samples: u32) -> TtaHeader {
        TtaHeader {
            format: FORMAT_PCM,
            channels,
            bits_per_sample,
            sample_rate: 44100,
            total_samples,
        }
    }

    #[test]
    fn header_and_frame_geometry() -> Result<()> {
        let expected = header(2, 16, 100_000);
        let bytes = header_bytes(&expected);
        assert_eq!(bytes.len(), HEADER_SIZE as usize);

        let parsed = TtaHeader::read(&mut LeSliceCursor::from_slice(&bytes))?;
        assert_eq!(parsed, expected);
        assert_eq!(parsed.frame_length(), 46080);
        assert_eq!(parsed.frame_count(), 3);
        assert_eq!(parsed.frame_samples(0), 46080);
        assert_eq!(parsed.frame_samples(2), 100_000 - 2 * 46080);

        let exact = header(1, 16, 46080 * 2);
        assert_eq!(exact.frame_count(), 2);
        assert_eq!(exact.frame_samples(1), 46080);
        Ok(())
    }

    #[test]
    fn header_rejections() -> Result<()> {
        let mut bytes = header_bytes(&header(2, 16, 10));
        bytes[10] ^= 1;
        let err = TtaHeader::read(&mut LeSliceCursor::from_slice(&bytes)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TtaError>(),
            Some(TtaError::CrcMismatch { section, .. }) if section == "header"
        ));

        let bytes = header_bytes(&header(2, 20, 10));
        let err = TtaHeader::read(&mut LeSliceCursor::from_slice(&bytes)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TtaError>(),
            Some(TtaError::UnsupportedBitsPerSample(20))
        ));

        let bytes = header_bytes(&TtaHeader {
            format: 2,
            ..header(2, 16, 10)
        });
        let err = TtaHeader::read(&mut LeSliceCursor::from_slice(&bytes)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TtaError>(),
            Some(TtaError::UnsupportedFormat(2))
        ));
        Ok(())
    }

    #[test]
    fn seek_table_offsets_and_crc() -> Result<()> {
        let header = header(1, 16, 46080 * 2 + 1);
        let bytes = seek_table_bytes(&[100, 200, 8]);
        let table = SeekTable::read(&mut LeSliceCursor::from_slice(&bytes), &header)?;
        assert_eq!(table.frame_offsets, [0, 100, 300]);
        assert_eq!(table.byte_len(), 16);

        let mut corrupt = bytes.clone();
        corrupt[0] ^= 0x80;
        assert!(SeekTable::read(&mut LeSliceCursor::from_slice(&corrupt), &header).is_err());

        let bytes = seek_table_bytes(&[100, 2, 8]);
        let err = SeekTable::read(&mut LeSliceCursor::from_slice(&bytes), &header).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TtaError>(),
            Some(TtaError::InvalidFrameSize { index: 1, size: 2 })
        ));
        Ok(())
    }

    #[test]
    fn rice_codes_adapt() -> Result<()> {
        let mut sink = BitSink::<LittleEndian>::new();
        // k0 = 10: terminating zero, then ten bits
        sink.bit(false)?.u(10, 5)?;
        // escape: two ones, zero, then k1 = 10 bits
        sink.unary(2, false)?.u(10, 3)?;
        let data = sink.finish()?;

        let mut rice = Rice::default();
        let mut reader = LeSliceCursor::from_slice(&data);
        assert_eq!(rice.read(&mut reader)?, 3);
        assert_eq!((rice.k0, rice.sum0), (9, 16384 + 5 - 1024));

        // (1 << 10) + 3 plus the 1 << 9 step of the first level
        assert_eq!(rice.read(&mut reader)?, 770);
        assert_eq!((rice.k0, rice.k1), (9, 10));
        Ok(())
    }

    #[test]
    fn channel_decorrelation() {
        let mut values = [10, 4];
        restore_channels(&mut values);
        // last += first / 2 -> 9; first = 9 - 10
        assert_eq!(values, [-1, 9]);

        let mut values = [1, 2, -7];
        restore_channels(&mut values);
        // last = -7 + 1 = -6; middle = -6 - 2 = -8; first = -8 - 1 = -9
        assert_eq!(values, [-9, -8, -6]);
    }

    #[test]
    fn frames_decode_bit_exact() -> Result<()> {
        for (channels, bits) in [(1u16, 8u16), (2, 16), (3, 24)] {
            let header = header(channels, bits, 64);
            let amplitude = 1 << (bits - 2);
            let pcm: Vec<Vec<i32>> = (0..channels as i32)
                .map(|c| {
                    (0..64)
                        .map(|i| ((i * 37 + c * 11) % 97 - 48) * amplitude / 64)
                        .collect()
                })
                .collect();

            let frame = encode_frame(&header, &pcm)?;
            assert_eq!(decode_frame(&frame, &header, 0, 64)?, pcm);
        }
        Ok(())
    }

    #[test]
    fn frame_crc_is_checked() -> Result<()> {
        let header = header(1, 16, 4);
        let mut frame = encode_frame(&header, &[vec![1, -1, 2, -2]])?;
        frame[0] ^= 0x01;
        let err = decode_frame(&frame, &header, 7, 4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TtaError>(),
            Some(TtaError::CrcMismatch { section, .. }) if section == "frame 7"
        ));
        Ok(())
    }
}
