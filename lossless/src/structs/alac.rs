//! ALAC sample description, sample tables and frame decoding.

use std::io::{self, Read, Seek};
use std::iter;

use anyhow::{Result, bail};
use bitstream_io::BigEndian;
use log::trace;

use crate::utils::bitstream_io::{BeSliceCursor, BitCursor, HuffmanTable};
use crate::utils::errors::AlacError;

/// The ALAC magic cookie carried by the `stsd` sample entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlacCookie {
    /// Samples per frame unless a sub-frame carries its own count.
    pub frame_length: u32,
    pub compatible_version: u8,
    pub bits_per_sample: u8,
    /// Rice history multiplier (`pb`).
    pub history_mult: u8,
    /// Initial Rice history (`mb`).
    pub initial_history: u8,
    /// Rice parameter limit (`kb`).
    pub maximum_k: u8,
    pub channels: u8,
    pub max_run: u16,
    pub max_frame_bytes: u32,
    pub avg_bit_rate: u32,
    pub sample_rate: u32,
}

impl AlacCookie {
    /// Parses an `stsd` payload. Any deviation from the expected layout is
    /// `InvalidAlacAtom`.
    pub fn parse(stsd: &[u8]) -> Result<Self> {
        let mut reader = BeSliceCursor::from_slice(stsd);
        match Self::read(&mut reader) {
            Ok(cookie) => Ok(cookie),
            Err(e) if e.downcast_ref::<io::Error>().is_some() => bail!(AlacError::InvalidAlacAtom),
            Err(e) => Err(e),
        }
    }

    pub fn read(reader: &mut BeSliceCursor) -> Result<Self> {
        // version, flags
        reader.skip_bits(32)?;
        let entries = reader.read_unsigned::<u32>(32)?;
        if entries == 0 {
            bail!(AlacError::InvalidAlacAtom);
        }

        // sample entry size
        reader.skip_bits(32)?;
        if &reader.read_tag()? != b"alac" {
            bail!(AlacError::InvalidAlacAtom);
        }
        // reserved(6 bytes), data_reference_index, version, revision, vendor,
        // channels, sample size, compression id, packet size, sample rate
        reader.skip_bytes(28)?;

        // cookie atom size
        reader.skip_bits(32)?;
        if &reader.read_tag()? != b"alac" {
            bail!(AlacError::InvalidAlacAtom);
        }
        // version, flags
        reader.skip_bits(32)?;

        let cookie = Self {
            frame_length: reader.read_unsigned(32)?,
            compatible_version: reader.read_unsigned(8)?,
            bits_per_sample: reader.read_unsigned(8)?,
            history_mult: reader.read_unsigned(8)?,
            initial_history: reader.read_unsigned(8)?,
            maximum_k: reader.read_unsigned(8)?,
            channels: reader.read_unsigned(8)?,
            max_run: reader.read_unsigned(16)?,
            max_frame_bytes: reader.read_unsigned(32)?,
            avg_bit_rate: reader.read_unsigned(32)?,
            sample_rate: reader.read_unsigned(32)?,
        };

        if cookie.frame_length == 0 {
            bail!(AlacError::InvalidAlacAtom);
        }
        if cookie.channels == 0 {
            bail!(AlacError::UnsupportedChannelCount(cookie.channels));
        }
        if !(8..=32).contains(&cookie.bits_per_sample) {
            bail!(AlacError::UnsupportedBitsPerSample(cookie.bits_per_sample));
        }

        Ok(cookie)
    }
}

/// Fields of `mdhd` needed for decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaHeader {
    pub version: u8,
    pub timescale: u32,
    pub duration: u64,
}

impl MediaHeader {
    pub fn parse(mdhd: &[u8]) -> Result<Self> {
        Self::read(&mut BeSliceCursor::from_slice(mdhd))
    }

    pub fn read(reader: &mut BeSliceCursor) -> Result<Self> {
        let version = reader.read_unsigned::<u8>(8)?;
        // flags
        reader.skip_bits(24)?;

        let (timescale, duration) = match version {
            0 => {
                // creation_time, modification_time
                reader.skip_bits(64)?;
                (reader.read_unsigned(32)?, reader.read_unsigned::<u64>(32)?)
            }
            1 => {
                reader.skip_bytes(16)?;
                (reader.read_unsigned(32)?, reader.read_unsigned::<u64>(64)?)
            }
            _ => bail!(AlacError::InvalidMdhdAtom(version)),
        };

        Ok(Self {
            version,
            timescale,
            duration,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeToSample {
    pub sample_count: u32,
    pub sample_delta: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleToChunk {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    pub description_index: u32,
}

fn read_table<T>(
    payload: &[u8],
    mut entry: impl FnMut(&mut BeSliceCursor) -> io::Result<T>,
) -> Result<Vec<T>> {
    let mut reader = BeSliceCursor::from_slice(payload);
    // version, flags
    reader.skip_bits(32)?;
    let count = reader.read_unsigned::<u32>(32)? as usize;
    if (count as u64) << 2 > reader.available()? >> 3 {
        bail!(AlacError::InvalidSeektable(format!(
            "table declares {count} entries in {} bytes",
            payload.len()
        )));
    }

    (0..count)
        .map(|_| entry(&mut reader).map_err(Into::into))
        .collect()
}

pub fn read_stts(payload: &[u8]) -> Result<Vec<TimeToSample>> {
    read_table(payload, |r| {
        Ok(TimeToSample {
            sample_count: r.read_unsigned(32)?,
            sample_delta: r.read_unsigned(32)?,
        })
    })
}

pub fn read_stsc(payload: &[u8]) -> Result<Vec<SampleToChunk>> {
    read_table(payload, |r| {
        Ok(SampleToChunk {
            first_chunk: r.read_unsigned(32)?,
            samples_per_chunk: r.read_unsigned(32)?,
            description_index: r.read_unsigned(32)?,
        })
    })
}

pub fn read_stco(payload: &[u8]) -> Result<Vec<u64>> {
    read_table(payload, |r| r.read_unsigned::<u64>(32))
}

pub fn read_co64(payload: &[u8]) -> Result<Vec<u64>> {
    read_table(payload, |r| r.read_unsigned::<u64>(64))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekEntry {
    pub pcm_frame: u64,
    pub byte_offset: u64,
}

/// PCM frame offset to byte offset, one entry per chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekTable {
    pub entries: Vec<SeekEntry>,
    /// Built from the mdat start alone because the sample tables were
    /// missing or inconsistent.
    pub degraded: bool,
}

impl SeekTable {
    pub fn single(byte_offset: u64) -> Self {
        Self {
            entries: vec![SeekEntry {
                pcm_frame: 0,
                byte_offset,
            }],
            degraded: true,
        }
    }

    pub fn build(
        stts: &[TimeToSample],
        stsc: &[SampleToChunk],
        chunk_offsets: &[u64],
        total_frames: u64,
    ) -> Result<Self> {
        let stts_total: u64 = stts
            .iter()
            .map(|e| e.sample_count as u64 * e.sample_delta as u64)
            .sum();
        if stts_total != total_frames {
            bail!(AlacError::InvalidSeektable(format!(
                "stts covers {stts_total} PCM frames, mdhd declares {total_frames}"
            )));
        }

        if stsc.first().map(|e| e.first_chunk) != Some(1) {
            bail!(AlacError::InvalidSeektable(
                "stsc does not start at chunk 1".to_string()
            ));
        }

        let mut deltas = stts
            .iter()
            .flat_map(|e| iter::repeat_n(e.sample_delta as u64, e.sample_count as usize));
        let mut entries = Vec::with_capacity(chunk_offsets.len());
        let mut pcm_frame = 0u64;
        let mut run = 0;

        for (index, &byte_offset) in chunk_offsets.iter().enumerate() {
            let chunk = index as u32 + 1;
            while run + 1 < stsc.len() && stsc[run + 1].first_chunk <= chunk {
                run += 1;
            }

            entries.push(SeekEntry {
                pcm_frame,
                byte_offset,
            });

            for _ in 0..stsc[run].samples_per_chunk {
                let Some(delta) = deltas.next() else {
                    bail!(AlacError::InvalidSeektable(format!(
                        "chunk {chunk} references more samples than stts holds"
                    )));
                };
                pcm_frame += delta;
            }
        }

        if pcm_frame != total_frames {
            bail!(AlacError::InvalidSeektable(format!(
                "chunks cover {pcm_frame} PCM frames, expected {total_frames}"
            )));
        }

        Ok(Self {
            entries,
            degraded: false,
        })
    }

    /// Last entry at or before `pcm_frame`.
    pub fn lookup(&self, pcm_frame: u64) -> SeekEntry {
        let index = self
            .entries
            .partition_point(|e| e.pcm_frame <= pcm_frame)
            .saturating_sub(1);
        self.entries[index]
    }
}

/// Per-channel parameters of a compressed sub-frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubframeHeader {
    pub prediction_type: u8,
    pub qlp_shift: u32,
    pub rice_modifier: u32,
    pub coefficients: Vec<i32>,
}

impl SubframeHeader {
    pub fn read<R: Read + Seek>(reader: &mut BitCursor<R, BigEndian>) -> Result<Self> {
        let prediction_type = reader.read_unsigned::<u8>(4)?;
        if prediction_type != 0 {
            bail!(AlacError::UnsupportedPredictionType(prediction_type));
        }
        let qlp_shift = reader.read_unsigned(4)?;
        let rice_modifier = reader.read_unsigned(3)?;
        let order = reader.read_unsigned::<u32>(5)?;
        let coefficients = (0..order)
            .map(|_| reader.read_signed::<i16>(16).map(i32::from))
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            prediction_type,
            qlp_shift,
            rice_modifier,
            coefficients,
        })
    }
}

#[inline(always)]
fn log2(x: u32) -> u32 {
    31 - (x | 1).leading_zeros()
}

#[inline(always)]
fn sign_extend(value: i32, bits: u32) -> i32 {
    if bits >= 32 {
        value
    } else {
        let shift = 32 - bits;
        (value << shift) >> shift
    }
}

/// One adaptive-Rice value: a prefix of up to eight ones, then `k` bits
/// of which the last is only present when the first `k - 1` are nonzero.
/// Nine ones escape to a plain `escape_bits` read.
fn read_scalar<R: Read + Seek>(
    reader: &mut BitCursor<R, BigEndian>,
    k: u32,
    escape_bits: u32,
) -> io::Result<u32> {
    let Some(prefix) = reader.read_huffman(HuffmanTable::AlacPrefix)? else {
        return reader.read_u32(escape_bits);
    };

    if k <= 1 {
        return Ok(prefix);
    }

    let m = (1u32 << k) - 1;
    let high = reader.read_u32(k - 1)?;
    if high == 0 {
        Ok(prefix * m)
    } else {
        let low = reader.read_bit()? as u32;
        Ok(prefix * m + ((high << 1) | low) - 1)
    }
}

/// Rice state shared by every channel of a stream.
#[derive(Debug, Clone, Copy)]
pub struct RiceParams {
    pub history_mult: u32,
    pub initial_history: u32,
    pub maximum_k: u32,
}

impl From<&AlacCookie> for RiceParams {
    fn from(cookie: &AlacCookie) -> Self {
        Self {
            history_mult: cookie.history_mult as u32,
            initial_history: cookie.initial_history as u32,
            maximum_k: cookie.maximum_k as u32,
        }
    }
}

pub fn read_residuals<R: Read + Seek>(
    reader: &mut BitCursor<R, BigEndian>,
    params: RiceParams,
    rice_modifier: u32,
    count: usize,
    sample_size: u32,
) -> Result<Vec<i32>> {
    let mult = params.history_mult * rice_modifier / 4;
    let escape_bits = sample_size.min(32);
    let mut history = params.initial_history;
    let mut sign_modifier = 0u32;
    let mut residuals = Vec::with_capacity(count);

    while residuals.len() < count {
        let k = log2((history >> 9) + 3).min(params.maximum_k);
        let x = read_scalar(reader, k, escape_bits)?.wrapping_add(sign_modifier);
        sign_modifier = 0;
        residuals.push(((x >> 1) as i32) ^ -((x & 1) as i32));

        if x > 0xFFFF {
            history = 0xFFFF;
        } else {
            history = history
                .wrapping_add(x.wrapping_mul(mult))
                .wrapping_sub(history.wrapping_mul(mult) >> 9);
        }

        if history < 128 && residuals.len() < count {
            let k = (history.leading_zeros() - 24 + ((history + 16) >> 6)).min(params.maximum_k);
            let run = read_scalar(reader, k, 16)?;
            let remaining = count - residuals.len();
            if run as usize > remaining {
                bail!(AlacError::ZeroRunOverflow { run, remaining });
            }
            residuals.resize(residuals.len() + run as usize, 0);
            if run < 0xFFFF {
                sign_modifier = 1;
            }
            history = 0;
        }
    }

    Ok(residuals)
}

/// Rebuilds samples from residuals with the adaptive LPC predictor.
/// `coefficients` is updated in place as the predictor adapts.
pub fn predict(residuals: &[i32], coefficients: &mut [i32], shift: u32, sample_size: u32) -> Vec<i32> {
    let n = residuals.len();
    let mut out = Vec::with_capacity(n);
    let Some(&first) = residuals.first() else {
        return out;
    };
    out.push(first);

    let order = coefficients.len();
    if order == 0 {
        out.extend_from_slice(&residuals[1..]);
        return out;
    }

    if order == 31 {
        for i in 1..n {
            out.push(sign_extend(out[i - 1].wrapping_add(residuals[i]), sample_size));
        }
        return out;
    }

    for i in 1..=order.min(n - 1) {
        out.push(sign_extend(out[i - 1].wrapping_add(residuals[i]), sample_size));
    }

    let round = if shift > 0 { 1i32 << (shift - 1) } else { 0 };
    for i in order + 1..n {
        let d = out[i - order - 1];
        let sum = (0..order).fold(0i32, |acc, j| {
            acc.wrapping_add(coefficients[j].wrapping_mul(out[i - 1 - j].wrapping_sub(d)))
        });

        let mut residual = residuals[i];
        let value = (sum.wrapping_add(round) >> shift)
            .wrapping_add(d)
            .wrapping_add(residual);
        out.push(sign_extend(value, sample_size));

        let error_sign = residual.signum();
        if error_sign != 0 {
            for j in 0..order {
                if residual.wrapping_mul(error_sign) <= 0 {
                    break;
                }
                let v = d.wrapping_sub(out[i - order + j]);
                let sign = v.signum() * error_sign;
                coefficients[order - 1 - j] -= sign;
                residual = residual
                    .wrapping_sub((v.wrapping_mul(sign) >> shift).wrapping_mul(j as i32 + 1));
            }
        }
    }

    out
}

/// Undoes the weighted mid/side transform of a channel pair.
pub fn decorrelate(ch0: &mut [i32], ch1: &mut [i32], shift: u32, leftweight: i32) {
    let shift = shift.min(31);
    for (u, v) in ch0.iter_mut().zip(ch1.iter_mut()) {
        let left = u
            .wrapping_add(*v)
            .wrapping_sub(leftweight.wrapping_mul(*v) >> shift);
        let right = left.wrapping_sub(*v);
        *u = left;
        *v = right;
    }
}

fn read_element<R: Read + Seek>(
    reader: &mut BitCursor<R, BigEndian>,
    cookie: &AlacCookie,
    channels: usize,
) -> Result<Vec<Vec<i32>>> {
    // element instance tag
    reader.skip_bits(4)?;
    let unused = reader.read_unsigned::<u16>(12)?;
    if unused != 0 {
        bail!(AlacError::InvalidUnusedBits(unused));
    }

    let has_sample_count = reader.read_bit()?;
    let lsb_bytes = reader.read_unsigned::<u32>(2)?;
    let not_compressed = reader.read_bit()?;
    let sample_count = if has_sample_count {
        reader.read_unsigned::<u32>(32)?
    } else {
        cookie.frame_length
    };
    if sample_count > cookie.frame_length {
        bail!(AlacError::FrameTooLong {
            found: sample_count,
            max: cookie.frame_length,
        });
    }

    let n = sample_count as usize;
    let bits_per_sample = cookie.bits_per_sample as u32;
    trace!("ALAC element: {channels} ch, {n} samples, compressed={}", !not_compressed);

    if not_compressed {
        let mut out = vec![Vec::with_capacity(n); channels];
        for _ in 0..n {
            for channel in out.iter_mut() {
                channel.push(reader.read_signed::<i32>(bits_per_sample)?);
            }
        }
        return Ok(out);
    }

    let shift = reader.read_unsigned::<u32>(8)?;
    let leftweight = reader.read_signed::<i8>(8)? as i32;
    let headers = (0..channels)
        .map(|_| SubframeHeader::read(reader))
        .collect::<Result<Vec<_>>>()?;

    let lsb_bits = lsb_bytes * 8;
    let lsbs = if lsb_bits > 0 {
        (0..n * channels)
            .map(|_| reader.read_unsigned::<u32>(lsb_bits))
            .collect::<io::Result<Vec<_>>>()?
    } else {
        Vec::new()
    };

    let sample_size = (bits_per_sample + channels as u32 - 1).saturating_sub(lsb_bits);
    let params = RiceParams::from(cookie);
    let mut out = Vec::with_capacity(channels);
    for mut header in headers {
        let residuals = read_residuals(reader, params, header.rice_modifier, n, sample_size)?;
        out.push(predict(
            &residuals,
            &mut header.coefficients,
            header.qlp_shift,
            sample_size,
        ));
    }

    if let [ch0, ch1] = out.as_mut_slice() {
        if leftweight != 0 {
            decorrelate(ch0, ch1, shift, leftweight);
        }
    }

    if lsb_bits > 0 {
        for (i, frame) in lsbs.chunks_exact(channels).enumerate() {
            for (channel, &lsb) in out.iter_mut().zip(frame) {
                channel[i] = (channel[i] << lsb_bits) | lsb as i32;
            }
        }
    }

    Ok(out)
}

/// Decodes one frame set and byte-aligns. Channels are in ALAC order.
pub fn read_frame_set<R: Read + Seek>(
    reader: &mut BitCursor<R, BigEndian>,
    cookie: &AlacCookie,
) -> Result<Vec<Vec<i32>>> {
    let mut channels: Vec<Vec<i32>> = Vec::with_capacity(cookie.channels as usize);

    loop {
        let channels_minus_one = reader.read_unsigned::<u8>(3)?;
        if channels_minus_one == 7 {
            break;
        }

        let element = read_element(reader, cookie, channels_minus_one as usize + 1)?;
        if let (Some(first), Some(next)) = (channels.first(), element.first()) {
            if first.len() != next.len() {
                bail!(AlacError::SampleCountMismatch {
                    found: next.len(),
                    expected: first.len(),
                });
            }
        }
        channels.extend(element);
    }

    reader.byte_align();
    Ok(channels)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Minimal ALAC encoder for building test streams.

    use std::io;

    use bitstream_io::BigEndian;

    use super::*;
    use crate::structs::atom::testing::atom;
    use crate::utils::bitstream_io::testing::BitSink;

    impl AlacCookie {
        pub fn for_test(channels: u8, bits_per_sample: u8, frame_length: u32) -> Self {
            Self {
                frame_length,
                compatible_version: 0,
                bits_per_sample,
                history_mult: 40,
                initial_history: 10,
                maximum_k: 14,
                channels,
                max_run: 255,
                max_frame_bytes: 0,
                avg_bit_rate: 0,
                sample_rate: 44100,
            }
        }

        pub fn to_stsd(&self) -> Vec<u8> {
            let mut config = vec![0u8; 4];
            config.extend_from_slice(&self.frame_length.to_be_bytes());
            config.extend_from_slice(&[
                self.compatible_version,
                self.bits_per_sample,
                self.history_mult,
                self.initial_history,
                self.maximum_k,
                self.channels,
            ]);
            config.extend_from_slice(&self.max_run.to_be_bytes());
            config.extend_from_slice(&self.max_frame_bytes.to_be_bytes());
            config.extend_from_slice(&self.avg_bit_rate.to_be_bytes());
            config.extend_from_slice(&self.sample_rate.to_be_bytes());

            let mut entry = vec![0u8; 6];
            entry.extend_from_slice(&1u16.to_be_bytes());
            entry.extend_from_slice(&[0u8; 8]);
            entry.extend_from_slice(&(self.channels as u16).to_be_bytes());
            entry.extend_from_slice(&(self.bits_per_sample as u16).to_be_bytes());
            entry.extend_from_slice(&[0u8; 4]);
            entry.extend_from_slice(&(self.sample_rate << 16).to_be_bytes());
            entry.extend(atom(b"alac", &config));

            let mut stsd = vec![0, 0, 0, 0, 0, 0, 0, 1];
            stsd.extend(atom(b"alac", &entry));
            stsd
        }
    }

    fn fold(residual: i32) -> u32 {
        if residual >= 0 {
            (residual as u32) << 1
        } else {
            ((-(residual as i64)) as u32 * 2) - 1
        }
    }

    fn write_scalar(sink: &mut BitSink<BigEndian>, x: u32, k: u32, escape_bits: u32) -> io::Result<()> {
        let (prefix, rest) = if k <= 1 {
            (x, 0)
        } else {
            let m = (1u32 << k) - 1;
            (x / m, x % m)
        };

        if prefix > 8 {
            sink.u(9, 0x1FF)?.u(escape_bits, x)?;
        } else {
            sink.unary(prefix, false)?;
            if k > 1 {
                if rest == 0 {
                    sink.u(k - 1, 0)?;
                } else {
                    sink.u(k, rest + 1)?;
                }
            }
        }
        Ok(())
    }

    /// Mirror image of [`read_residuals`].
    pub fn write_residuals(
        sink: &mut BitSink<BigEndian>,
        params: RiceParams,
        rice_modifier: u32,
        residuals: &[i32],
        sample_size: u32,
    ) -> io::Result<()> {
        let mult = params.history_mult * rice_modifier / 4;
        let mut history = params.initial_history;
        let mut sign_modifier = 0;
        let mut i = 0;

        while i < residuals.len() {
            let k = log2((history >> 9) + 3).min(params.maximum_k);
            let folded = fold(residuals[i]);
            write_scalar(sink, folded - sign_modifier, k, sample_size)?;
            sign_modifier = 0;
            i += 1;

            if folded > 0xFFFF {
                history = 0xFFFF;
            } else {
                history = history + folded * mult - ((history * mult) >> 9);
            }

            if history < 128 && i < residuals.len() {
                let k = (history.leading_zeros() - 24 + ((history + 16) >> 6)).min(params.maximum_k);
                let run = residuals[i..].iter().take_while(|&&r| r == 0).count() as u32;
                write_scalar(sink, run, k, 16)?;
                i += run as usize;
                if run < 0xFFFF {
                    sign_modifier = 1;
                }
                history = 0;
            }
        }
        Ok(())
    }

    pub enum Element<'a> {
        Verbatim(&'a [Vec<i32>]),
        /// Order-0 prediction, optional mid/side weighting.
        Copy {
            samples: &'a [Vec<i32>],
            shift: u32,
            leftweight: i32,
        },
        /// Order-31 prediction (first-order integration).
        Integrate(&'a [Vec<i32>]),
    }

    /// Writes one element header plus body. `sample_count` is written
    /// explicitly when it differs from the cookie's frame length.
    pub fn write_element(
        sink: &mut BitSink<BigEndian>,
        cookie: &AlacCookie,
        element: Element,
    ) -> io::Result<()> {
        let samples = match &element {
            Element::Verbatim(s) | Element::Integrate(s) => *s,
            Element::Copy { samples, .. } => *samples,
        };
        let channels = samples.len() as u32;
        let n = samples[0].len() as u32;
        let bps = cookie.bits_per_sample as u32;
        let explicit = n != cookie.frame_length;

        sink.u(3, channels - 1)?.u(4, 0)?.u(12, 0)?;
        sink.bit(explicit)?.u(2, 0)?.bit(matches!(element, Element::Verbatim(_)))?;
        if explicit {
            sink.u(32, n)?;
        }

        let sample_size = bps + channels - 1;
        let params = RiceParams::from(cookie);
        match element {
            Element::Verbatim(samples) => {
                for i in 0..n as usize {
                    for channel in samples {
                        sink.s(bps, channel[i])?;
                    }
                }
            }
            Element::Copy {
                samples,
                shift,
                leftweight,
            } => {
                let mut coded = samples.to_vec();
                if channels == 2 && leftweight != 0 {
                    for i in 0..n as usize {
                        let (l, r) = (samples[0][i], samples[1][i]);
                        let v = l - r;
                        coded[0][i] = r + ((leftweight * v) >> shift);
                        coded[1][i] = v;
                    }
                }
                sink.u(8, shift)?.s(8, leftweight)?;
                for _ in 0..channels {
                    sink.u(4, 0)?.u(4, 0)?.u(3, 4)?.u(5, 0)?;
                }
                for channel in &coded {
                    write_residuals(sink, params, 4, channel, sample_size)?;
                }
            }
            Element::Integrate(samples) => {
                sink.u(8, 0)?.s(8, 0)?;
                for _ in 0..channels {
                    sink.u(4, 0)?.u(4, 0)?.u(3, 4)?.u(5, 31)?;
                    for _ in 0..31 {
                        sink.s(16, 0)?;
                    }
                }
                for channel in samples {
                    let residuals: Vec<i32> = channel
                        .iter()
                        .enumerate()
                        .map(|(i, &s)| if i == 0 { s } else { s - channel[i - 1] })
                        .collect();
                    write_residuals(sink, params, 4, &residuals, sample_size)?;
                }
            }
        }
        Ok(())
    }

    pub fn end_frame_set(sink: &mut BitSink<BigEndian>) -> io::Result<()> {
        sink.u(3, 7)?.align()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bitstream_io::BigEndian;

    use super::testing::{Element, end_frame_set, write_element, write_residuals};
    use super::*;
    use crate::utils::bitstream_io::testing::BitSink;

    #[test]
    fn cookie_parses_and_rejects_wrong_tag() -> Result<()> {
        let cookie = AlacCookie::for_test(2, 16, 4096);
        let stsd = cookie.to_stsd();
        assert_eq!(AlacCookie::parse(&stsd)?, cookie);

        let mut broken = stsd.clone();
        let inner = broken.len() - 24 - 4 - 4;
        broken[inner] = b'x';
        let err = AlacCookie::parse(&broken).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AlacError>(),
            Some(AlacError::InvalidAlacAtom)
        ));

        let err = AlacCookie::parse(&stsd[..40]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AlacError>(),
            Some(AlacError::InvalidAlacAtom)
        ));
        Ok(())
    }

    #[test]
    fn mdhd_versions() -> Result<()> {
        let mut v0 = vec![0u8; 12];
        v0.extend_from_slice(&44100u32.to_be_bytes());
        v0.extend_from_slice(&1000u32.to_be_bytes());
        v0.extend_from_slice(&[0u8; 4]);
        assert_eq!(MediaHeader::parse(&v0)?.duration, 1000);

        let mut v1 = vec![1u8, 0, 0, 0];
        v1.extend_from_slice(&[0u8; 16]);
        v1.extend_from_slice(&48000u32.to_be_bytes());
        v1.extend_from_slice(&(1u64 << 33).to_be_bytes());
        let header = MediaHeader::parse(&v1)?;
        assert_eq!((header.timescale, header.duration), (48000, 1 << 33));

        let err = MediaHeader::parse(&[2u8; 32]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AlacError>(),
            Some(AlacError::InvalidMdhdAtom(2))
        ));
        Ok(())
    }

    #[test]
    fn seek_table_from_sample_tables() -> Result<()> {
        let stts = [
            TimeToSample {
                sample_count: 5,
                sample_delta: 4096,
            },
            TimeToSample {
                sample_count: 1,
                sample_delta: 100,
            },
        ];
        let stsc = [
            SampleToChunk {
                first_chunk: 1,
                samples_per_chunk: 2,
                description_index: 1,
            },
            SampleToChunk {
                first_chunk: 3,
                samples_per_chunk: 1,
                description_index: 1,
            },
        ];
        let offsets = [1000, 3000, 5000, 6000];

        let table = SeekTable::build(&stts, &stsc, &offsets, 5 * 4096 + 100)?;
        let frames: Vec<u64> = table.entries.iter().map(|e| e.pcm_frame).collect();
        assert_eq!(frames, [0, 8192, 16384, 20480]);
        assert_eq!(table.lookup(10_000).byte_offset, 3000);
        assert_eq!(table.lookup(0).byte_offset, 1000);
        assert_eq!(table.lookup(u64::MAX).pcm_frame, 20480);

        let err = SeekTable::build(&stts, &stsc, &offsets, 5 * 4096).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AlacError>(),
            Some(AlacError::InvalidSeektable(_))
        ));
        Ok(())
    }

    #[test]
    fn residuals_with_zero_runs_and_escapes() -> Result<()> {
        let params = RiceParams {
            history_mult: 40,
            initial_history: 10,
            maximum_k: 14,
        };
        let residuals = [0, 0, 0, 5, -3, 100, -20000, 0, 1, 0, 0, 0, 0, 7, -1, 30000];

        let mut sink = BitSink::<BigEndian>::new();
        write_residuals(&mut sink, params, 4, &residuals, 17)?;
        let data = sink.finish()?;

        let mut reader = BeSliceCursor::from_slice(&data);
        let decoded = read_residuals(&mut reader, params, 4, residuals.len(), 17)?;
        assert_eq!(decoded, residuals);
        Ok(())
    }

    #[test]
    fn zero_run_past_the_end_is_rejected() -> Result<()> {
        let params = RiceParams {
            history_mult: 40,
            initial_history: 10,
            maximum_k: 14,
        };
        // first residual 0, then a zero run of 5 in a 3-sample block
        let mut sink = BitSink::<BigEndian>::new();
        sink.u(1, 0)?.u(1, 0)?.u(4, 6)?;
        let data = sink.finish()?;

        let mut reader = BeSliceCursor::from_slice(&data);
        let err = read_residuals(&mut reader, params, 4, 3, 16).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AlacError>(),
            Some(AlacError::ZeroRunOverflow { run: 5, remaining: 2 })
        ));
        Ok(())
    }

    #[test]
    fn lpc_order_one_with_adaptation() {
        // coefficient 1.0 at shift 9: prediction tracks the previous sample
        let mut coefficients = [512];
        let residuals = [10, 2, 3, -1, 0];
        let out = predict(&residuals, &mut coefficients, 9, 16);

        // out[1] = 10 + 2 (warm-up)
        // out[2]: d = 10, sum = 512 * 2 = 1024 -> (1024 + 256) >> 9 = 2; 2 + 10 + 3 = 15
        //   adapt: v = 10 - 12 = -2, sign = -1 * 1 -> coefficient 513
        // out[3]: d = 12, sum = 513 * 3 = 1539 -> (1539 + 256) >> 9 = 3; 3 + 12 - 1 = 14
        //   adapt: v = 12 - 15 = -3, sign = -1 * -1 = 1 -> coefficient 512
        // out[4]: d = 15, sum = 512 * -1 = -512 -> (-512 + 256) >> 9 = -1; -1 + 15 + 0 = 14
        assert_eq!(out, [10, 12, 15, 14, 14]);
        assert_eq!(coefficients, [512]);
    }

    #[test]
    fn stereo_decorrelation() {
        let mut ch0 = [10, -4];
        let mut ch1 = [2, 6];
        decorrelate(&mut ch0, &mut ch1, 2, 2);
        // left = u + v - ((2 * v) >> 2), right = left - v
        assert_eq!(ch0, [11, -1]);
        assert_eq!(ch1, [9, -7]);
    }

    #[test]
    fn frame_sets_of_each_kind() -> Result<()> {
        let cookie = AlacCookie::for_test(2, 16, 6);
        let left = vec![0, 100, -100, 32767, -32768, 5];
        let right = vec![1, 90, -120, 32000, -32000, 0];
        let stereo = [left.clone(), right.clone()];

        let mut sink = BitSink::<BigEndian>::new();
        write_element(&mut sink, &cookie, Element::Verbatim(&stereo))?;
        end_frame_set(&mut sink)?;
        write_element(
            &mut sink,
            &cookie,
            Element::Copy {
                samples: &stereo,
                shift: 2,
                leftweight: 2,
            },
        )?;
        end_frame_set(&mut sink)?;
        let short = [left[..3].to_vec(), right[..3].to_vec()];
        write_element(&mut sink, &cookie, Element::Integrate(&short))?;
        end_frame_set(&mut sink)?;
        let data = sink.finish()?;

        let mut reader = BeSliceCursor::from_slice(&data);
        assert_eq!(read_frame_set(&mut reader, &cookie)?, stereo);
        assert_eq!(read_frame_set(&mut reader, &cookie)?, stereo);
        assert_eq!(read_frame_set(&mut reader, &cookie)?, short);
        assert_eq!(reader.available()?, 0);
        Ok(())
    }

    #[test]
    fn nonzero_unused_bits_are_rejected() -> Result<()> {
        let cookie = AlacCookie::for_test(1, 16, 4);
        let mut sink = BitSink::<BigEndian>::new();
        sink.u(3, 0)?.u(4, 0)?.u(12, 0x010)?.u(4, 0)?;
        let data = sink.finish()?;

        let err = read_frame_set(&mut BeSliceCursor::from_slice(&data), &cookie).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AlacError>(),
            Some(AlacError::InvalidUnusedBits(0x010))
        ));

        // The element instance tag (bits 4..1 of the first byte) is not
        // checked; the bit after it is the first of the twelve that are.
        let mono = [vec![7, -7, 0, 1]];
        let mut sink = BitSink::<BigEndian>::new();
        write_element(&mut sink, &cookie, Element::Verbatim(&mono))?;
        end_frame_set(&mut sink)?;
        let mut data = sink.finish()?;

        data[0] |= 0b0001_1110;
        assert_eq!(
            read_frame_set(&mut BeSliceCursor::from_slice(&data), &cookie)?,
            mono
        );

        data[0] |= 0b0000_0001;
        let err = read_frame_set(&mut BeSliceCursor::from_slice(&data), &cookie).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AlacError>(),
            Some(AlacError::InvalidUnusedBits(0x800))
        ));
        Ok(())
    }

    #[test]
    fn nonzero_prediction_type_is_unsupported() -> Result<()> {
        let cookie = AlacCookie::for_test(1, 16, 4);
        let mut sink = BitSink::<BigEndian>::new();
        sink.u(3, 0)?.u(16, 0)?.u(4, 0)?.u(16, 0)?.u(4, 15)?.u(12, 0)?;
        let data = sink.finish()?;

        let err = read_frame_set(&mut BeSliceCursor::from_slice(&data), &cookie).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AlacError>(),
            Some(AlacError::UnsupportedPredictionType(15))
        ));
        Ok(())
    }
}
