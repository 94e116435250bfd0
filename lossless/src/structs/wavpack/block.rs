//! Block header, sub-block parsing and per-block decoding.

use std::io::{Read, Seek};

use anyhow::{Result, bail};
use bitstream_io::LittleEndian;
use log::{debug, trace};

use super::decorrelation::{DecorrelationPass, read_samples, read_terms, read_weights};
use super::entropy::EntropyState;
use crate::utils::bitstream_io::{BitCursor, LeSliceCursor};
use crate::utils::errors::WavPackError;

pub const HEADER_SIZE: u32 = 32;

pub const SAMPLE_RATES: [u32; 15] = [
    6000, 8000, 9600, 11025, 12000, 16000, 22050, 24000, 32000, 44100, 48000, 64000, 88200, 96000,
    192000,
];

pub const FLAG_MONO: u32 = 1 << 2;
pub const FLAG_HYBRID: u32 = 1 << 3;
pub const FLAG_JOINT_STEREO: u32 = 1 << 4;
pub const FLAG_CROSS_DECORRELATION: u32 = 1 << 5;
pub const FLAG_FLOAT: u32 = 1 << 7;
pub const FLAG_EXTENDED_INTEGERS: u32 = 1 << 8;
pub const FLAG_INITIAL_BLOCK: u32 = 1 << 11;
pub const FLAG_FINAL_BLOCK: u32 = 1 << 12;
pub const FLAG_FALSE_STEREO: u32 = 1 << 30;
pub const FLAG_RESERVED: u32 = 1 << 31;

const SHIFT_LSB: u32 = 13;
const RATE_LSB: u32 = 23;
const RATE_CUSTOM: u32 = 15;

/// Sub-block function ids.
mod id {
    pub const DUMMY: u8 = 0x00;
    pub const ENCODER_INFO: u8 = 0x01;
    pub const DECORR_TERMS: u8 = 0x02;
    pub const DECORR_WEIGHTS: u8 = 0x03;
    pub const DECORR_SAMPLES: u8 = 0x04;
    pub const ENTROPY_VARS: u8 = 0x05;
    pub const HYBRID_PROFILE: u8 = 0x06;
    pub const SHAPING_WEIGHTS: u8 = 0x07;
    pub const FLOAT_INFO: u8 = 0x08;
    pub const INT32_INFO: u8 = 0x09;
    pub const WV_BITSTREAM: u8 = 0x0A;
    pub const WVC_BITSTREAM: u8 = 0x0B;
    pub const WVX_BITSTREAM: u8 = 0x0C;
    pub const CHANNEL_INFO: u8 = 0x0D;
    pub const DSD_BLOCK: u8 = 0x0E;

    pub const NONDECODER: u8 = 0x20;
    pub const RIFF_HEADER: u8 = 0x21;
    pub const RIFF_TRAILER: u8 = 0x22;
    pub const ALT_HEADER: u8 = 0x23;
    pub const ALT_TRAILER: u8 = 0x24;
    pub const CONFIG_BLOCK: u8 = 0x25;
    pub const MD5_CHECKSUM: u8 = 0x26;
    pub const SAMPLE_RATE: u8 = 0x27;
    pub const ALT_EXTENSION: u8 = 0x28;
    pub const ALT_MD5_CHECKSUM: u8 = 0x29;
    pub const NEW_CONFIG: u8 = 0x2A;
    pub const CHANNEL_IDENTITIES: u8 = 0x2B;
    pub const BLOCK_CHECKSUM: u8 = 0x2F;

    pub const ODD_SIZE: u8 = 0x40;
    pub const LARGE: u8 = 0x80;
    pub const FUNCTION: u8 = 0x3F;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    /// Bytes following the size field.
    pub block_size: u32,
    pub version: u16,
    pub total_samples: Option<u64>,
    pub block_index: u64,
    pub block_samples: u32,
    pub flags: u32,
    pub crc: u32,
}

impl BlockHeader {
    pub fn read<R: Read + Seek>(reader: &mut BitCursor<R, LittleEndian>) -> Result<Self> {
        let magic = reader.read_tag()?;
        if &magic != b"wvpk" {
            bail!(WavPackError::InvalidBlockId(magic));
        }

        let block_size = reader.read_u32(32)?;
        if block_size < HEADER_SIZE - 8 {
            bail!(WavPackError::InvalidBlockSize(block_size));
        }

        let version = reader.read_unsigned::<u16>(16)?;
        if !(0x402..=0x410).contains(&version) {
            bail!(WavPackError::UnsupportedVersion(version));
        }

        let index_high = reader.read_unsigned::<u8>(8)? as u64;
        let total_high = reader.read_unsigned::<u8>(8)? as u64;
        let total_low = reader.read_u32(32)?;
        let index_low = reader.read_u32(32)? as u64;
        let block_samples = reader.read_u32(32)?;
        let flags = reader.read_u32(32)?;
        let crc = reader.read_u32(32)?;

        if flags & FLAG_RESERVED != 0 {
            bail!(WavPackError::InvalidReservedBit);
        }

        Ok(Self {
            block_size,
            version,
            total_samples: (total_low != u32::MAX).then_some((total_high << 32) | total_low as u64),
            block_index: (index_high << 32) | index_low,
            block_samples,
            flags,
            crc,
        })
    }

    /// Sub-block bytes following the 32-byte header.
    pub fn payload_len(&self) -> usize {
        (self.block_size + 8 - HEADER_SIZE) as usize
    }

    pub fn bytes_per_sample(&self) -> u32 {
        (self.flags & 3) + 1
    }

    pub fn bits_per_sample(&self) -> u32 {
        self.bytes_per_sample() * 8
    }

    /// Mono and false-stereo blocks carry one coded channel.
    pub fn is_mono(&self) -> bool {
        self.flags & (FLAG_MONO | FLAG_FALSE_STEREO) != 0
    }

    pub fn output_channels(&self) -> usize {
        if self.flags & FLAG_MONO != 0 { 1 } else { 2 }
    }

    pub fn is_initial(&self) -> bool {
        self.flags & FLAG_INITIAL_BLOCK != 0
    }

    pub fn is_final(&self) -> bool {
        self.flags & FLAG_FINAL_BLOCK != 0
    }

    pub fn left_shift(&self) -> u32 {
        (self.flags >> SHIFT_LSB) & 0x1F
    }

    /// `None` when the rate is carried in a sample-rate sub-block.
    pub fn sample_rate(&self) -> Option<u32> {
        match (self.flags >> RATE_LSB) & 0xF {
            RATE_CUSTOM => None,
            index => SAMPLE_RATES.get(index as usize).copied(),
        }
    }
}

/// Post-processing for samples packed into fewer bits than stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtendedIntegers {
    pub shift: u32,
    /// Mask selecting the bit to replicate: 1 duplicates the LSB.
    pub and: i32,
    /// 1 fills shifted-in bits with ones.
    pub or: i32,
}

impl ExtendedIntegers {
    pub fn from_subblock(data: &[u8]) -> Result<Self> {
        let &[sent_bits, zeros, ones, dups] = data else {
            bail!(WavPackError::InvalidSubBlockSize {
                what: "int32 info",
                size: data.len(),
            });
        };

        if sent_bits != 0 {
            bail!(WavPackError::Unsupported("extended integers with sent bits"));
        }

        let info = if zeros != 0 {
            Self { shift: zeros as u32, and: 0, or: 0 }
        } else if ones != 0 {
            Self { shift: ones as u32, and: 1, or: 1 }
        } else if dups != 0 {
            Self { shift: dups as u32, and: 1, or: 0 }
        } else {
            Self::default()
        };

        if info.shift > 31 {
            bail!(WavPackError::InvalidSubBlockSize {
                what: "int32 info shift",
                size: info.shift as usize,
            });
        }
        Ok(info)
    }

    pub fn apply(&self, sample: i32) -> i32 {
        if self.shift == 0 {
            return sample;
        }
        let fill = (sample & self.and) | self.or;
        (sample.wrapping_add(fill) << self.shift).wrapping_sub(fill)
    }
}

/// One parsed sub-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubBlock<'a> {
    /// Function id including the nondecoder bit.
    pub function: u8,
    pub data: &'a [u8],
}

impl SubBlock<'_> {
    pub fn is_optional(&self) -> bool {
        self.function & id::NONDECODER != 0
    }
}

/// Splits a block payload into sub-blocks, which must fill it exactly.
pub fn split_subblocks(payload: &[u8]) -> Result<Vec<SubBlock<'_>>> {
    let mut subblocks = Vec::new();
    let mut rest = payload;

    while !rest.is_empty() {
        let id_byte = rest[0];
        let (words, header_len) = if id_byte & id::LARGE != 0 {
            if rest.len() < 4 {
                bail!(WavPackError::SubBlockOverrun {
                    id: id_byte,
                    size: 4,
                    remaining: rest.len(),
                });
            }
            (u32::from_le_bytes([rest[1], rest[2], rest[3], 0]) as usize, 4)
        } else {
            if rest.len() < 2 {
                bail!(WavPackError::SubBlockOverrun {
                    id: id_byte,
                    size: 2,
                    remaining: rest.len(),
                });
            }
            (rest[1] as usize, 2)
        };

        let padded = words * 2;
        let size = if id_byte & id::ODD_SIZE != 0 {
            if padded == 0 {
                bail!(WavPackError::InvalidSubBlockSize {
                    what: "odd-sized",
                    size: 0,
                });
            }
            padded - 1
        } else {
            padded
        };

        rest = &rest[header_len..];
        if padded > rest.len() {
            bail!(WavPackError::SubBlockOverrun {
                id: id_byte,
                size: padded,
                remaining: rest.len(),
            });
        }

        subblocks.push(SubBlock {
            function: id_byte & id::FUNCTION,
            data: &rest[..size],
        });
        rest = &rest[padded..];
    }

    Ok(subblocks)
}

/// Block contents gathered from its sub-blocks.
#[derive(Debug, Clone, Default)]
pub struct BlockContents<'a> {
    pub passes: Vec<DecorrelationPass>,
    pub entropy: Option<EntropyState>,
    pub bitstream: Option<&'a [u8]>,
    pub extended: ExtendedIntegers,
    /// Total stream channels and WAVE mask.
    pub channel_info: Option<(usize, u32)>,
    pub sample_rate: Option<u32>,
    pub md5: Option<[u8; 16]>,
    /// Functions skipped because they are not understood.
    pub unknown: Vec<u8>,
}

impl<'a> BlockContents<'a> {
    pub fn parse(header: &BlockHeader, payload: &'a [u8]) -> Result<Self> {
        if header.flags & FLAG_HYBRID != 0 {
            bail!(WavPackError::Unsupported("hybrid mode"));
        }
        if header.flags & FLAG_FLOAT != 0 {
            bail!(WavPackError::Unsupported("floating point samples"));
        }

        let stereo = !header.is_mono();
        let channels = if stereo { 2 } else { 1 };
        let mut contents = Self::default();
        let mut have_terms = false;
        let mut have_weights = false;

        for subblock in split_subblocks(payload)? {
            let data = subblock.data;
            trace!("Sub-block {:#04X}, {} bytes", subblock.function, data.len());

            match subblock.function {
                id::DECORR_TERMS => {
                    contents.passes = read_terms(data, stereo)?;
                    have_terms = true;
                }
                id::DECORR_WEIGHTS => {
                    if !have_terms {
                        bail!(WavPackError::DecorrelationTermsMissing);
                    }
                    read_weights(&mut contents.passes, data, stereo)?;
                    have_weights = true;
                }
                id::DECORR_SAMPLES => {
                    if !have_terms {
                        bail!(WavPackError::DecorrelationTermsMissing);
                    }
                    if !have_weights {
                        bail!(WavPackError::DecorrelationWeightsMissing);
                    }
                    read_samples(&mut contents.passes, data, stereo)?;
                }
                id::ENTROPY_VARS => {
                    contents.entropy = Some(EntropyState::from_subblock(data, channels)?);
                }
                id::INT32_INFO => {
                    contents.extended = ExtendedIntegers::from_subblock(data)?;
                }
                id::WV_BITSTREAM => {
                    if contents.entropy.is_none() {
                        bail!(WavPackError::EntropyVariablesMissing);
                    }
                    contents.bitstream = Some(data);
                }
                id::CHANNEL_INFO => {
                    contents.channel_info = Some(read_channel_info(data)?);
                }
                id::SAMPLE_RATE => {
                    let &[b0, b1, b2, ..] = data else {
                        bail!(WavPackError::InvalidSubBlockSize {
                            what: "sample rate",
                            size: data.len(),
                        });
                    };
                    contents.sample_rate = Some(u32::from_le_bytes([b0, b1, b2, 0]));
                }
                id::MD5_CHECKSUM => {
                    let Ok(md5) = <[u8; 16]>::try_from(data) else {
                        bail!(WavPackError::InvalidSubBlockSize {
                            what: "MD5",
                            size: data.len(),
                        });
                    };
                    contents.md5 = Some(md5);
                }
                id::DSD_BLOCK => bail!(WavPackError::Unsupported("DSD audio")),
                id::FLOAT_INFO => bail!(WavPackError::Unsupported("floating point samples")),
                id::HYBRID_PROFILE | id::SHAPING_WEIGHTS | id::WVC_BITSTREAM => {
                    bail!(WavPackError::Unsupported("hybrid mode"))
                }
                id::WVX_BITSTREAM => {
                    bail!(WavPackError::Unsupported("extended integers with sent bits"))
                }
                id::DUMMY
                | id::ENCODER_INFO
                | id::RIFF_HEADER
                | id::RIFF_TRAILER
                | id::ALT_HEADER
                | id::ALT_TRAILER
                | id::CONFIG_BLOCK
                | id::ALT_EXTENSION
                | id::ALT_MD5_CHECKSUM
                | id::NEW_CONFIG
                | id::CHANNEL_IDENTITIES
                | id::BLOCK_CHECKSUM => {}
                function if subblock.is_optional() => {
                    debug!("Skipping optional sub-block {function:#04X}");
                }
                function => contents.unknown.push(function),
            }
        }

        Ok(contents)
    }

    /// Decodes the block into its output channels (one, or two for stereo
    /// and false stereo), verifying the block CRC.
    pub fn decode(&self, header: &BlockHeader) -> Result<Vec<Vec<i32>>> {
        let samples = header.block_samples as usize;
        if samples == 0 {
            return Ok(vec![Vec::new(); header.output_channels()]);
        }

        let (Some(entropy), Some(bitstream)) = (&self.entropy, self.bitstream) else {
            bail!(WavPackError::BitstreamMissing);
        };

        let mut entropy = entropy.clone();
        let mut passes = self.passes.clone();
        let mut reader = LeSliceCursor::from_slice(bitstream);
        let mut crc = u32::MAX;

        // block_samples is untrusted; storage grows with what decodes
        let reserve = samples.min(bitstream.len() * 8 + 1);
        let mut channels = if header.is_mono() {
            let mut mono = Vec::with_capacity(reserve);
            for i in 0..samples {
                let mut sample = entropy.read_word(&mut reader, 0)?;
                for pass in passes.iter_mut().rev() {
                    sample = pass.mono(sample, i & 7);
                }
                crc = crc.wrapping_mul(3).wrapping_add(sample as u32);
                mono.push(sample);
            }
            vec![mono]
        } else {
            let joint = header.flags & FLAG_JOINT_STEREO != 0;
            let mut left = Vec::with_capacity(reserve);
            let mut right = Vec::with_capacity(reserve);
            for i in 0..samples {
                let mut l = entropy.read_word(&mut reader, 0)?;
                let mut r = entropy.read_word(&mut reader, 1)?;
                for pass in passes.iter_mut().rev() {
                    (l, r) = pass.stereo(l, r, i & 7);
                }
                if joint {
                    r = r.wrapping_sub(l >> 1);
                    l = l.wrapping_add(r);
                }
                crc = crc
                    .wrapping_mul(3)
                    .wrapping_add(l as u32)
                    .wrapping_mul(3)
                    .wrapping_add(r as u32);
                left.push(l);
                right.push(r);
            }
            vec![left, right]
        };

        if crc != header.crc {
            bail!(WavPackError::CrcMismatch {
                block_index: header.block_index as u32,
                calculated: crc,
                read: header.crc,
            });
        }

        let shift = header.left_shift();
        for channel in &mut channels {
            for sample in channel.iter_mut() {
                *sample = self.extended.apply(*sample).wrapping_shl(shift);
            }
        }

        if header.flags & FLAG_FALSE_STEREO != 0 {
            let copy = channels[0].clone();
            channels.push(copy);
        }

        Ok(channels)
    }
}

/// Channel count and WAVE mask, with the 12-bit count form for sizes 6 and 7.
fn read_channel_info(data: &[u8]) -> Result<(usize, u32)> {
    let mask_bytes = |bytes: &[u8]| {
        bytes
            .iter()
            .rev()
            .fold(0u32, |mask, &byte| (mask << 8) | byte as u32)
    };

    match data.len() {
        2..=5 => Ok((data[0] as usize, mask_bytes(&data[1..]))),
        6 | 7 => {
            let channels = (data[0] as usize | ((data[2] as usize & 0xF) << 8)) + 1;
            Ok((channels, mask_bytes(&data[3..])))
        }
        size => bail!(WavPackError::InvalidSubBlockSize {
            what: "channel info",
            size,
        }),
    }
}

/// Reads one block header and its payload.
pub fn read_block<R: Read + Seek>(
    reader: &mut BitCursor<R, LittleEndian>,
) -> Result<(BlockHeader, Vec<u8>)> {
    let header = BlockHeader::read(reader)?;
    let payload = reader.read_to_vec(header.payload_len())?;
    trace!(
        "WavPack block {}: {} samples, flags {:#010X}",
        header.block_index, header.block_samples, header.flags
    );
    Ok((header, payload))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Block writer for tests.

    use std::io;

    use bitstream_io::LittleEndian;

    use super::*;
    use crate::structs::wavpack::decorrelation::testing::encode_mono;
    use crate::structs::wavpack::entropy::testing::write_words;
    use crate::structs::wavpack::restore_weight;
    use crate::structs::wavpack::testing::log2_of_power;
    use crate::utils::bitstream_io::testing::BitSink;

    /// Initial medians used by test blocks.
    pub const MEDIAN: u32 = 1024;

    pub fn subblock(function: u8, data: &[u8]) -> Vec<u8> {
        let words = data.len().div_ceil(2);
        let mut id_byte = function;
        if data.len() % 2 == 1 {
            id_byte |= id::ODD_SIZE;
        }

        let mut out = if words > 0xFF {
            id_byte |= id::LARGE;
            let w = (words as u32).to_le_bytes();
            vec![id_byte, w[0], w[1], w[2]]
        } else {
            vec![id_byte, words as u8]
        };
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(0);
        }
        out
    }

    pub fn header_bytes(header: &BlockHeader) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE as usize);
        out.extend_from_slice(b"wvpk");
        out.extend_from_slice(&header.block_size.to_le_bytes());
        out.extend_from_slice(&header.version.to_le_bytes());
        out.push((header.block_index >> 32) as u8);
        let total = header.total_samples.unwrap_or(u32::MAX as u64);
        out.push((total >> 32) as u8);
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(&(header.block_index as u32).to_le_bytes());
        out.extend_from_slice(&header.block_samples.to_le_bytes());
        out.extend_from_slice(&header.flags.to_le_bytes());
        out.extend_from_slice(&header.crc.to_le_bytes());
        out
    }

    /// Assembles a block from a header template and sub-blocks, filling in
    /// the size field.
    pub fn assemble(header: &BlockHeader, subblocks: &[Vec<u8>]) -> Vec<u8> {
        let payload = subblocks.concat();
        let header = BlockHeader {
            block_size: payload.len() as u32 + HEADER_SIZE - 8,
            ..*header
        };
        let mut out = header_bytes(&header);
        out.extend(payload);
        out
    }

    pub fn entropy_subblock(channels: usize) -> Vec<u8> {
        let log = log2_of_power(MEDIAN).to_le_bytes();
        let data: Vec<u8> = (0..3 * channels).flat_map(|_| log).collect();
        subblock(id::ENTROPY_VARS, &data)
    }

    pub fn entropy_state() -> EntropyState {
        EntropyState::with_medians(MEDIAN)
    }

    /// Flags for a lossless integer block at 44.1 kHz.
    pub fn flags(bytes: u32, mono: bool, joint: bool) -> u32 {
        let mut flags = (bytes - 1) | (9 << RATE_LSB) | FLAG_INITIAL_BLOCK | FLAG_FINAL_BLOCK;
        if mono {
            flags |= FLAG_MONO;
        }
        if joint {
            flags |= FLAG_JOINT_STEREO;
        }
        flags
    }

    pub fn mono_crc(samples: &[i32]) -> u32 {
        samples
            .iter()
            .fold(u32::MAX, |crc, &s| crc.wrapping_mul(3).wrapping_add(s as u32))
    }

    pub fn stereo_crc(left: &[i32], right: &[i32]) -> u32 {
        left.iter().zip(right).fold(u32::MAX, |crc, (&l, &r)| {
            crc.wrapping_mul(3)
                .wrapping_add(l as u32)
                .wrapping_mul(3)
                .wrapping_add(r as u32)
        })
    }

    /// Mono block with one decorrelation pass (term, delta, stored weight).
    pub fn mono_block(
        template: &BlockHeader,
        samples: &[i32],
        pass: Option<(i32, i32, i8)>,
        extra: &[Vec<u8>],
    ) -> io::Result<Vec<u8>> {
        let mut subblocks = extra.to_vec();
        let residuals = match pass {
            Some((term, delta, stored)) => {
                let term_byte = ((term + 5) as u8) | ((delta as u8) << 5);
                subblocks.push(subblock(id::DECORR_TERMS, &[term_byte]));
                subblocks.push(subblock(id::DECORR_WEIGHTS, &[stored as u8]));
                let pass = DecorrelationPass {
                    term,
                    delta,
                    weight_a: restore_weight(stored),
                    ..Default::default()
                };
                encode_mono(&pass, samples)
            }
            None => samples.to_vec(),
        };
        subblocks.push(entropy_subblock(1));

        let mut sink = BitSink::<LittleEndian>::new();
        write_words(&mut sink, &entropy_state(), 1, &residuals)?;
        subblocks.push(subblock(id::WV_BITSTREAM, &sink.finish()?));

        let header = BlockHeader {
            block_samples: samples.len() as u32,
            crc: mono_crc(samples),
            ..*template
        };
        Ok(assemble(&header, &subblocks))
    }

    /// Joint-stereo block without decorrelation passes.
    pub fn joint_stereo_block(
        template: &BlockHeader,
        left: &[i32],
        right: &[i32],
        extra: &[Vec<u8>],
    ) -> io::Result<Vec<u8>> {
        let mut coded = Vec::with_capacity(left.len() * 2);
        for (&l, &r) in left.iter().zip(right) {
            let mid = l - r;
            coded.push(mid);
            coded.push(r + (mid >> 1));
        }

        let mut subblocks = extra.to_vec();
        subblocks.push(subblock(id::DECORR_TERMS, &[]));
        subblocks.push(entropy_subblock(2));
        let mut sink = BitSink::<LittleEndian>::new();
        write_words(&mut sink, &entropy_state(), 2, &coded)?;
        subblocks.push(subblock(id::WV_BITSTREAM, &sink.finish()?));

        let header = BlockHeader {
            block_samples: left.len() as u32,
            crc: stereo_crc(left, right),
            flags: template.flags | FLAG_JOINT_STEREO,
            ..*template
        };
        Ok(assemble(&header, &subblocks))
    }

    pub fn template(bytes: u32, mono: bool) -> BlockHeader {
        BlockHeader {
            version: 0x407,
            total_samples: None,
            flags: flags(bytes, mono, false),
            ..Default::default()
        }
    }

    pub use super::id::{
        CHANNEL_INFO, DECORR_SAMPLES, DECORR_TERMS, DECORR_WEIGHTS, INT32_INFO, MD5_CHECKSUM,
        SAMPLE_RATE, WV_BITSTREAM,
    };
}
