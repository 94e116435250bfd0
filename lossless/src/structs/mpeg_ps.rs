//! MPEG-2 program stream sectors as used by DVD-Audio `.AOB` files.
//!
//! Every 2048-byte sector starts with a pack header and is filled with PES
//! packets. Audio travels in private stream 1, where a substream id selects
//! PCM or MLP. PCM packets carry a private header describing the channel
//! groups, followed by big-endian sample data that may split sample groups
//! across packets.

use anyhow::{Result, bail};
use log::trace;

use crate::structs::channel::{AobAssignment, aob_assignment};
use crate::utils::bitstream_io::BeSliceCursor;
use crate::utils::errors::AobError;

pub const SECTOR_SIZE: usize = 2048;
pub const PACK_START_CODE: u32 = 0x0000_01BA;
const PACKET_START_PREFIX: u32 = 0x00_0001;

pub const SYSTEM_HEADER: u8 = 0xBB;
pub const PRIVATE_STREAM_1: u8 = 0xBD;
pub const PADDING_STREAM: u8 = 0xBE;

pub const SUBSTREAM_PCM: u8 = 0xA0;
pub const SUBSTREAM_MLP: u8 = 0xA1;

/// PCM frames per sample group.
pub const FRAMES_PER_GROUP: usize = 2;

/// Fixed part of the PCM private header after its length byte.
const PCM_HEADER_FIELDS: usize = 8;

fn bits_from_code(code: u8) -> Result<u32> {
    Ok(match code {
        0 => 16,
        1 => 20,
        2 => 24,
        other => bail!(AobError::InvalidBitsPerSample(other)),
    })
}

fn rate_from_code(code: u8) -> Result<u32> {
    Ok(match code {
        0 => 48000,
        1 => 96000,
        2 => 192000,
        8 => 44100,
        9 => 88200,
        10 => 176400,
        other => bail!(AobError::InvalidSampleRate(other)),
    })
}

/// Private header of a PCM substream packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmHeader {
    pub continuity: u8,
    pub first_access_unit: u16,
    pub group1_bits: u8,
    pub group2_bits: u8,
    pub group1_rate: u8,
    pub group2_rate: u8,
    pub assignment: u8,
    pub cci: u8,
}

/// Sample layout derived from a [`PcmHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub bits_per_sample: u32,
    pub sample_rate: u32,
    pub assignment: &'static AobAssignment,
}

impl PcmFormat {
    pub fn channels(&self) -> usize {
        self.assignment.channels()
    }

    /// Bytes of one sample group.
    pub fn group_bytes(&self) -> usize {
        FRAMES_PER_GROUP * self.channels() * (self.bits_per_sample / 8) as usize
    }
}

impl PcmHeader {
    /// Reads the header following the substream id and returns it with the
    /// number of bytes it occupies.
    fn read(data: &[u8]) -> Result<(Self, usize)> {
        let mut reader = BeSliceCursor::from_slice(data);
        let continuity = reader.read_unsigned::<u8>(8)?;
        let first_access_unit = reader.read_unsigned::<u16>(16)?;
        let length = reader.read_unsigned::<u8>(8)? as usize;
        if length < PCM_HEADER_FIELDS {
            bail!(AobError::InvalidPcmHeader("private header shorter than 8 bytes"));
        }
        if 4 + length > data.len() {
            bail!(AobError::InvalidPcmHeader("private header overruns the packet"));
        }

        reader.skip_bits(8)?;
        let group1_bits = reader.read_unsigned::<u8>(4)?;
        let group2_bits = reader.read_unsigned::<u8>(4)?;
        let group1_rate = reader.read_unsigned::<u8>(4)?;
        let group2_rate = reader.read_unsigned::<u8>(4)?;
        reader.skip_bits(8)?;
        let assignment = reader.read_unsigned::<u8>(8)?;
        reader.skip_bits(8)?;
        let cci = reader.read_unsigned::<u8>(8)?;

        let header = Self {
            continuity,
            first_access_unit,
            group1_bits,
            group2_bits,
            group1_rate,
            group2_rate,
            assignment,
            cci,
        };
        Ok((header, 4 + length))
    }

    pub fn format(&self) -> Result<PcmFormat> {
        let Some(assignment) = aob_assignment(self.assignment) else {
            bail!(AobError::InvalidChannelAssignment(self.assignment));
        };

        let bits_per_sample = bits_from_code(self.group1_bits)?;
        let sample_rate = rate_from_code(self.group1_rate)?;
        if assignment.groups.1 > 0 {
            if bits_from_code(self.group2_bits)? != bits_per_sample {
                bail!(AobError::Unsupported("channel groups with different bit depths"));
            }
            if rate_from_code(self.group2_rate)? != sample_rate {
                bail!(AobError::Unsupported("channel groups with different sample rates"));
            }
        }
        if bits_per_sample == 20 {
            bail!(AobError::Unsupported("20-bit samples"));
        }

        Ok(PcmFormat {
            bits_per_sample,
            sample_rate,
            assignment,
        })
    }

    /// True when both headers describe the same sample layout.
    pub fn same_layout(&self, other: &Self) -> bool {
        (self.group1_bits, self.group2_bits, self.group1_rate, self.group2_rate, self.assignment)
            == (
                other.group1_bits,
                other.group2_bits,
                other.group1_rate,
                other.group2_rate,
                other.assignment,
            )
    }
}

/// One PES packet of a sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Pcm { header: PcmHeader, payload: Vec<u8> },
    /// MLP access units are passed through undecoded.
    Mlp { payload: Vec<u8> },
    Other { stream_id: u8, substream: Option<u8> },
}

fn read_pack_header(reader: &mut BeSliceCursor) -> Result<()> {
    let start = reader.read_unsigned::<u32>(32)?;
    if start != PACK_START_CODE {
        bail!(AobError::InvalidPackHeader(start));
    }
    if reader.read_unsigned::<u8>(2)? != 0b01 {
        bail!(AobError::Unsupported("MPEG-1 pack header"));
    }
    // SCR and mux rate
    reader.skip_bits(6 + 8 * 8)?;
    reader.skip_bits(5)?;
    let stuffing = reader.read_unsigned::<u8>(3)?;
    reader.skip_bytes(u64::from(stuffing))?;
    Ok(())
}

fn read_private_stream(body: &[u8]) -> Result<Packet> {
    let Some(&header_len) = body.get(2) else {
        bail!(AobError::InvalidPcmHeader("truncated PES header"));
    };
    let start = 3 + header_len as usize;
    let Some((&substream, data)) = body.get(start..).and_then(|rest| rest.split_first()) else {
        bail!(AobError::InvalidPcmHeader("missing substream id"));
    };

    Ok(match substream {
        SUBSTREAM_PCM => {
            let (header, used) = PcmHeader::read(data)?;
            Packet::Pcm {
                header,
                payload: data[used..].to_vec(),
            }
        }
        SUBSTREAM_MLP => Packet::Mlp {
            payload: data.to_vec(),
        },
        other => Packet::Other {
            stream_id: PRIVATE_STREAM_1,
            substream: Some(other),
        },
    })
}

/// Parses the pack header and every PES packet of one sector.
pub fn read_sector(sector: &[u8]) -> Result<Vec<Packet>> {
    let mut reader = BeSliceCursor::from_slice(sector);
    read_pack_header(&mut reader)?;

    let mut packets = Vec::new();
    loop {
        let position = reader.byte_position()? as usize;
        if sector.len() - position < 6 {
            break;
        }

        let prefix = reader.read_unsigned::<u32>(24)?;
        if prefix != PACKET_START_PREFIX {
            bail!(AobError::InvalidPacketStartCode(prefix));
        }
        let stream_id = reader.read_unsigned::<u8>(8)?;
        let length = reader.read_unsigned::<u16>(16)? as usize;
        let body_start = position + 6;
        if body_start + length > sector.len() {
            bail!(AobError::PacketOverrun {
                length,
                sector: sector.len(),
            });
        }

        let body = &sector[body_start..body_start + length];
        trace!("PES stream {stream_id:#04X}, {length} bytes at {position}");
        packets.push(match stream_id {
            PRIVATE_STREAM_1 => read_private_stream(body)?,
            other => Packet::Other {
                stream_id: other,
                substream: None,
            },
        });
        reader.skip_bytes(length as u64)?;
    }

    Ok(packets)
}

/// Decodes one sample group into per-channel samples in stream order.
pub fn decode_group(group: &[u8], format: &PcmFormat) -> Vec<Vec<i32>> {
    let channels = format.channels();
    let mut out = vec![Vec::with_capacity(FRAMES_PER_GROUP); channels];
    let samples = FRAMES_PER_GROUP * channels;

    match format.bits_per_sample {
        16 => {
            for (i, pair) in group.chunks_exact(2).take(samples).enumerate() {
                out[i % channels].push(i32::from(i16::from_be_bytes([pair[0], pair[1]])));
            }
        }
        _ => {
            let (high, low) = group.split_at(samples * 2);
            for (i, (pair, &lsb)) in high.chunks_exact(2).zip(low).enumerate() {
                let msb = i32::from(i16::from_be_bytes([pair[0], pair[1]]));
                out[i % channels].push((msb << 8) | i32::from(lsb));
            }
        }
    }
    out
}

/// MLP major sync word as carried in DVD-Audio titles.
pub const MLP_MAJOR_SYNC: u32 = 0xF8_72_6F_BB;

/// Format fields of an MLP major sync. MLP audio itself is not decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MlpFormat {
    pub bits_per_sample: u32,
    pub sample_rate: u32,
    pub channel_assignment: u8,
}

impl MlpFormat {
    /// Parses the major sync at the start of an MLP access unit, `None`
    /// when the access unit has none.
    pub fn read(access_unit: &[u8]) -> Result<Option<Self>> {
        let mut reader = BeSliceCursor::from_slice(access_unit);
        // check nibble, access unit length, input timing
        if reader.skip_bits(32).is_err() {
            return Ok(None);
        }
        match reader.read_unsigned::<u32>(32) {
            Ok(MLP_MAJOR_SYNC) => {}
            _ => return Ok(None),
        }

        let group1_bits = reader.read_unsigned::<u8>(4)?;
        reader.skip_bits(4)?;
        let group1_rate = reader.read_unsigned::<u8>(4)?;
        // group 2 rate, reserved, multichannel type, reserved
        reader.skip_bits(4 + 4 + 4 + 3)?;
        let channel_assignment = reader.read_unsigned::<u8>(5)?;

        Ok(Some(Self {
            bits_per_sample: bits_from_code(group1_bits)?,
            sample_rate: rate_from_code(group1_rate)?,
            channel_assignment,
        }))
    }
}
