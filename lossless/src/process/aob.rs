use std::io::{Read, Seek};

use anyhow::{Result, anyhow, bail};
use log::{debug, info, trace};

use crate::log_or_err;
use crate::process::{FrameList, PcmReader, StreamInfo};
use crate::structs::channel::reorder;
use crate::structs::mpeg_ps::{
    MlpFormat, Packet, PcmFormat, PcmHeader, SECTOR_SIZE, decode_group, read_sector,
};
use crate::utils::bitstream_io::BeCursor;
use crate::utils::byte_buffer::ByteBuffer;
use crate::utils::errors::{AobError, StreamError};

#[derive(Debug, Clone)]
pub struct AobState {
    pub fail_level: log::Level,
    pub info: StreamInfo,
    /// Private header of the first PCM packet.
    pub header: PcmHeader,
    pub format: PcmFormat,
    pub sectors: u64,
    finished: bool,
}

/// Substreams seen while scanning a title.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Substreams {
    pub sectors: u64,
    pub pcm_packets: u64,
    pub pcm: Option<PcmHeader>,
    pub mlp_packets: u64,
    pub mlp: Option<MlpFormat>,
}

/// Reads the next whole sector, `None` at a clean end of stream.
fn next_sector<R: Read + Seek>(cursor: &mut BeCursor<R>) -> Result<Option<Vec<u8>>> {
    let at_end = cursor.lookahead(|c| Ok(c.read_unsigned::<u8>(8).is_err()))?;
    if at_end {
        return Ok(None);
    }
    Ok(Some(cursor.read_to_vec(SECTOR_SIZE)?))
}

/// Scans every sector of a title and reports its audio substreams.
pub fn discover_substreams<R: Read + Seek>(reader: R) -> Result<Substreams> {
    let mut cursor = BeCursor::new(reader);
    let mut found = Substreams::default();

    while let Some(sector) = next_sector(&mut cursor)? {
        found.sectors += 1;
        for packet in read_sector(&sector)? {
            match packet {
                Packet::Pcm { header, .. } => {
                    found.pcm_packets += 1;
                    found.pcm = found.pcm.or(Some(header));
                }
                Packet::Mlp { payload } => {
                    found.mlp_packets += 1;
                    if found.mlp.is_none() {
                        found.mlp = MlpFormat::read(&payload)?;
                    }
                }
                Packet::Other { .. } => {}
            }
        }
    }

    debug!(
        "AOB: {} sectors, {} PCM and {} MLP packets",
        found.sectors, found.pcm_packets, found.mlp_packets
    );
    Ok(found)
}

/// Decodes the PCM substream of a DVD-Audio title.
///
/// Payloads are queued in a FIFO because sample groups straddle packet
/// boundaries. Each [`read`](PcmReader::read) pulls sectors until at least
/// one whole group is queued and returns every whole group, reordered to
/// WAVE channel order.
#[derive(Debug)]
pub struct AobPcmDecoder<R: Read + Seek> {
    cursor: Option<BeCursor<R>>,
    state: AobState,
    fifo: ByteBuffer,
}

impl<R: Read + Seek> AobPcmDecoder<R> {
    pub fn open(reader: R) -> Result<Self> {
        Self::open_with_fail_level(reader, log::Level::Error)
    }

    /// Scans up to the first PCM packet. A title carrying only MLP is
    /// reported as [`AobError::MlpUnsupported`].
    pub fn open_with_fail_level(reader: R, fail_level: log::Level) -> Result<Self> {
        let mut cursor = BeCursor::new(reader);
        let mut fifo = ByteBuffer::new();
        let mut sectors = 0u64;
        let mut saw_mlp = false;

        let header = loop {
            let Some(sector) = next_sector(&mut cursor)? else {
                if saw_mlp {
                    bail!(AobError::MlpUnsupported);
                }
                bail!(AobError::NoAudioStream);
            };
            sectors += 1;

            let mut first = None;
            for packet in read_sector(&sector)? {
                match packet {
                    Packet::Pcm { header, payload } => {
                        if let Some(layout) = &first {
                            check_layout(layout, &header)?;
                        } else {
                            first = Some(header);
                        }
                        fifo.push(&payload);
                    }
                    Packet::Mlp { .. } => saw_mlp = true,
                    Packet::Other { .. } => {}
                }
            }
            if let Some(header) = first {
                break header;
            }
        };

        let format = header.format()?;
        let info = StreamInfo {
            sample_rate: format.sample_rate,
            bits_per_sample: format.bits_per_sample,
            channels: format.channels(),
            channel_mask: format.assignment.mask,
            total_pcm_frames: None,
        };
        info!("Opened AOB PCM stream: {info}");
        debug!(
            "AOB channel assignment {}, groups {:?}",
            header.assignment, format.assignment.groups
        );

        Ok(Self {
            cursor: Some(cursor),
            state: AobState {
                fail_level,
                info,
                header,
                format,
                sectors,
                finished: false,
            },
            fifo,
        })
    }

    /// Sets the failure level for validation errors.
    ///
    /// - `log::Level::Error`: Only fail on Error level messages (default)
    /// - `log::Level::Warn`: Fail on Warning level and above (strict mode)
    pub fn set_fail_level(&mut self, level: log::Level) {
        self.state.fail_level = level;
    }

    pub fn format(&self) -> &PcmFormat {
        &self.state.format
    }
}

fn check_layout(expected: &PcmHeader, header: &PcmHeader) -> Result<()> {
    if !expected.same_layout(header) {
        bail!(AobError::Unsupported("PCM format change inside a title"));
    }
    Ok(())
}

/// Queues the PCM payloads of one sector.
fn push_sector(sector: &[u8], state: &mut AobState, fifo: &mut ByteBuffer) -> Result<()> {
    state.sectors += 1;
    for packet in read_sector(sector)? {
        match packet {
            Packet::Pcm { header, payload } => {
                check_layout(&state.header, &header)?;
                trace!(
                    "AOB sector {}: {} PCM bytes, continuity {}",
                    state.sectors,
                    payload.len(),
                    header.continuity
                );
                fifo.push(&payload);
            }
            Packet::Mlp { .. } => trace!("AOB sector {}: MLP packet skipped", state.sectors),
            Packet::Other { .. } => {}
        }
    }
    Ok(())
}

impl<R: Read + Seek> PcmReader for AobPcmDecoder<R> {
    fn info(&self) -> &StreamInfo {
        &self.state.info
    }

    fn read(&mut self) -> Result<FrameList> {
        let Some(cursor) = self.cursor.as_mut() else {
            bail!(StreamError::Closed);
        };

        let state = &mut self.state;
        let group_bytes = state.format.group_bytes();
        while self.fifo.len() < group_bytes && !state.finished {
            match next_sector(cursor)? {
                Some(sector) => push_sector(&sector, state, &mut self.fifo)?,
                None => state.finished = true,
            }
        }

        let channels = state.info.channels;
        if self.fifo.len() < group_bytes {
            let trailing = self.fifo.skip(self.fifo.len());
            if trailing > 0 {
                log_or_err!(
                    state,
                    log::Level::Warn,
                    anyhow!("AOB stream ends with {trailing} bytes of a partial sample group")
                );
            }
            return Ok(FrameList::empty(channels));
        }

        let groups = self.fifo.len() / group_bytes;
        let mut decoded = vec![Vec::with_capacity(groups * 2); channels];
        let mut group = vec![0u8; group_bytes];
        for _ in 0..groups {
            self.fifo.pop(&mut group);
            for (all, samples) in decoded.iter_mut().zip(decode_group(&group, &state.format)) {
                all.extend(samples);
            }
        }

        Ok(FrameList::new(reorder(decoded, state.format.assignment.order)))
    }

    fn close(&mut self) -> Result<()> {
        self.cursor = None;
        self.fifo.reset();
        Ok(())
    }
}
