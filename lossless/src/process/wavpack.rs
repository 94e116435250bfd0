use std::io::{Read, Seek};

use anyhow::{Result, bail};
use bitstream_io::LittleEndian;
use log::{debug, info, trace};
use md5::{Digest, Md5};

use crate::log_or_err;
use crate::process::{FrameList, PcmReader, StreamInfo};
use crate::structs::channel::default_mask;
use crate::structs::wavpack::block::{BlockContents, BlockHeader, read_block};
use crate::utils::bitstream_io::BitCursor;
use crate::utils::errors::{StreamError, WavPackError};

#[derive(Debug, Clone)]
pub struct WavPackState {
    pub fail_level: log::Level,
    pub info: StreamInfo,
    /// PCM frames decoded so far.
    pub decoded_frames: u64,
    pub md5: Option<[u8; 16]>,
    hasher: Md5,
    finished: bool,
}

/// Decoded multi-block frame plus the metadata gathered from its blocks.
struct Frame {
    channels: Vec<Vec<i32>>,
    first: BlockHeader,
    channel_info: Option<(usize, u32)>,
    sample_rate: Option<u32>,
}

/// Decodes lossless integer WavPack streams.
///
/// Each [`read`](PcmReader::read) returns one frame: the run of blocks from
/// an initial block through a final block, with the channels of every block
/// concatenated in stream order.
#[derive(Debug)]
pub struct WavPackDecoder<R: Read + Seek> {
    cursor: Option<BitCursor<R, LittleEndian>>,
    state: WavPackState,
    pending: Option<FrameList>,
}

impl<R: Read + Seek> WavPackDecoder<R> {
    pub fn open(reader: R) -> Result<Self> {
        Self::open_with_fail_level(reader, log::Level::Error)
    }

    /// Opens the stream and decodes its first frame to learn the channel
    /// layout. That frame is returned by the first read.
    pub fn open_with_fail_level(reader: R, fail_level: log::Level) -> Result<Self> {
        let mut cursor = BitCursor::new(reader);
        let mut state = WavPackState {
            fail_level,
            info: StreamInfo::default(),
            decoded_frames: 0,
            md5: None,
            hasher: Md5::new(),
            finished: false,
        };

        let Some(frame) = read_frame(&mut cursor, &mut state)? else {
            bail!(WavPackError::BitstreamMissing);
        };

        let channels = frame.channels.len();
        let channel_mask = match frame.channel_info {
            Some((declared, mask)) if declared == channels => mask,
            Some(_) => bail!(WavPackError::InconsistentBlock(
                "channel info disagrees with the block layout"
            )),
            None => default_mask(channels),
        };
        let sample_rate = match frame.first.sample_rate().or(frame.sample_rate) {
            Some(rate) => rate,
            None => bail!(WavPackError::InconsistentBlock(
                "custom sample rate without a sample rate sub-block"
            )),
        };

        state.info = StreamInfo {
            sample_rate,
            bits_per_sample: frame.first.bits_per_sample(),
            channels,
            channel_mask,
            total_pcm_frames: frame.first.total_samples,
        };
        info!("Opened WavPack stream: {}", state.info);

        let mut decoder = Self {
            cursor: Some(cursor),
            state,
            pending: None,
        };
        decoder.pending = Some(decoder.accept(FrameList::new(frame.channels))?);
        Ok(decoder)
    }

    /// Sets the failure level for validation errors.
    ///
    /// - `log::Level::Error`: Only fail on Error level messages (default)
    /// - `log::Level::Warn`: Fail on Warning level and above (strict mode)
    pub fn set_fail_level(&mut self, level: log::Level) {
        self.state.fail_level = level;
    }

    /// Hashes a decoded frame and checks it against the stream layout.
    fn accept(&mut self, frames: FrameList) -> Result<FrameList> {
        let state = &mut self.state;
        if frames.channel_count() != state.info.channels {
            bail!(WavPackError::InconsistentBlock("channel count changed"));
        }

        state.hasher.update(frames.to_le_bytes(state.info.bits_per_sample));
        state.decoded_frames += frames.pcm_frames() as u64;
        Ok(frames)
    }

    /// Verifies the stored MD5 once the stream is exhausted.
    fn finish(&mut self) -> Result<()> {
        let state = &mut self.state;
        if state.finished {
            return Ok(());
        }
        state.finished = true;

        if let Some(total) = state.info.total_pcm_frames {
            if total != state.decoded_frames {
                log_or_err!(
                    state,
                    log::Level::Warn,
                    anyhow::anyhow!(
                        "WavPack stream declares {total} PCM frames, decoded {}",
                        state.decoded_frames
                    )
                );
            }
        }

        if let Some(stored) = state.md5 {
            let calculated: [u8; 16] = std::mem::take(&mut state.hasher).finalize().into();
            if calculated != stored {
                bail!(WavPackError::Md5Mismatch {
                    calculated: hex(&calculated),
                    read: hex(&stored),
                });
            }
            debug!("WavPack MD5 verified");
        }

        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Reads the next block, `None` when the stream ends on a block boundary.
fn next_block<R: Read + Seek>(
    cursor: &mut BitCursor<R, LittleEndian>,
) -> Result<Option<(BlockHeader, Vec<u8>)>> {
    let at_end = cursor.lookahead(|c| Ok(c.read_unsigned::<u8>(8).is_err()))?;
    if at_end {
        return Ok(None);
    }
    read_block(cursor).map(Some)
}

/// Decodes blocks from an initial block through a final block. Blocks
/// without samples are consumed for their metadata.
fn read_frame<R: Read + Seek>(
    cursor: &mut BitCursor<R, LittleEndian>,
    state: &mut WavPackState,
) -> Result<Option<Frame>> {
    let mut frame: Option<Frame> = None;

    loop {
        let start = cursor.byte_position()?;
        let Some((header, payload)) = next_block(cursor)? else {
            if frame.is_some() {
                bail!(WavPackError::InconsistentBlock("stream ends inside a frame"));
            }
            return Ok(None);
        };

        let contents = BlockContents::parse(&header, &payload)?;
        for &function in &contents.unknown {
            log_or_err!(state, log::Level::Warn, WavPackError::UnknownSubBlock(function));
        }
        if let Some(md5) = contents.md5 {
            state.md5 = Some(md5);
        }

        if header.block_samples == 0 {
            debug!("Metadata-only WavPack block at byte {start}");
            continue;
        }

        let channels = contents.decode(&header)?;
        trace!(
            "WavPack block {} at byte {start}: {} channel(s)",
            header.block_index,
            channels.len()
        );

        match frame.as_mut() {
            None => {
                if !header.is_initial() {
                    bail!(WavPackError::InconsistentBlock(
                        "frame does not start with an initial block"
                    ));
                }
                frame = Some(Frame {
                    channels,
                    first: header,
                    channel_info: contents.channel_info,
                    sample_rate: contents.sample_rate,
                });
            }
            Some(frame) => {
                if header.is_initial() {
                    bail!(WavPackError::InconsistentBlock(
                        "initial block before the final block of the previous frame"
                    ));
                }
                if header.block_index != frame.first.block_index
                    || header.block_samples != frame.first.block_samples
                {
                    bail!(WavPackError::InconsistentBlock(
                        "blocks of one frame cover different samples"
                    ));
                }
                frame.channels.extend(channels);
                frame.channel_info = frame.channel_info.or(contents.channel_info);
                frame.sample_rate = frame.sample_rate.or(contents.sample_rate);
            }
        }

        if header.is_final() {
            return Ok(frame);
        }
    }
}

impl<R: Read + Seek> PcmReader for WavPackDecoder<R> {
    fn info(&self) -> &StreamInfo {
        &self.state.info
    }

    fn read(&mut self) -> Result<FrameList> {
        let Some(cursor) = self.cursor.as_mut() else {
            bail!(StreamError::Closed);
        };

        if let Some(frames) = self.pending.take() {
            return Ok(frames);
        }
        if self.state.finished {
            return Ok(FrameList::empty(self.state.info.channels));
        }

        match read_frame(cursor, &mut self.state)? {
            Some(frame) => self.accept(FrameList::new(frame.channels)),
            None => {
                self.finish()?;
                Ok(FrameList::empty(self.state.info.channels))
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.cursor = None;
        self.pending = None;
        Ok(())
    }
}
