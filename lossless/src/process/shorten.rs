use std::io::{Read, Seek};

use anyhow::{Result, anyhow, bail};
use log::{debug, info, trace};

use crate::log_or_err;
use crate::process::{FrameList, PcmReader, StreamInfo};
use crate::structs::iff::EmbeddedFormat;
use crate::structs::shorten::{
    ChannelState, Command, ShortenHeader, read_bit_shift, read_block_size, read_verbatim,
};
use crate::utils::bitstream_io::BeCursor;
use crate::utils::errors::{ShortenError, StreamError};

const FALLBACK_SAMPLE_RATE: u32 = 44100;

#[derive(Debug, Clone)]
pub struct ShortenState {
    pub fail_level: log::Level,
    pub header: ShortenHeader,
    pub info: StreamInfo,
    pub block_size: usize,
    pub bit_shift: u32,
    pub finished: bool,
}

/// Decodes Shorten streams. Each [`read`](PcmReader::read) returns one
/// block for every channel.
#[derive(Debug)]
pub struct ShortenDecoder<R: Read + Seek> {
    cursor: Option<BeCursor<R>>,
    state: ShortenState,
    channels: Vec<ChannelState>,
}

/// Reads the embedded WAVE/AIFF header when the stream opens with a
/// verbatim section. Without one the cursor is left where it was.
fn sniff_format<R: Read + Seek>(
    cursor: &mut BeCursor<R>,
    state: &ShortenState,
) -> Result<Option<EmbeddedFormat>> {
    let verbatim = cursor.speculate(|c| {
        if Command::read(c)? != Command::Verbatim {
            bail!(ShortenError::InvalidEmbeddedHeader("no leading verbatim section"));
        }
        read_verbatim(c)
    });
    let bytes = match verbatim {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("No embedded header: {e}");
            return Ok(None);
        }
    };

    match EmbeddedFormat::parse(&bytes) {
        Ok(format) if format.channels as u32 == state.header.channels => Ok(Some(format)),
        Ok(format) => {
            log_or_err!(
                state,
                log::Level::Warn,
                anyhow!(
                    "Embedded header declares {} channels, stream has {}",
                    format.channels,
                    state.header.channels
                )
            );
            Ok(None)
        }
        Err(e) => {
            log_or_err!(state, log::Level::Warn, e);
            Ok(None)
        }
    }
}

impl<R: Read + Seek> ShortenDecoder<R> {
    pub fn open(reader: R) -> Result<Self> {
        Self::open_with_fail_level(reader, log::Level::Error)
    }

    pub fn open_with_fail_level(reader: R, fail_level: log::Level) -> Result<Self> {
        let mut cursor = BeCursor::new(reader);
        let header = ShortenHeader::read(&mut cursor)?;
        debug!("Shorten header: {header:?}");

        let mut state = ShortenState {
            fail_level,
            header,
            info: StreamInfo {
                sample_rate: FALLBACK_SAMPLE_RATE,
                bits_per_sample: header.file_type.bits_per_sample(),
                channels: header.channels as usize,
                channel_mask: 0,
                total_pcm_frames: None,
            },
            block_size: header.block_size as usize,
            bit_shift: 0,
            finished: false,
        };

        match sniff_format(&mut cursor, &state)? {
            Some(format) => {
                state.info.sample_rate = format.sample_rate;
                state.info.channel_mask = format.channel_mask;
            }
            None => debug!("Using {FALLBACK_SAMPLE_RATE} Hz and an undefined channel mask"),
        }
        info!("Opened Shorten stream: {}", state.info);

        let channels = (0..header.channels)
            .map(|_| ChannelState::new(&header))
            .collect();
        Ok(Self {
            cursor: Some(cursor),
            state,
            channels,
        })
    }

    /// Sets the failure level for validation errors.
    ///
    /// - `log::Level::Error`: Only fail on Error level messages (default)
    /// - `log::Level::Warn`: Fail on Warning level and above (strict mode)
    pub fn set_fail_level(&mut self, level: log::Level) {
        self.state.fail_level = level;
    }

    pub fn header(&self) -> &ShortenHeader {
        &self.state.header
    }
}

impl<R: Read + Seek> PcmReader for ShortenDecoder<R> {
    fn info(&self) -> &StreamInfo {
        &self.state.info
    }

    fn read(&mut self) -> Result<FrameList> {
        let Some(cursor) = self.cursor.as_mut() else {
            bail!(StreamError::Closed);
        };

        let state = &mut self.state;
        let mut blocks: Vec<Vec<i32>> = Vec::with_capacity(self.channels.len());

        while !state.finished && blocks.len() < self.channels.len() {
            let command = Command::read(cursor)?;
            trace!("Shorten command {command:?}");

            match command {
                audio if audio.is_audio() => {
                    let channel = &mut self.channels[blocks.len()];
                    blocks.push(channel.decode_block(
                        cursor,
                        audio,
                        state.block_size,
                        state.bit_shift,
                    )?);
                }
                Command::BlockSize => {
                    let block_size = read_block_size(cursor)?;
                    if !blocks.is_empty() {
                        bail!(ShortenError::BlockSizeChangeMidGroup);
                    }
                    state.block_size = block_size as usize;
                }
                Command::BitShift => state.bit_shift = read_bit_shift(cursor)?,
                Command::Verbatim => {
                    let bytes = read_verbatim(cursor)?;
                    debug!("Skipped {} verbatim bytes", bytes.len());
                }
                Command::Quit => {
                    state.finished = true;
                    if !blocks.is_empty() {
                        log_or_err!(
                            state,
                            log::Level::Warn,
                            anyhow!(
                                "Shorten stream quits after {} of {} channel blocks",
                                blocks.len(),
                                self.channels.len()
                            )
                        );
                        blocks.clear();
                    }
                }
                _ => bail!(ShortenError::UnknownCommand(command as u32)),
            }
        }

        if blocks.is_empty() {
            return Ok(FrameList::empty(state.info.channels));
        }

        let shift = state.bit_shift;
        let bias = state.header.file_type.bias();
        for block in &mut blocks {
            for sample in block.iter_mut() {
                *sample = sample.wrapping_shl(shift).wrapping_sub(bias);
            }
        }
        Ok(FrameList::new(blocks))
    }

    fn close(&mut self) -> Result<()> {
        self.cursor = None;
        Ok(())
    }
}
