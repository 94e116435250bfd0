use std::io::{Read, Seek};

use anyhow::{Result, bail};
use log::{debug, info, trace};

use crate::log_or_err;
use crate::process::{FrameList, PcmReader, Seekable, StreamInfo};
use crate::structs::alac::{
    AlacCookie, MediaHeader, SeekTable, read_co64, read_frame_set, read_stco, read_stsc,
    read_stts,
};
use crate::structs::atom::{AtomHeader, AtomSpan, find_child, find_path, read_payload};
use crate::structs::channel::{alac_layout, reorder};
use crate::utils::bitstream_io::BeCursor;
use crate::utils::errors::{AlacError, AtomError, StreamError};

#[derive(Debug, Clone)]
pub struct AlacState {
    pub fail_level: log::Level,
    pub cookie: AlacCookie,
    pub info: StreamInfo,
    pub seek_table: SeekTable,
    pub total_frames: u64,
    pub remaining_frames: u64,
    /// ALAC channel order to WAVE order.
    pub channel_order: Vec<usize>,
}

/// Decodes ALAC audio from an MP4/M4A container.
///
/// Stream parameters come from `moov/trak/mdia`; the audio itself is read
/// sequentially from the start of `mdat`, one frame set per [`read`].
///
/// [`read`]: PcmReader::read
#[derive(Debug)]
pub struct AlacDecoder<R: Read + Seek> {
    cursor: Option<BeCursor<R>>,
    state: AlacState,
}

/// Maps a missing atom to the codec-level error that names it.
fn require(found: Result<AtomHeader>, missing: AlacError) -> Result<AtomHeader> {
    match found {
        Err(e) if matches!(e.downcast_ref::<AtomError>(), Some(AtomError::NotFound(_))) => {
            Err(missing.into())
        }
        other => other,
    }
}

fn read_seek_table<R: Read + Seek>(
    cursor: &mut BeCursor<R>,
    stbl: AtomSpan,
    total_frames: u64,
) -> Result<SeekTable> {
    let mut table = |tag: &[u8; 4]| -> Result<Option<Vec<u8>>> {
        match find_child(cursor, stbl, tag)? {
            Some(header) => Ok(Some(read_payload(cursor, &header)?)),
            None => Ok(None),
        }
    };

    let Some(stts) = table(b"stts")? else {
        bail!(AlacError::InvalidSeektable("stts atom missing".to_string()));
    };
    let Some(stsc) = table(b"stsc")? else {
        bail!(AlacError::InvalidSeektable("stsc atom missing".to_string()));
    };
    let offsets = match table(b"stco")? {
        Some(stco) => read_stco(&stco)?,
        None => match table(b"co64")? {
            Some(co64) => read_co64(&co64)?,
            None => bail!(AlacError::InvalidSeektable("stco atom missing".to_string())),
        },
    };

    SeekTable::build(&read_stts(&stts)?, &read_stsc(&stsc)?, &offsets, total_frames)
}

impl<R: Read + Seek> AlacDecoder<R> {
    pub fn open(reader: R) -> Result<Self> {
        Self::open_with_fail_level(reader, log::Level::Error)
    }

    /// Opens the stream, treating degradations at or above `fail_level`
    /// as errors.
    pub fn open_with_fail_level(reader: R, fail_level: log::Level) -> Result<Self> {
        let mut cursor = BeCursor::new(reader);

        let mdia = require(
            find_path(&mut cursor, AtomSpan::FILE, &[b"moov", b"trak", b"mdia"]),
            AlacError::MdiaNotFound,
        )?;

        let stsd = require(
            find_path(&mut cursor, mdia.payload_span(), &[b"minf", b"stbl", b"stsd"]),
            AlacError::StsdNotFound,
        )?;
        let cookie = AlacCookie::parse(&read_payload(&mut cursor, &stsd)?)?;

        let mdhd = require(
            find_path(&mut cursor, mdia.payload_span(), &[b"mdhd"]),
            AlacError::MdhdNotFound,
        )?;
        let media_header = MediaHeader::parse(&read_payload(&mut cursor, &mdhd)?)?;
        let total_frames = media_header.duration;

        let mdat = require(
            find_path(&mut cursor, AtomSpan::FILE, &[b"mdat"]),
            AlacError::MdatNotFound,
        )?;
        let audio_start = mdat.payload_start();

        let channels = cookie.channels as usize;
        let (channel_order, channel_mask) = alac_layout(channels);
        let info = StreamInfo {
            sample_rate: cookie.sample_rate,
            bits_per_sample: cookie.bits_per_sample as u32,
            channels,
            channel_mask,
            total_pcm_frames: Some(total_frames),
        };

        let mut state = AlacState {
            fail_level,
            cookie,
            info,
            seek_table: SeekTable::single(audio_start),
            total_frames,
            remaining_frames: total_frames,
            channel_order,
        };

        // stsd sits in minf/stbl, so the sample tables are its siblings
        let stbl = find_path(&mut cursor, mdia.payload_span(), &[b"minf", b"stbl"])?;
        match read_seek_table(&mut cursor, stbl.payload_span(), total_frames) {
            Ok(table) => {
                debug!("ALAC seek table: {} entries", table.entries.len());
                state.seek_table = table;
            }
            Err(e) => log_or_err!(state, log::Level::Warn, e),
        }

        cursor.seek_to_byte(audio_start)?;
        info!("Opened ALAC stream: {}", state.info);

        Ok(Self {
            cursor: Some(cursor),
            state,
        })
    }

    /// Sets the failure level for validation errors.
    ///
    /// - `log::Level::Error`: Only fail on Error level messages (default)
    /// - `log::Level::Warn`: Fail on Warning level and above (strict mode)
    pub fn set_fail_level(&mut self, level: log::Level) {
        self.state.fail_level = level;
    }

    pub fn cookie(&self) -> &AlacCookie {
        &self.state.cookie
    }

    pub fn seek_table(&self) -> &SeekTable {
        &self.state.seek_table
    }

    pub fn remaining_frames(&self) -> u64 {
        self.state.remaining_frames
    }
}

impl<R: Read + Seek> PcmReader for AlacDecoder<R> {
    fn info(&self) -> &StreamInfo {
        &self.state.info
    }

    fn read(&mut self) -> Result<FrameList> {
        let Some(cursor) = self.cursor.as_mut() else {
            bail!(StreamError::Closed);
        };

        let state = &mut self.state;
        if state.remaining_frames == 0 {
            return Ok(FrameList::empty(state.info.channels));
        }

        let channels = read_frame_set(cursor, &state.cookie)?;
        if channels.len() != state.info.channels {
            bail!(AlacError::ChannelMismatch {
                found: channels.len(),
                expected: state.info.channels,
            });
        }

        let mut frames = FrameList::new(reorder(channels, &state.channel_order));
        let decoded = frames.pcm_frames() as u64;
        if decoded > state.remaining_frames {
            let keep = state.remaining_frames as usize;
            for channel in &mut frames.channels {
                channel.truncate(keep);
            }
        }
        state.remaining_frames -= frames.pcm_frames() as u64;
        trace!(
            "ALAC frame set: {} PCM frames, {} remaining",
            frames.pcm_frames(),
            state.remaining_frames
        );

        Ok(frames)
    }

    fn close(&mut self) -> Result<()> {
        self.cursor = None;
        Ok(())
    }
}

impl<R: Read + Seek> Seekable for AlacDecoder<R> {
    fn seek(&mut self, pcm_frame: u64) -> Result<u64> {
        let Some(cursor) = self.cursor.as_mut() else {
            bail!(StreamError::Closed);
        };

        let state = &mut self.state;
        // Without a usable table only a rewind to the start is possible.
        if state.seek_table.degraded && pcm_frame > 0 {
            bail!(AlacError::InvalidSeektable(format!(
                "cannot seek to PCM frame {pcm_frame} without sample tables"
            )));
        }
        let entry = state.seek_table.lookup(pcm_frame.min(state.total_frames));

        cursor.seek_to_byte(entry.byte_offset)?;
        state.remaining_frames = state.total_frames - entry.pcm_frame;
        Ok(entry.pcm_frame)
    }
}
