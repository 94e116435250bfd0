use std::io::{Read, Seek};

use anyhow::{Result, bail};
use log::{debug, info, trace};

use crate::process::{FrameList, PcmReader, Seekable, StreamInfo};
use crate::structs::channel::default_mask;
use crate::structs::tta::{HEADER_SIZE, SeekTable, TtaHeader, decode_frame};
use crate::utils::bitstream_io::LeCursor;
use crate::utils::errors::StreamError;

#[derive(Debug, Clone)]
pub struct TtaState {
    pub header: TtaHeader,
    pub info: StreamInfo,
    pub seek_table: SeekTable,
    /// Byte offset of the first frame.
    pub audio_start: u64,
    pub next_frame: usize,
}

/// Decodes True Audio streams one frame per [`read`](PcmReader::read).
#[derive(Debug)]
pub struct TtaDecoder<R: Read + Seek> {
    cursor: Option<LeCursor<R>>,
    state: TtaState,
}

impl<R: Read + Seek> TtaDecoder<R> {
    pub fn open(reader: R) -> Result<Self> {
        let mut cursor = LeCursor::new(reader);
        let header = TtaHeader::read(&mut cursor)?;
        let seek_table = SeekTable::read(&mut cursor, &header)?;
        debug!(
            "TTA: {} frames of {} samples",
            header.frame_count(),
            header.frame_length()
        );

        let channels = usize::from(header.channels);
        let info = StreamInfo {
            sample_rate: header.sample_rate,
            bits_per_sample: u32::from(header.bits_per_sample),
            channels,
            channel_mask: default_mask(channels),
            total_pcm_frames: Some(u64::from(header.total_samples)),
        };
        info!("Opened TTA stream: {info}");

        let audio_start = HEADER_SIZE + seek_table.byte_len();
        Ok(Self {
            cursor: Some(cursor),
            state: TtaState {
                header,
                info,
                seek_table,
                audio_start,
                next_frame: 0,
            },
        })
    }

    pub fn header(&self) -> &TtaHeader {
        &self.state.header
    }
}

impl<R: Read + Seek> PcmReader for TtaDecoder<R> {
    fn info(&self) -> &StreamInfo {
        &self.state.info
    }

    fn read(&mut self) -> Result<FrameList> {
        let Some(cursor) = self.cursor.as_mut() else {
            bail!(StreamError::Closed);
        };

        let state = &mut self.state;
        let index = state.next_frame;
        if index >= state.seek_table.frame_sizes.len() {
            return Ok(FrameList::empty(state.info.channels));
        }

        let offset = state.audio_start + state.seek_table.frame_offsets[index];
        let size = state.seek_table.frame_sizes[index] as usize;
        cursor.seek_to_byte(offset)?;
        let frame = cursor.read_to_vec(size)?;

        let samples = state.header.frame_samples(index);
        let channels = decode_frame(&frame, &state.header, index, samples)?;
        state.next_frame += 1;
        trace!("TTA frame {index} at byte {offset}: {samples} samples");

        Ok(FrameList::new(channels))
    }

    fn close(&mut self) -> Result<()> {
        self.cursor = None;
        Ok(())
    }
}

impl<R: Read + Seek> Seekable for TtaDecoder<R> {
    fn seek(&mut self, pcm_frame: u64) -> Result<u64> {
        if self.cursor.is_none() {
            bail!(StreamError::Closed);
        }

        let state = &mut self.state;
        let length = u64::from(state.header.frame_length());
        let frames = state.seek_table.frame_sizes.len() as u64;
        let index = (pcm_frame / length).min(frames);
        state.next_frame = index as usize;
        debug!("TTA seek to {pcm_frame}: frame {index}");

        Ok((index * length).min(u64::from(state.header.total_samples)))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::structs::tta::FORMAT_PCM;
    use crate::structs::tta::testing::encode_stream;
    use crate::utils::errors::TtaError;

    // 245 Hz gives 256-sample frames
    fn header(channels: u16, total_samples: u32) -> TtaHeader {
        TtaHeader {
            format: FORMAT_PCM,
            channels,
            bits_per_sample: 16,
            sample_rate: 245,
            total_samples,
        }
    }

    fn pcm(channels: u16, total: usize) -> Vec<Vec<i32>> {
        (0..channels as i32)
            .map(|c| {
                (0..total as i32)
                    .map(|i| ((i * 53 + c * 7) % 211 - 105) * (c + 1) * 40)
                    .collect()
            })
            .collect()
    }

    fn decode_all<D: PcmReader>(decoder: &mut D) -> Result<Vec<Vec<i32>>> {
        let mut out = vec![Vec::new(); decoder.info().channels];
        loop {
            let frames = decoder.read()?;
            if frames.is_empty() {
                return Ok(out);
            }
            for (all, channel) in out.iter_mut().zip(frames.channels) {
                all.extend(channel);
            }
        }
    }

    #[test]
    fn decodes_every_frame() -> Result<()> {
        let header = header(2, 600);
        let pcm = pcm(2, 600);
        let mut decoder = TtaDecoder::open(Cursor::new(encode_stream(&header, &pcm)?))?;

        assert_eq!(
            *decoder.info(),
            StreamInfo {
                sample_rate: 245,
                bits_per_sample: 16,
                channels: 2,
                channel_mask: 0x3,
                total_pcm_frames: Some(600),
            }
        );
        assert_eq!(decoder.header().frame_count(), 3);
        assert_eq!(decode_all(&mut decoder)?, pcm);

        decoder.close()?;
        assert!(decoder.read().is_err());
        Ok(())
    }

    #[test]
    fn seeks_to_frame_boundaries() -> Result<()> {
        let header = header(1, 600);
        let pcm = pcm(1, 600);
        let mut decoder = TtaDecoder::open(Cursor::new(encode_stream(&header, &pcm)?))?;

        assert_eq!(decoder.seek(300)?, 256);
        assert_eq!(decoder.read()?.channels[0], pcm[0][256..512]);

        assert_eq!(decoder.seek(0)?, 0);
        assert_eq!(decoder.read()?.channels[0], pcm[0][..256]);

        assert_eq!(decoder.seek(10_000)?, 600);
        assert!(decoder.read()?.is_empty());
        Ok(())
    }

    #[test]
    fn corrupt_frame_fails_its_crc() -> Result<()> {
        let header = header(1, 300);
        let mut stream = encode_stream(&header, &pcm(1, 300))?;
        let first_frame = (HEADER_SIZE + 2 * 4 + 4) as usize;
        stream[first_frame + 3] ^= 0x10;

        let mut decoder = TtaDecoder::open(Cursor::new(stream))?;
        let err = decoder.read().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TtaError>(),
            Some(TtaError::CrcMismatch { .. })
        ));
        // the next frame is still reachable
        decoder.seek(256)?;
        assert_eq!(decoder.read()?.pcm_frames(), 44);
        Ok(())
    }
}
