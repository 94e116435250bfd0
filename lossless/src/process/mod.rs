use std::fmt::Display;

use anyhow::Result;

/// Apple Lossless from an MP4/M4A container.
///
/// Provides [`AlacDecoder`](alac::AlacDecoder), which walks the atom tree once
/// at open and then decodes one frame set per read, with seek support when the
/// sample tables are consistent.
pub mod alac;

/// DVD-Audio AOB demultiplexing.
///
/// Provides [`AobPcmDecoder`](aob::AobPcmDecoder) for the PCM substream of a
/// title set, plus substream discovery that recognizes MLP.
pub mod aob;

/// Shorten (`ajkg`) streams.
pub mod shorten;

/// True Audio (`TTA1`) streams, with seek-table based seeking.
pub mod tta;

/// WavPack (`wvpk`) lossless integer streams.
pub mod wavpack;

/// Stream metadata fixed when a decoder is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub bits_per_sample: u32,
    pub channels: usize,
    /// WAVE `dwChannelMask`; 0 when the layout is undefined.
    pub channel_mask: u32,
    pub total_pcm_frames: Option<u64>,
}

impl StreamInfo {
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.total_pcm_frames, self.sample_rate) {
            (Some(total), rate) if rate > 0 => Some(total as f64 / rate as f64),
            _ => None,
        }
    }
}

impl Display for StreamInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} Hz, {} bit, {} ch (mask {:#X})",
            self.sample_rate, self.bits_per_sample, self.channels, self.channel_mask
        )?;
        if let Some(total) = self.total_pcm_frames {
            write!(f, ", {total} frames")?;
        }
        Ok(())
    }
}

/// One decoded batch: per-channel sample arrays of equal length.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameList {
    pub channels: Vec<Vec<i32>>,
}

impl FrameList {
    pub fn new(channels: Vec<Vec<i32>>) -> Self {
        debug_assert!(channels.windows(2).all(|w| w[0].len() == w[1].len()));
        Self { channels }
    }

    pub fn empty(channels: usize) -> Self {
        Self {
            channels: vec![Vec::new(); channels],
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn pcm_frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.pcm_frames() == 0
    }

    /// Drops the first `n` PCM frames of every channel.
    pub fn skip_frames(&mut self, n: usize) {
        for channel in &mut self.channels {
            channel.drain(..n.min(channel.len()));
        }
    }

    /// Samples in frame-major order.
    pub fn interleave(&self) -> Vec<i32> {
        let frames = self.pcm_frames();
        let mut out = Vec::with_capacity(frames * self.channels.len());
        for i in 0..frames {
            out.extend(self.channels.iter().map(|channel| channel[i]));
        }
        out
    }

    /// Interleaved little-endian PCM as WAVE stores it; 8-bit samples are
    /// written unsigned.
    pub fn to_le_bytes(&self, bits_per_sample: u32) -> Vec<u8> {
        let bytes = bits_per_sample.div_ceil(8) as usize;
        let samples = self.interleave();
        let mut out = Vec::with_capacity(samples.len() * bytes);
        for sample in samples {
            if bytes == 1 {
                out.push((sample as u8) ^ 0x80);
            } else {
                out.extend_from_slice(&sample.to_le_bytes()[..bytes]);
            }
        }
        out
    }
}

/// A decoder producing PCM batches from an opened stream.
pub trait PcmReader {
    fn info(&self) -> &StreamInfo;

    /// Decodes the next unit. An empty batch signals the end of the stream.
    fn read(&mut self) -> Result<FrameList>;

    /// Releases the source. Later reads fail with `StreamError::Closed`.
    fn close(&mut self) -> Result<()>;
}

/// Decoders that can reposition to a PCM frame.
pub trait Seekable {
    /// Seeks to the nearest seek point at or before `pcm_frame` and returns
    /// the PCM frame decoding resumes from.
    fn seek(&mut self, pcm_frame: u64) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleave_and_bytes() {
        let frames = FrameList::new(vec![vec![1, -2], vec![0x123456, -1]]);
        assert_eq!(frames.pcm_frames(), 2);
        assert_eq!(frames.interleave(), [1, 0x123456, -2, -1]);
        assert_eq!(
            frames.to_le_bytes(24),
            [1, 0, 0, 0x56, 0x34, 0x12, 0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            FrameList::new(vec![vec![-128, 127]]).to_le_bytes(8),
            [0x00, 0xFF]
        );
    }

    #[test]
    fn skip_and_empty() {
        let mut frames = FrameList::new(vec![vec![1, 2, 3], vec![4, 5, 6]]);
        frames.skip_frames(2);
        assert_eq!(frames.channels, [vec![3], vec![6]]);
        frames.skip_frames(5);
        assert!(frames.is_empty());
        assert!(FrameList::empty(2).is_empty());
    }

    #[test]
    fn duration() {
        let info = StreamInfo {
            sample_rate: 44100,
            bits_per_sample: 16,
            channels: 2,
            channel_mask: 0x3,
            total_pcm_frames: Some(88200),
        };
        assert_eq!(info.duration_seconds(), Some(2.0));
        assert_eq!(
            info.to_string(),
            "44100 Hz, 16 bit, 2 ch (mask 0x3), 88200 frames"
        );
    }
}
