//! Adaptive residual decoder.
//!
//! Each residual is a unary "ones count" selecting a band between running
//! medians, a truncated-binary offset inside the band and a sign bit. When
//! both channels' first medians are tiny, a gamma-coded run of zeros may
//! replace individual residuals.

use std::io::{Read, Seek};

use anyhow::{Result, bail};
use bitstream_io::LittleEndian;

use super::exp2u;
use crate::utils::bitstream_io::BitCursor;
use crate::utils::errors::WavPackError;

/// Ones counts at or above this are followed by a biased extension.
const LIMIT_ONES: u32 = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntropyState {
    /// Three running medians per channel.
    pub medians: [[u32; 3]; 2],
    zeros: u32,
    holding_one: bool,
    holding_zero: bool,
}

fn median_divisor(index: usize) -> u32 {
    128 >> index
}

impl EntropyState {
    /// Parses the entropy-variables sub-block: three log medians per channel.
    pub fn from_subblock(data: &[u8], channels: usize) -> Result<Self> {
        if data.len() != 6 * channels {
            bail!(WavPackError::InvalidSubBlockSize {
                what: "entropy variables",
                size: data.len(),
            });
        }

        let mut state = Self::default();
        let mut words = data
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
        for channel in state.medians.iter_mut().take(channels) {
            for median in channel.iter_mut() {
                *median = words.next().map_or(0, exp2u);
            }
        }

        Ok(state)
    }

    /// A fresh state with every median set to `median`.
    pub fn with_medians(median: u32) -> Self {
        Self {
            medians: [[median; 3]; 2],
            ..Default::default()
        }
    }

    fn get_median(&self, channel: usize, index: usize) -> u32 {
        (self.medians[channel][index] >> 4) + 1
    }

    fn inc_median(&mut self, channel: usize, index: usize) {
        let div = median_divisor(index);
        let median = &mut self.medians[channel][index];
        *median = median.wrapping_add((median.wrapping_add(div) / div) * 5);
    }

    fn dec_median(&mut self, channel: usize, index: usize) {
        let div = median_divisor(index);
        let median = &mut self.medians[channel][index];
        *median = median.wrapping_sub((median.wrapping_add(div - 2) / div) * 2);
    }

    /// Decodes one residual for `channel`.
    pub fn read_word<R: Read + Seek>(
        &mut self,
        reader: &mut BitCursor<R, LittleEndian>,
        channel: usize,
    ) -> Result<i32> {
        if self.medians[0][0] < 2
            && self.medians[1][0] < 2
            && !self.holding_zero
            && !self.holding_one
        {
            if self.zeros > 0 {
                self.zeros -= 1;
                if self.zeros > 0 {
                    return Ok(0);
                }
            } else {
                self.zeros = read_biased(reader)?;
                if self.zeros > 0 {
                    self.medians = [[0; 3]; 2];
                    return Ok(0);
                }
            }
        }

        let ones_count = if self.holding_zero {
            self.holding_zero = false;
            0
        } else {
            let mut raw = match reader.read_limited_unary(false, LIMIT_ONES + 1)? {
                Some(count) => count,
                None => bail!(WavPackError::ResidualOverflow),
            };
            if raw == LIMIT_ONES {
                raw = match raw.checked_add(read_biased(reader)?) {
                    Some(raw) => raw,
                    None => bail!(WavPackError::ResidualOverflow),
                };
            }

            let count = if self.holding_one {
                (raw >> 1) + 1
            } else {
                raw >> 1
            };
            self.holding_one = raw & 1 == 1;
            self.holding_zero = !self.holding_one;
            count
        };

        let (low, range) = match ones_count {
            0 => {
                let range = self.get_median(channel, 0) - 1;
                self.dec_median(channel, 0);
                (0, range)
            }
            1 => {
                let low = self.get_median(channel, 0);
                let range = self.get_median(channel, 1) - 1;
                self.inc_median(channel, 0);
                self.dec_median(channel, 1);
                (low, range)
            }
            2 => {
                let low = self.get_median(channel, 0) + self.get_median(channel, 1);
                let range = self.get_median(channel, 2) - 1;
                self.inc_median(channel, 0);
                self.inc_median(channel, 1);
                self.dec_median(channel, 2);
                (low, range)
            }
            _ => {
                let low = self
                    .get_median(channel, 0)
                    .wrapping_add(self.get_median(channel, 1))
                    .wrapping_add(self.get_median(channel, 2).wrapping_mul(ones_count - 2));
                let range = self.get_median(channel, 2) - 1;
                self.inc_median(channel, 0);
                self.inc_median(channel, 1);
                self.inc_median(channel, 2);
                (low, range)
            }
        };

        let magnitude = low.wrapping_add(read_code(reader, range)?);
        if reader.read_bit()? {
            Ok(!magnitude as i32)
        } else {
            Ok(magnitude as i32)
        }
    }
}

/// Elias-gamma style count: `n` ones, a zero, then the `n - 1` low bits of a
/// value whose top bit is implied.
fn read_biased<R: Read + Seek>(reader: &mut BitCursor<R, LittleEndian>) -> Result<u32> {
    let Some(bits) = reader.read_limited_unary(false, 33)? else {
        bail!(WavPackError::ResidualOverflow);
    };

    match bits {
        0 | 1 => Ok(bits),
        _ => Ok((1 << (bits - 1)) | reader.read_u32(bits - 1)?),
    }
}

/// Truncated binary value in `0..=max`.
fn read_code<R: Read + Seek>(reader: &mut BitCursor<R, LittleEndian>, max: u32) -> Result<u32> {
    if max == 0 {
        return Ok(0);
    }

    let bits = 31 - max.leading_zeros();
    let extras = ((1u64 << (bits + 1)) - max as u64 - 1) as u32;
    let value = reader.read_u32(bits)?;
    if value < extras {
        Ok(value)
    } else {
        let low_bit = reader.read_bit()? as u32;
        Ok((value << 1) - extras + low_bit)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Residual encoder mirroring [`EntropyState::read_word`].

    use std::io;

    use bitstream_io::LittleEndian;

    use super::*;
    use crate::utils::bitstream_io::testing::BitSink;

    struct Word {
        ones_count: u32,
        offset: u32,
        range: u32,
        negative: bool,
    }

    fn write_biased(sink: &mut BitSink<LittleEndian>, value: u32) -> io::Result<()> {
        if value < 2 {
            sink.unary(value, false)?;
        } else {
            let bits = 32 - value.leading_zeros();
            sink.unary(bits, false)?.u(bits - 1, value & ((1 << (bits - 1)) - 1))?;
        }
        Ok(())
    }

    fn write_code(sink: &mut BitSink<LittleEndian>, max: u32, value: u32) -> io::Result<()> {
        if max == 0 {
            return Ok(());
        }
        let bits = 31 - max.leading_zeros();
        let extras = ((1u64 << (bits + 1)) - max as u64 - 1) as u32;
        if value < extras {
            sink.u(bits, value)?;
        } else {
            let coded = value + extras;
            sink.u(bits, coded >> 1)?.bit(coded & 1 == 1)?;
        }
        Ok(())
    }

    /// Encodes `values` (channel-interleaved when `channels == 2`) for an
    /// entropy state starting at `initial`. Zero runs are never produced,
    /// so the medians must stay large enough to keep them disabled.
    pub fn write_words(
        sink: &mut BitSink<LittleEndian>,
        initial: &EntropyState,
        channels: usize,
        values: &[i32],
    ) -> io::Result<()> {
        let mut state = initial.clone();
        let mut words = Vec::with_capacity(values.len());

        for (i, &value) in values.iter().enumerate() {
            let channel = i % channels;
            assert!(
                state.medians[0][0] >= 2 || state.medians[1][0] >= 2,
                "test stream would enter zero-run mode"
            );

            let negative = value < 0;
            let mut magnitude = (if negative { !value } else { value }) as u32;
            let m0 = state.get_median(channel, 0);
            let m1 = state.get_median(channel, 1);
            let m2 = state.get_median(channel, 2);

            let word = if magnitude < m0 {
                state.dec_median(channel, 0);
                Word { ones_count: 0, offset: magnitude, range: m0 - 1, negative }
            } else if magnitude < m0 + m1 {
                state.inc_median(channel, 0);
                state.dec_median(channel, 1);
                Word { ones_count: 1, offset: magnitude - m0, range: m1 - 1, negative }
            } else {
                magnitude -= m0 + m1;
                let ones_count = 2 + magnitude / m2;
                state.inc_median(channel, 0);
                state.inc_median(channel, 1);
                if ones_count == 2 {
                    state.dec_median(channel, 2);
                } else {
                    state.inc_median(channel, 2);
                }
                Word { ones_count, offset: magnitude % m2, range: m2 - 1, negative }
            };
            words.push(word);
        }

        let mut holding_one = false;
        let mut holding_zero = false;
        for (i, word) in words.iter().enumerate() {
            if holding_zero {
                assert_eq!(word.ones_count, 0);
                holding_zero = false;
            } else {
                let base = word.ones_count - holding_one as u32;
                let next_nonzero = words.get(i + 1).is_some_and(|w| w.ones_count > 0);
                let raw = base * 2 + next_nonzero as u32;
                if raw >= LIMIT_ONES {
                    sink.unary(LIMIT_ONES, false)?;
                    write_biased(sink, raw - LIMIT_ONES)?;
                } else {
                    sink.unary(raw, false)?;
                }
                holding_one = next_nonzero;
                holding_zero = !next_nonzero;
            }

            write_code(sink, word.range, word.offset)?;
            sink.bit(word.negative)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bitstream_io::LittleEndian;

    use super::testing::write_words;
    use super::*;
    use crate::utils::bitstream_io::LeSliceCursor;
    use crate::utils::bitstream_io::testing::BitSink;

    #[test]
    fn entropy_subblock_expands_logs() -> Result<()> {
        let data = [0x00, 0x0B, 0x00, 0x09, 0x00, 0x00];
        let state = EntropyState::from_subblock(&data, 1)?;
        assert_eq!(state.medians, [[1024, 256, 0], [0, 0, 0]]);

        let err = EntropyState::from_subblock(&data, 2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WavPackError>(),
            Some(WavPackError::InvalidSubBlockSize { size: 6, .. })
        ));
        Ok(())
    }

    #[test]
    fn truncated_binary_codes() -> Result<()> {
        // max 4: values 0..=2 take two bits, 3 and 4 take three
        let mut sink = BitSink::<LittleEndian>::new();
        sink.u(2, 2)?.u(2, 3)?.bit(false)?.u(2, 3)?.bit(true)?;
        let bytes = sink.finish()?;
        let mut reader = LeSliceCursor::from_slice(&bytes);
        assert_eq!(read_code(&mut reader, 4)?, 2);
        assert_eq!(read_code(&mut reader, 4)?, 3);
        assert_eq!(read_code(&mut reader, 4)?, 4);
        assert_eq!(read_code(&mut reader, 0)?, 0);
        Ok(())
    }

    #[test]
    fn words_decode_across_bands() -> Result<()> {
        let values = [
            0, 5, -7, 64, -65, 200, 1000, -3000, 0, 0, 1, -1, 40000, 17, 0, 3,
        ];
        for channels in [1, 2] {
            let initial = EntropyState::with_medians(1024);
            let mut sink = BitSink::<LittleEndian>::new();
            write_words(&mut sink, &initial, channels, &values)?;
            let bytes = sink.finish()?;

            let mut reader = LeSliceCursor::from_slice(&bytes);
            let mut state = initial.clone();
            let decoded: Vec<i32> = (0..values.len())
                .map(|i| state.read_word(&mut reader, i % channels))
                .collect::<Result<_>>()?;
            assert_eq!(decoded, values);
        }
        Ok(())
    }

    #[test]
    fn zero_run_replaces_residuals() -> Result<()> {
        let mut sink = BitSink::<LittleEndian>::new();
        // run of 3: two ones, zero, low bit 1
        sink.unary(2, false)?.u(1, 1)?;
        // fourth word: ones count 0, empty range, negative
        sink.unary(0, false)?.bit(true)?;
        // fifth word is held at zero: no unary, positive
        sink.bit(false)?;
        let bytes = sink.finish()?;

        let mut reader = LeSliceCursor::from_slice(&bytes);
        let mut state = EntropyState::default();
        let decoded: Vec<i32> = (0..5)
            .map(|_| state.read_word(&mut reader, 0))
            .collect::<Result<_>>()?;
        assert_eq!(decoded, [0, 0, 0, -1, 0]);
        Ok(())
    }

    #[test]
    fn huge_log_medians_wrap_instead_of_overflowing() -> Result<()> {
        let state = EntropyState::from_subblock(&[0x00, 0xFF, 0, 0, 0, 0], 1)?;
        assert_eq!(state.medians[0], [0x4000_0000, 0, 0]);

        // ones count 1, empty range, positive
        let mut sink = BitSink::<LittleEndian>::new();
        sink.unary(2, false)?.bit(false)?;
        let bytes = sink.finish()?;
        let mut reader = LeSliceCursor::from_slice(&bytes);
        let mut state = state;
        assert_eq!(state.read_word(&mut reader, 0)?, 0x0400_0001);

        let mut saturated = EntropyState::with_medians(u32::MAX - 10);
        saturated.inc_median(0, 0);
        saturated.dec_median(0, 1);
        saturated.inc_median(1, 2);
        assert_eq!(saturated.medians, [[u32::MAX - 10; 3]; 2]);
        Ok(())
    }

    #[test]
    fn oversized_ones_extension_is_rejected() -> Result<()> {
        let mut sink = BitSink::<LittleEndian>::new();
        sink.unary(LIMIT_ONES, false)?
            .unary(32, false)?
            .u(31, 0x7FFF_FFFF)?;
        let bytes = sink.finish()?;

        let mut reader = LeSliceCursor::from_slice(&bytes);
        let mut state = EntropyState::with_medians(1024);
        let err = state.read_word(&mut reader, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WavPackError>(),
            Some(WavPackError::ResidualOverflow)
        ));
        Ok(())
    }

    #[test]
    fn seventeen_ones_overflow() -> Result<()> {
        let mut sink = BitSink::<LittleEndian>::new();
        sink.u(17, 0x1FFFF)?;
        let bytes = sink.finish()?;

        let mut reader = LeSliceCursor::from_slice(&bytes);
        let mut state = EntropyState::with_medians(1024);
        let err = state.read_word(&mut reader, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WavPackError>(),
            Some(WavPackError::ResidualOverflow)
        ));
        Ok(())
    }
}
