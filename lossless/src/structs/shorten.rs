//! Shorten stream header, commands and per-channel prediction.
//!
//! Everything after the magic and version byte is coded with Rice-style
//! variable-length integers: a unary run of zeros terminated by a one gives
//! the high part, followed by `n` low bits.

use std::collections::VecDeque;
use std::io::{self, Read, Seek};

use anyhow::{Result, bail};
use bitstream_io::BigEndian;
use log::trace;

use crate::utils::bitstream_io::BitCursor;
use crate::utils::errors::ShortenError;

pub const MAGIC: [u8; 4] = *b"ajkg";
pub const VERSION: u8 = 2;

const COMMAND_WIDTH: u32 = 2;
const ULONG_WIDTH: u32 = 2;
const ENERGY_WIDTH: u32 = 3;
const LPC_ORDER_WIDTH: u32 = 2;
const LPC_QUANT: u32 = 5;
const BITSHIFT_WIDTH: u32 = 2;
const VERBATIM_LEN_WIDTH: u32 = 5;
const VERBATIM_BYTE_WIDTH: u32 = 8;

/// Rounding term added before the QLPC quantizer shift.
const LPC_OFFSET: i32 = 1 << LPC_QUANT;
/// DIFF3 needs three samples of history.
const MIN_HISTORY: usize = 3;

/// Channel state is allocated up front at up to `MAX_MEAN_BLOCKS` means
/// plus `MAX_LPC_ORDER` samples each, so the count is capped.
pub const MAX_CHANNELS: u32 = 256;
const MAX_BLOCK_SIZE: u32 = 65535;
const MAX_LPC_ORDER: u32 = 1024;
const MAX_MEAN_BLOCKS: u32 = 32768;
const MAX_RESIDUAL_WIDTH: u32 = 30;

/// Fixed polynomial predictors for DIFF0..DIFF3.
static FIXED_COEFFICIENTS: [&[i32]; 4] = [&[], &[1], &[2, -1], &[3, -3, 1]];

/// `uvar(n)`: unary high part, `n` low bits.
pub fn read_uvar<R: Read + Seek>(reader: &mut BitCursor<R, BigEndian>, n: u32) -> io::Result<u32> {
    let msb = reader.read_unary(true)?;
    let lsb = reader.read_u32(n)?;
    u32::try_from((u64::from(msb) << n) | u64::from(lsb)).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "Shorten variable-length integer overflows 32 bits",
        )
    })
}

/// `svar(n)`: `uvar(n + 1)` with the sign folded into the low bit.
pub fn read_svar<R: Read + Seek>(reader: &mut BitCursor<R, BigEndian>, n: u32) -> io::Result<i32> {
    let folded = read_uvar(reader, n + 1)?;
    let magnitude = (folded >> 1) as i32;
    Ok(if folded & 1 != 0 { !magnitude } else { magnitude })
}

/// `ulong`: a `uvar` whose width is itself a `uvar(2)`.
pub fn read_ulong<R: Read + Seek>(reader: &mut BitCursor<R, BigEndian>) -> io::Result<u32> {
    let width = read_uvar(reader, ULONG_WIDTH)?;
    read_uvar(reader, width)
}

/// Sample format of the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    S8 = 1,
    U8 = 2,
    S16BigEndian = 3,
    U16BigEndian = 4,
    S16LittleEndian = 5,
    U16LittleEndian = 6,
}

impl FileType {
    pub fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            1 => Self::S8,
            2 => Self::U8,
            3 => Self::S16BigEndian,
            4 => Self::U16BigEndian,
            5 => Self::S16LittleEndian,
            6 => Self::U16LittleEndian,
            other => bail!(ShortenError::UnsupportedFileType(other)),
        })
    }

    pub fn bits_per_sample(self) -> u32 {
        match self {
            Self::S8 | Self::U8 => 8,
            _ => 16,
        }
    }

    /// Subtracted from decoded samples to make them signed.
    pub fn bias(self) -> i32 {
        match self {
            Self::U8 => 0x80,
            Self::U16BigEndian | Self::U16LittleEndian => 0x8000,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortenHeader {
    pub version: u8,
    pub file_type: FileType,
    pub channels: u32,
    /// Samples per channel block until a `BLOCKSIZE` command.
    pub block_size: u32,
    pub max_lpc_order: u32,
    /// Number of previous block means averaged into the DC offset.
    pub mean_blocks: u32,
}

impl ShortenHeader {
    pub fn read<R: Read + Seek>(reader: &mut BitCursor<R, BigEndian>) -> Result<Self> {
        let magic = reader.read_tag()?;
        if magic != MAGIC {
            bail!(ShortenError::InvalidMagic(magic));
        }

        let version = reader.read_unsigned::<u8>(8)?;
        if version != VERSION {
            bail!(ShortenError::UnsupportedVersion(version));
        }

        let file_type = FileType::from_code(read_ulong(reader)?)?;

        let channels = read_ulong(reader)?;
        if channels == 0 || channels > MAX_CHANNELS {
            bail!(ShortenError::InvalidChannelCount(channels));
        }

        let block_size = read_block_size(reader)?;

        let max_lpc_order = read_ulong(reader)?;
        if max_lpc_order > MAX_LPC_ORDER {
            bail!(ShortenError::InvalidLpcOrder {
                order: max_lpc_order,
                max: MAX_LPC_ORDER,
            });
        }

        let mean_blocks = read_ulong(reader)?;
        if mean_blocks > MAX_MEAN_BLOCKS {
            bail!(ShortenError::InvalidMeanCount(mean_blocks));
        }

        let skip = read_ulong(reader)?;
        reader.skip_bytes(u64::from(skip))?;

        Ok(Self {
            version,
            file_type,
            channels,
            block_size,
            max_lpc_order,
            mean_blocks,
        })
    }

    /// Samples of history kept per channel.
    pub fn history_len(&self) -> usize {
        MIN_HISTORY.max(self.max_lpc_order as usize)
    }
}

/// Block size from the header or a `BLOCKSIZE` command.
pub fn read_block_size<R: Read + Seek>(reader: &mut BitCursor<R, BigEndian>) -> Result<u32> {
    let block_size = read_ulong(reader)?;
    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        bail!(ShortenError::InvalidBlockSize(block_size));
    }
    Ok(block_size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Diff0 = 0,
    Diff1 = 1,
    Diff2 = 2,
    Diff3 = 3,
    Quit = 4,
    BlockSize = 5,
    BitShift = 6,
    Qlpc = 7,
    Zero = 8,
    Verbatim = 9,
}

impl Command {
    pub fn read<R: Read + Seek>(reader: &mut BitCursor<R, BigEndian>) -> Result<Self> {
        Ok(match read_uvar(reader, COMMAND_WIDTH)? {
            0 => Self::Diff0,
            1 => Self::Diff1,
            2 => Self::Diff2,
            3 => Self::Diff3,
            4 => Self::Quit,
            5 => Self::BlockSize,
            6 => Self::BitShift,
            7 => Self::Qlpc,
            8 => Self::Zero,
            9 => Self::Verbatim,
            other => bail!(ShortenError::UnknownCommand(other)),
        })
    }

    /// Commands that produce one channel block.
    pub fn is_audio(self) -> bool {
        matches!(
            self,
            Self::Diff0 | Self::Diff1 | Self::Diff2 | Self::Diff3 | Self::Qlpc | Self::Zero
        )
    }
}

/// Payload of a `BITSHIFT` command.
pub fn read_bit_shift<R: Read + Seek>(reader: &mut BitCursor<R, BigEndian>) -> Result<u32> {
    let shift = read_uvar(reader, BITSHIFT_WIDTH)?;
    if shift > 31 {
        bail!(ShortenError::InvalidBitShift(shift));
    }
    Ok(shift)
}

/// Payload of a `VERBATIM` command: raw bytes of the source file.
pub fn read_verbatim<R: Read + Seek>(reader: &mut BitCursor<R, BigEndian>) -> Result<Vec<u8>> {
    let len = read_uvar(reader, VERBATIM_LEN_WIDTH)?;
    let mut bytes = Vec::with_capacity(len.min(1 << 16) as usize);
    for _ in 0..len {
        let value = read_uvar(reader, VERBATIM_BYTE_WIDTH)?;
        let Ok(byte) = u8::try_from(value) else {
            bail!(ShortenError::InvalidVerbatimByte(value));
        };
        bytes.push(byte);
    }
    Ok(bytes)
}

/// `base + Σ c[j] * history[n - 1 - j]` over the most recent samples.
fn predict(history: &[i32], coefficients: &[i32], base: i32) -> i32 {
    let n = history.len();
    coefficients
        .iter()
        .enumerate()
        .fold(base, |sum, (j, &c)| {
            sum.wrapping_add(c.wrapping_mul(history[n - 1 - j]))
        })
}

/// Prediction state carried between the blocks of one channel.
#[derive(Debug, Clone)]
pub struct ChannelState {
    /// Last samples of previous blocks, oldest first.
    history: Vec<i32>,
    /// Means of the most recent blocks, scaled by the bit shift.
    means: VecDeque<i32>,
}

impl ChannelState {
    pub fn new(header: &ShortenHeader) -> Self {
        Self {
            history: vec![0; header.history_len()],
            means: VecDeque::from(vec![0; header.mean_blocks as usize]),
        }
    }

    /// DC offset from the running block means.
    fn offset(&self, bit_shift: u32) -> i32 {
        if self.means.is_empty() {
            return 0;
        }
        let count = self.means.len() as i64;
        let sum = count / 2 + self.means.iter().map(|&m| i64::from(m)).sum::<i64>();
        ((sum / count) as i32) >> bit_shift
    }

    /// History with the offset removed when QLPC predicts around it.
    fn working_history(&self, offset: i32, command: Command) -> Vec<i32> {
        if command == Command::Qlpc {
            self.history.iter().map(|&s| s.wrapping_sub(offset)).collect()
        } else {
            self.history.clone()
        }
    }

    fn finish_block(&mut self, samples: &[i32], bit_shift: u32) {
        if !self.means.is_empty() {
            let n = samples.len() as i64;
            let sum = n / 2 + samples.iter().map(|&s| i64::from(s)).sum::<i64>();
            self.means.pop_front();
            self.means.push_back(((sum / n) as i32).wrapping_shl(bit_shift));
        }

        let keep = self.history.len();
        if samples.len() >= keep {
            self.history.copy_from_slice(&samples[samples.len() - keep..]);
        } else {
            self.history.rotate_left(samples.len());
            self.history[keep - samples.len()..].copy_from_slice(samples);
        }
    }

    /// Decodes one block for an audio command. Samples are returned before
    /// the bit shift and unsigned bias are applied.
    pub fn decode_block<R: Read + Seek>(
        &mut self,
        reader: &mut BitCursor<R, BigEndian>,
        command: Command,
        block_size: usize,
        bit_shift: u32,
    ) -> Result<Vec<i32>> {
        let offset = self.offset(bit_shift);

        let samples = match command {
            Command::Zero => vec![0; block_size],
            Command::Diff0 | Command::Diff1 | Command::Diff2 | Command::Diff3 | Command::Qlpc => {
                let energy = read_uvar(reader, ENERGY_WIDTH)?;
                if energy > MAX_RESIDUAL_WIDTH {
                    bail!(ShortenError::InvalidResidualWidth(energy));
                }

                let qlpc;
                let (coefficients, shift, base) = match command {
                    Command::Qlpc => {
                        let order = read_uvar(reader, LPC_ORDER_WIDTH)?;
                        if order as usize > self.history.len() {
                            bail!(ShortenError::InvalidLpcOrder {
                                order,
                                max: self.history.len() as u32,
                            });
                        }
                        qlpc = (0..order)
                            .map(|_| read_svar(reader, LPC_QUANT))
                            .collect::<io::Result<Vec<_>>>()?;
                        (&qlpc[..], LPC_QUANT, LPC_OFFSET)
                    }
                    Command::Diff0 => (FIXED_COEFFICIENTS[0], 0, offset),
                    _ => (FIXED_COEFFICIENTS[command as usize], 0, 0),
                };

                let mut buf = self.working_history(offset, command);
                let start = buf.len();
                buf.reserve(block_size);
                for _ in 0..block_size {
                    let prediction = predict(&buf, coefficients, base) >> shift;
                    let residual = read_svar(reader, energy)?;
                    buf.push(residual.wrapping_add(prediction));
                }

                let mut samples = buf.split_off(start);
                if command == Command::Qlpc && offset != 0 {
                    for sample in &mut samples {
                        *sample = sample.wrapping_add(offset);
                    }
                }
                samples
            }
            _ => bail!(ShortenError::UnknownCommand(command as u32)),
        };

        trace!("{command:?} block of {block_size} samples, offset {offset}");
        self.finish_block(&samples, bit_shift);
        Ok(samples)
    }
}
