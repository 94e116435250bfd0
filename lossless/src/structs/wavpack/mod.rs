//! WavPack 4 block structures.
//!
//! A block is a 32-byte header followed by sub-blocks. Decoding a block
//! runs the entropy decoder ([`entropy`]) sample by sample, feeds each
//! residual through the decorrelation passes ([`decorrelation`]) and
//! finally undoes joint stereo and extended-integer packing ([`block`]).

pub mod block;
pub mod decorrelation;
pub mod entropy;

/// Mantissas for the 8.8 fixed-point log scale used by stored weights,
/// medians and history samples.
static EXP_TABLE: [u8; 256] = [
    0x00, 0x01, 0x01, 0x02, 0x03, 0x03, 0x04, 0x05, 0x06, 0x06, 0x07, 0x08, 0x08, 0x09, 0x0a, 0x0b,
    0x0b, 0x0c, 0x0d, 0x0e, 0x0e, 0x0f, 0x10, 0x10, 0x11, 0x12, 0x13, 0x13, 0x14, 0x15, 0x16, 0x16,
    0x17, 0x18, 0x19, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1d, 0x1e, 0x1f, 0x20, 0x20, 0x21, 0x22, 0x23,
    0x24, 0x24, 0x25, 0x26, 0x27, 0x28, 0x28, 0x29, 0x2a, 0x2b, 0x2c, 0x2c, 0x2d, 0x2e, 0x2f, 0x30,
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x3a, 0x3b, 0x3c, 0x3d,
    0x3e, 0x3f, 0x40, 0x41, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x48, 0x49, 0x4a, 0x4b,
    0x4c, 0x4d, 0x4e, 0x4f, 0x50, 0x51, 0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a,
    0x5b, 0x5c, 0x5d, 0x5e, 0x5e, 0x5f, 0x60, 0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69,
    0x6a, 0x6b, 0x6c, 0x6d, 0x6e, 0x6f, 0x70, 0x71, 0x72, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79,
    0x7a, 0x7b, 0x7c, 0x7d, 0x7e, 0x7f, 0x80, 0x81, 0x82, 0x83, 0x84, 0x85, 0x87, 0x88, 0x89, 0x8a,
    0x8b, 0x8c, 0x8d, 0x8e, 0x8f, 0x90, 0x91, 0x92, 0x93, 0x95, 0x96, 0x97, 0x98, 0x99, 0x9a, 0x9b,
    0x9c, 0x9d, 0x9f, 0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa8, 0xa9, 0xaa, 0xab, 0xac, 0xad,
    0xaf, 0xb0, 0xb1, 0xb2, 0xb3, 0xb4, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xbc, 0xbd, 0xbe, 0xbf, 0xc0,
    0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc8, 0xc9, 0xca, 0xcb, 0xcd, 0xce, 0xcf, 0xd0, 0xd2, 0xd3, 0xd4,
    0xd6, 0xd7, 0xd8, 0xd9, 0xdb, 0xdc, 0xdd, 0xde, 0xe0, 0xe1, 0xe2, 0xe4, 0xe5, 0xe6, 0xe8, 0xe9,
    0xea, 0xec, 0xed, 0xee, 0xf0, 0xf1, 0xf2, 0xf4, 0xf5, 0xf6, 0xf8, 0xf9, 0xfa, 0xfc, 0xfd, 0xff,
];

/// Expands an unsigned 8.8 log value to linear. Large exponents wrap the
/// shift at 32 bits, as stored medians expect.
pub fn exp2u(log: u16) -> u32 {
    let mantissa = 0x100 | EXP_TABLE[(log & 0xFF) as usize] as u32;
    let exponent = u32::from(log >> 8);

    if exponent <= 9 {
        mantissa >> (9 - exponent)
    } else {
        mantissa.wrapping_shl((exponent - 9) & 31)
    }
}

/// Expands a signed 8.8 log value to linear.
pub fn exp2s(log: i16) -> i32 {
    let value = exp2u(log.unsigned_abs()) as i32;
    if log < 0 { value.wrapping_neg() } else { value }
}

/// Expands a stored 8-bit decorrelation weight to the 1024-unit scale.
pub fn restore_weight(stored: i8) -> i32 {
    let weight = (stored as i32) << 3;
    if weight > 0 {
        weight + ((weight + 64) >> 7)
    } else {
        weight
    }
}

/// Little-endian 16-bit words of a sub-block, as signed log values.
fn log_words(data: &[u8]) -> impl Iterator<Item = i16> + '_ {
    data.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
}

#[cfg(test)]
pub(crate) mod testing {
    /// Inverse of [`exp2s`](super::exp2s) for exact powers of two `>= 2`.
    pub fn log2_of_power(value: u32) -> i16 {
        debug_assert!(value.is_power_of_two() && value >= 2);
        ((31 - value.leading_zeros() + 1) << 8) as i16
    }
}
