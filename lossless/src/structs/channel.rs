//! Channel masks and channel order tables.
//!
//! Decoders hand out channels in WAVE order with a `dwChannelMask`-style
//! speaker mask, so codecs whose native order differs carry a permutation
//! from their order to WAVE order.

use std::fmt::Display;

/// WAVE speaker position bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum Speaker {
    FrontLeft = 0x1,
    FrontRight = 0x2,
    FrontCenter = 0x4,
    LowFrequency = 0x8,
    BackLeft = 0x10,
    BackRight = 0x20,
    FrontLeftOfCenter = 0x40,
    FrontRightOfCenter = 0x80,
    BackCenter = 0x100,
    SideLeft = 0x200,
    SideRight = 0x400,
    TopCenter = 0x800,
}

impl Speaker {
    pub const ALL: [Speaker; 12] = [
        Speaker::FrontLeft,
        Speaker::FrontRight,
        Speaker::FrontCenter,
        Speaker::LowFrequency,
        Speaker::BackLeft,
        Speaker::BackRight,
        Speaker::FrontLeftOfCenter,
        Speaker::FrontRightOfCenter,
        Speaker::BackCenter,
        Speaker::SideLeft,
        Speaker::SideRight,
        Speaker::TopCenter,
    ];

    /// Speakers present in `mask`, in WAVE order.
    pub fn from_mask(mask: u32) -> Vec<Speaker> {
        Self::ALL
            .into_iter()
            .filter(|&speaker| mask & speaker as u32 != 0)
            .collect()
    }
}

impl Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Speaker::FrontLeft => "L",
            Speaker::FrontRight => "R",
            Speaker::FrontCenter => "C",
            Speaker::LowFrequency => "LFE",
            Speaker::BackLeft => "Lb",
            Speaker::BackRight => "Rb",
            Speaker::FrontLeftOfCenter => "Lc",
            Speaker::FrontRightOfCenter => "Rc",
            Speaker::BackCenter => "Cb",
            Speaker::SideLeft => "Ls",
            Speaker::SideRight => "Rs",
            Speaker::TopCenter => "Ts",
        };
        write!(f, "{name}")
    }
}

/// Default mask for plain 1- and 2-channel streams, 0 (undefined) otherwise.
pub fn default_mask(channels: usize) -> u32 {
    match channels {
        1 => 0x4,
        2 => 0x3,
        _ => 0,
    }
}

/// ALAC channel order to WAVE order, indexed by channel count - 1.
/// `output[i] = alac[ALAC_TO_WAVE[n - 1][i]]`.
static ALAC_TO_WAVE: [&[usize]; 8] = [
    &[0],
    &[0, 1],
    &[1, 2, 0],
    &[1, 2, 0, 3],
    &[1, 2, 0, 3, 4],
    &[1, 2, 0, 5, 3, 4],
    &[1, 2, 0, 6, 5, 3, 4],
    &[3, 4, 0, 7, 5, 6, 1, 2],
];

static ALAC_MASKS: [u32; 8] = [0x4, 0x3, 0x7, 0x107, 0x37, 0x3F, 0x70F, 0xFF];

/// Permutation and mask for an ALAC stream with `channels` channels.
/// Layouts beyond eight channels are passed through unchanged with no mask.
pub fn alac_layout(channels: usize) -> (Vec<usize>, u32) {
    match channels {
        1..=8 => (ALAC_TO_WAVE[channels - 1].to_vec(), ALAC_MASKS[channels - 1]),
        _ => ((0..channels).collect(), 0),
    }
}

/// DVD-Audio channel assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AobAssignment {
    /// Channels in group 1 and group 2.
    pub groups: (usize, usize),
    pub mask: u32,
    /// Stream order to WAVE order.
    pub order: &'static [usize],
}

impl AobAssignment {
    pub fn channels(&self) -> usize {
        self.groups.0 + self.groups.1
    }
}

const fn aob(g1: usize, g2: usize, mask: u32, order: &'static [usize]) -> AobAssignment {
    AobAssignment {
        groups: (g1, g2),
        mask,
        order,
    }
}

static AOB_ASSIGNMENTS: [AobAssignment; 21] = [
    aob(1, 0, 0x4, &[0]),
    aob(2, 0, 0x3, &[0, 1]),
    aob(2, 1, 0x103, &[0, 1, 2]),
    aob(2, 2, 0x33, &[0, 1, 2, 3]),
    aob(2, 1, 0xB, &[0, 1, 2]),
    aob(2, 2, 0x10B, &[0, 1, 2, 3]),
    aob(2, 3, 0x3B, &[0, 1, 2, 3, 4]),
    aob(2, 1, 0x7, &[0, 1, 2]),
    aob(2, 2, 0x107, &[0, 1, 2, 3]),
    aob(2, 3, 0x37, &[0, 1, 2, 3, 4]),
    aob(2, 2, 0xF, &[0, 1, 2, 3]),
    aob(2, 3, 0x10F, &[0, 1, 2, 3, 4]),
    aob(2, 4, 0x3F, &[0, 1, 2, 3, 4, 5]),
    aob(3, 1, 0x107, &[0, 1, 2, 3]),
    aob(3, 2, 0x37, &[0, 1, 2, 3, 4]),
    aob(3, 1, 0xF, &[0, 1, 2, 3]),
    aob(3, 2, 0x10F, &[0, 1, 2, 3, 4]),
    aob(3, 3, 0x3F, &[0, 1, 2, 3, 4, 5]),
    aob(4, 1, 0x3B, &[0, 1, 4, 2, 3]),
    aob(4, 1, 0x37, &[0, 1, 4, 2, 3]),
    aob(4, 2, 0x3F, &[0, 1, 4, 5, 2, 3]),
];

pub fn aob_assignment(code: u8) -> Option<&'static AobAssignment> {
    AOB_ASSIGNMENTS.get(code as usize)
}

/// Reorders `channels` so that `output[i] = input[order[i]]`.
pub fn reorder<T>(channels: Vec<T>, order: &[usize]) -> Vec<T> {
    let mut slots: Vec<Option<T>> = channels.into_iter().map(Some).collect();
    order
        .iter()
        .filter_map(|&index| slots.get_mut(index).and_then(Option::take))
        .collect()
}
