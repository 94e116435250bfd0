//! CRC validation utilities.
//!
//! TTA protects its header, seek table and every frame with the reflected
//! CRC-32 used by zip and PNG. WavPack uses its own running sample checksum,
//! which lives next to the block decoder rather than here.

/// Reflected CRC algorithm specification.
pub struct Algorithm<T> {
    poly: T,
    init: T,
    xorout: T,
}

/// CRC-32 (IEEE 802.3), reflected input and output.
pub const CRC32_IEEE_ALG: Algorithm<u32> = Algorithm {
    poly: 0xEDB8_8320,
    init: 0xFFFF_FFFF,
    xorout: 0xFFFF_FFFF,
};

/// Shifts one reflected byte through the polynomial.
#[inline(always)]
pub const fn crc32_reflected(poly: u32, mut value: u32) -> u32 {
    let mut i = 0;
    while i < 8 {
        value = (value >> 1) ^ ((value & 1) * poly);
        i += 1;
    }

    value
}

#[inline(always)]
const fn crc32_table(poly: u32) -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < table.len() {
        table[i] = crc32_reflected(poly, i as u32);
        i += 1;
    }

    table
}

#[derive(Debug)]
pub struct Crc32 {
    pub poly: u32,
    pub init: u32,
    pub xorout: u32,
    table: [u32; 256],
}

impl Crc32 {
    pub const fn new(algorithm: &Algorithm<u32>) -> Self {
        Self {
            poly: algorithm.poly,
            init: algorithm.init,
            xorout: algorithm.xorout,
            table: crc32_table(algorithm.poly),
        }
    }

    #[inline(always)]
    pub const fn update(&self, mut crc: u32, bytes: &[u8]) -> u32 {
        let mut i = 0;

        while i < bytes.len() {
            crc = self.table[((crc ^ bytes[i] as u32) & 0xFF) as usize] ^ (crc >> 8);
            i += 1;
        }

        crc
    }

    /// One-shot checksum including the initial value and final xor.
    pub const fn checksum(&self, bytes: &[u8]) -> u32 {
        self.update(self.init, bytes) ^ self.xorout
    }
}

pub static CRC32: Crc32 = Crc32::new(&CRC32_IEEE_ALG);
