//! Incremental CRC32 over firmware image windows.
//!
//! Image transfers are protected by the reflected CRC32 used by Ethernet and
//! zlib (polynomial 0xEDB88320). The checksum is folded window by window so
//! the staged file never has to be re-read at the end of a transfer: seed an
//! accumulator with [`INIT`], fold each window with [`update`], and compare
//! [`finalize`] of the accumulator against the peer's declared value.

/// Seed value for a fresh checksum accumulator.
pub const INIT: u32 = 0xFFFF_FFFF;

/// Reflected CRC32 polynomial.
const POLYNOMIAL: u32 = 0xEDB8_8320;

/// Lookup table indexed by one input byte.
static TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut index = 0;
    while index < 256 {
        let mut crc = index as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[index] = crc;
        index += 1;
    }
    table
}

/// Folds `data` into a running checksum.
pub fn update(mut crc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ TABLE[index];
    }
    crc
}

/// Complements a running checksum into its transmitted form.
pub fn finalize(crc: u32) -> u32 {
    crc ^ 0xFFFF_FFFF
}

/// One-shot checksum of a complete buffer.
pub fn checksum(data: &[u8]) -> u32 {
    finalize(update(INIT, data))
}
