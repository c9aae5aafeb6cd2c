//! CRC-32 (IEEE 802.3, reflected polynomial `0xEDB88320`).
//!
//! Used to check file-transfer payloads end to end. The table is built at
//! compile time.

const POLYNOMIAL: u32 = 0xEDB8_8320;

const TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 == 1 { POLYNOMIAL ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

/// Checksum of a whole buffer.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc = TABLE[usize::from((crc ^ u32::from(byte)).to_le_bytes()[0])] ^ (crc >> 8);
    }
    crc ^ 0xFFFF_FFFF
}
