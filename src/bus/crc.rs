//! # Bus Frame Checksum
//!
//! CRC-8 with the DVB-S2 polynomial (0xD5, init 0x00), computed over the id,
//! length and data bytes of every bus frame.

const POLY: u8 = 0xD5;

const TABLE: [u8; 256] = build_table();

const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ POLY } else { crc << 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }

    table
}

/// Checksum `data` using the precomputed table
///
/// # Examples
///
/// ```
/// use armcam_node::bus::crc::frame_crc;
///
/// assert_eq!(frame_crc(&[]), 0x00);
/// ```
pub fn frame_crc(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |crc, &byte| TABLE[(crc ^ byte) as usize])
}
