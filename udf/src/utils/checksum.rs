//! Descriptor tag checksum and CRC calculations
//!
//! Every ECMA-167 descriptor starts with a 16-byte tag. Byte 4 holds the
//! 8-bit sum of the other fifteen tag bytes; bytes 8-9 hold a CRC-ITU-T
//! (CRC-16/XMODEM: polynomial 0x1021, initial value 0) over the
//! `crc_length` bytes that follow the tag.

use crc::{Crc, CRC_16_XMODEM};

/// CRC-ITU-T as used by descriptor tags
const TAG_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Byte offset of the checksum inside the tag
pub const TAG_CHECKSUM_OFFSET: usize = 4;

/// Sum of tag bytes 0-3 and 5-15, modulo 256
///
/// # Arguments
/// * `tag` - At least the first 16 bytes of a descriptor
pub fn tag_checksum(tag: &[u8]) -> u8 {
    tag[..16]
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != TAG_CHECKSUM_OFFSET)
        .fold(0u8, |sum, (_, b)| sum.wrapping_add(*b))
}

/// CRC-ITU-T over a byte range
pub fn crc_itu_t(data: &[u8]) -> u16 {
    TAG_CRC.checksum(data)
}
