//! Block address arithmetic and little-endian field access

/// Packets of 32 user blocks carry 7 blocks of run-in/run-out/link overhead
const PACKET_USER_BLOCKS: u64 = 32;
const PACKET_TOTAL_BLOCKS: u64 = 39;

/// Map a fixed-packet block address to its variable-packet position
///
/// Used when a drive reports addresses for media written with variable
/// packets: every 32 user blocks occupy 39 physical ones.
pub fn fixed_to_variable(block: u64) -> u64 {
    (block / PACKET_USER_BLOCKS) * PACKET_TOTAL_BLOCKS + (block % PACKET_USER_BLOCKS)
}

/// Inverse of [`fixed_to_variable`]
pub fn variable_to_fixed(block: u64) -> u64 {
    (block / PACKET_TOTAL_BLOCKS) * PACKET_USER_BLOCKS + (block % PACKET_TOTAL_BLOCKS)
}

/// Number of blocks needed for `bytes`
pub fn blocks_for_bytes(bytes: u64, block_size: u32) -> u64 {
    bytes.div_ceil(block_size as u64)
}

/// Read a little-endian u16 at `offset`
#[inline]
pub fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Read a little-endian u32 at `offset`
#[inline]
pub fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Read a little-endian u64 at `offset`
#[inline]
pub fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Write a little-endian u16 at `offset`
#[inline]
pub fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Write a little-endian u32 at `offset`
#[inline]
pub fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
