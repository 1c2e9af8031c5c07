//! Logical Volume Integrity Descriptor (3/10.10, UDF 2.2.6)
//!
//! The integrity record is the only block this crate ever writes. A
//! read-write mount flips it to "open"; unmount flips it back to "close"
//! after raising the recorded revision fields.

use crate::types::{EntityId, ExtentAd, TAG_SIZE};
use crate::utils::datetime::UdfTimestamp;
use crate::utils::sector::{read_u16, read_u32, write_u16, write_u32};

use super::tag::seal;

/// Integrity type: volume is open (possibly inconsistent)
pub const INTEGRITY_OPEN: u32 = 0;
/// Integrity type: volume was closed cleanly
pub const INTEGRITY_CLOSE: u32 = 1;

const FIXED_SIZE: usize = 80;
const IMPL_USE_REVISIONS_SIZE: usize = 46;

/// Revision fields from the UDF implementation-use area
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrityRevisions {
    /// Files on the volume
    pub file_count: u32,
    /// Directories on the volume
    pub directory_count: u32,
    /// Oldest UDF revision able to read the volume
    pub min_read: u16,
    /// Oldest UDF revision able to write the volume
    pub min_write: u16,
    /// Newest UDF revision that wrote the volume
    pub max_write: u16,
}

/// Parsed integrity record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolumeIntegrity {
    /// Time the record was written
    pub recorded: UdfTimestamp,
    /// [`INTEGRITY_OPEN`] or [`INTEGRITY_CLOSE`]
    pub integrity_type: u32,
    /// Next integrity extent, zero length when last
    pub next: ExtentAd,
    /// Next unique id (first 8 bytes of contents use)
    pub next_unique_id: u64,
    /// Free block count per partition
    pub free_space: Vec<u32>,
    /// Size in blocks per partition
    pub sizes: Vec<u32>,
    /// Implementation identifier of the last writer
    pub implementation: Option<EntityId>,
    /// Revision fields, when the implementation-use area carries them
    pub revisions: Option<IntegrityRevisions>,
}

/// Whether the partition tables and implementation-use area fit in `block`
pub fn record_fits(block: &[u8]) -> bool {
    if block.len() < FIXED_SIZE {
        return false;
    }
    let partitions = read_u32(block, 72) as u64;
    let impl_use = read_u32(block, 76) as u64;
    FIXED_SIZE as u64 + partitions * 8 + impl_use <= block.len() as u64
}

/// Length the descriptor CRC should cover
fn crc_length(block: &[u8]) -> usize {
    let partitions = read_u32(block, 72) as usize;
    let impl_use = read_u32(block, 76) as usize;
    FIXED_SIZE + partitions * 8 + impl_use - TAG_SIZE
}

fn impl_use_offset(block: &[u8]) -> usize {
    FIXED_SIZE + read_u32(block, 72) as usize * 8
}

impl LogicalVolumeIntegrity {
    /// Parse a validated integrity block
    ///
    /// # Returns
    /// `None` when the partition count or implementation-use length does
    /// not fit the block.
    pub fn parse(block: &[u8]) -> Option<Self> {
        if !record_fits(block) {
            return None;
        }
        let partitions = read_u32(block, 72) as usize;
        let impl_len = read_u32(block, 76) as usize;
        let free_space = (0..partitions).map(|i| read_u32(block, FIXED_SIZE + i * 4)).collect();
        let sizes = (0..partitions)
            .map(|i| read_u32(block, FIXED_SIZE + (partitions + i) * 4))
            .collect();

        let iu = impl_use_offset(block);
        let implementation = (impl_len >= EntityId::SIZE).then(|| EntityId::parse(block, iu));
        let revisions = (impl_len >= IMPL_USE_REVISIONS_SIZE).then(|| IntegrityRevisions {
            file_count: read_u32(block, iu + 32),
            directory_count: read_u32(block, iu + 36),
            min_read: read_u16(block, iu + 40),
            min_write: read_u16(block, iu + 42),
            max_write: read_u16(block, iu + 44),
        });

        let mut unique = [0u8; 8];
        unique.copy_from_slice(&block[40..48]);
        Some(Self {
            recorded: UdfTimestamp::from_bytes(&block[16..28]),
            integrity_type: read_u32(block, 28),
            next: ExtentAd::parse(block, 32),
            next_unique_id: u64::from_le_bytes(unique),
            free_space,
            sizes,
            implementation,
            revisions,
        })
    }

    /// Whether the record was left open
    pub fn is_open(&self) -> bool {
        self.integrity_type == INTEGRITY_OPEN
    }
}

/// Mark a raw integrity block open, refresh its timestamp and re-seal it
///
/// # Returns
/// `true` when the block was previously closed.
pub fn mark_open(block: &mut [u8], now: UdfTimestamp) -> bool {
    let was_closed = read_u32(block, 28) == INTEGRITY_CLOSE;
    now.write_to(&mut block[16..28]);
    write_u32(block, 28, INTEGRITY_OPEN);
    let len = crc_length(block);
    seal(block, len);
    was_closed
}

/// Mark a raw integrity block closed and re-seal it
///
/// # Arguments
/// * `block` - Raw integrity block
/// * `now` - Close timestamp
/// * `revision` - UDF revision of the mounted volume
/// * `max_write` - Newest revision this implementation writes
/// * `consistent` - Whether the volume was closed when mounted; an
///   inconsistent volume stays open
pub fn mark_closed(
    block: &mut [u8],
    now: UdfTimestamp,
    revision: u16,
    max_write: u16,
    consistent: bool,
) {
    now.write_to(&mut block[16..28]);
    if read_u32(block, 76) as usize >= IMPL_USE_REVISIONS_SIZE {
        let iu = impl_use_offset(block);
        if max_write > read_u16(block, iu + 44) {
            write_u16(block, iu + 44, max_write);
        }
        if revision > read_u16(block, iu + 40) {
            write_u16(block, iu + 40, revision);
        }
        if revision > read_u16(block, iu + 42) {
            write_u16(block, iu + 42, revision);
        }
    }
    if consistent {
        write_u32(block, 28, INTEGRITY_CLOSE);
    }
    let len = crc_length(block);
    seal(block, len);
}
