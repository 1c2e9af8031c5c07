//! Volume structure descriptors (ECMA-167 part 3)
//!
//! Fixed-layout parsers for the descriptors found in the main and reserve
//! volume descriptor sequences. Every parser takes a block that already
//! passed [`validate`](super::tag::validate) and only checks that the block
//! is long enough for the fields it reads.

use crate::error::{Result, UdfError};
use crate::types::{EntityId, ExtentAd, LongAd, ShortAd, PARTITION_MAP_TYPE1, PARTITION_MAP_TYPE2};
use crate::utils::sector::{read_u16, read_u32};
use crate::utils::string::decode_dstring;

/// Volume descriptor sequence number, shared by every VDS descriptor at byte 16
pub fn sequence_number(block: &[u8]) -> u32 {
    read_u32(block, 16)
}

fn ensure_len(block: &[u8], needed: usize, what: &'static str) -> Result<()> {
    if block.len() < needed {
        return Err(UdfError::MissingDescriptor(what));
    }
    Ok(())
}

/// Anchor Volume Descriptor Pointer (3/10.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorVolumeDescriptor {
    /// Main volume descriptor sequence
    pub main_sequence: ExtentAd,
    /// Reserve volume descriptor sequence
    pub reserve_sequence: ExtentAd,
}

impl AnchorVolumeDescriptor {
    /// Parse an anchor block
    pub fn parse(block: &[u8]) -> Result<Self> {
        ensure_len(block, 32, "anchor volume descriptor pointer")?;
        Ok(Self {
            main_sequence: ExtentAd::parse(block, 16),
            reserve_sequence: ExtentAd::parse(block, 24),
        })
    }
}

/// Volume Descriptor Pointer (3/10.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeDescriptorPointer {
    /// Sequence number
    pub sequence_number: u32,
    /// Continuation extent
    pub next: ExtentAd,
}

impl VolumeDescriptorPointer {
    /// Parse a pointer block
    pub fn parse(block: &[u8]) -> Result<Self> {
        ensure_len(block, 28, "volume descriptor pointer")?;
        Ok(Self {
            sequence_number: sequence_number(block),
            next: ExtentAd::parse(block, 20),
        })
    }
}

/// Primary Volume Descriptor (3/10.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryVolumeDescriptor {
    /// Sequence number
    pub sequence_number: u32,
    /// Volume identifier
    pub volume_identifier: String,
    /// Volume sequence number
    pub volume_sequence_number: u16,
    /// Volume set identifier
    pub volume_set_identifier: String,
}

impl PrimaryVolumeDescriptor {
    /// Parse a primary volume descriptor block
    pub fn parse(block: &[u8]) -> Result<Self> {
        ensure_len(block, 200, "primary volume descriptor")?;
        Ok(Self {
            sequence_number: sequence_number(block),
            volume_identifier: decode_dstring(&block[24..56]),
            volume_sequence_number: read_u16(block, 56),
            volume_set_identifier: decode_dstring(&block[72..200]),
        })
    }
}

/// Partition access type (3/10.5.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Not specified
    Unspecified,
    /// Read only
    ReadOnly,
    /// Write once
    WriteOnce,
    /// Rewritable (needs sparing or similar)
    Rewritable,
    /// Overwritable
    Overwritable,
    /// Reserved value
    Other(u32),
}

impl AccessType {
    /// Decode the on-disk value
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Unspecified,
            1 => Self::ReadOnly,
            2 => Self::WriteOnce,
            3 => Self::Rewritable,
            4 => Self::Overwritable,
            other => Self::Other(other),
        }
    }
}

/// Partition Header Descriptor carried in the partition contents use field (4/14.3)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionHeader {
    /// Unallocated space table
    pub unallocated_table: ShortAd,
    /// Unallocated space bitmap
    pub unallocated_bitmap: ShortAd,
    /// Freed space table
    pub freed_table: ShortAd,
    /// Freed space bitmap
    pub freed_bitmap: ShortAd,
}

/// Partition Descriptor (3/10.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    /// Sequence number
    pub sequence_number: u32,
    /// Partition flags (bit 0: allocated)
    pub flags: u16,
    /// Partition number referenced by partition maps
    pub number: u16,
    /// Partition contents identifier ("+NSR02"/"+NSR03" for file systems)
    pub contents: EntityId,
    /// File system space management header
    pub header: PartitionHeader,
    /// Access type
    pub access: AccessType,
    /// First block of the partition
    pub start: u32,
    /// Partition length in blocks
    pub length: u32,
}

impl PartitionDescriptor {
    /// Parse a partition descriptor block
    pub fn parse(block: &[u8]) -> Result<Self> {
        ensure_len(block, 196, "partition descriptor")?;
        let header = PartitionHeader {
            unallocated_table: ShortAd::parse(block, 56),
            unallocated_bitmap: ShortAd::parse(block, 64),
            freed_table: ShortAd::parse(block, 80),
            freed_bitmap: ShortAd::parse(block, 88),
        };
        Ok(Self {
            sequence_number: sequence_number(block),
            flags: read_u16(block, 20),
            number: read_u16(block, 22),
            contents: EntityId::parse(block, 24),
            header,
            access: AccessType::from_u32(read_u32(block, 184)),
            start: read_u32(block, 188),
            length: read_u32(block, 192),
        })
    }
}

/// One raw entry of the logical volume partition map table (3/10.7)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPartitionMap {
    /// Type 1: a physical partition on this volume
    Type1 {
        /// Volume sequence number
        volume_sequence: u16,
        /// Partition number
        partition_number: u16,
    },
    /// Type 2: identified by an entity identifier, payload follows
    Type2 {
        /// Partition type identifier
        ident: EntityId,
        /// Volume sequence number
        volume_sequence: u16,
        /// Partition number
        partition_number: u16,
        /// Bytes 40..64 of the entry
        payload: [u8; 24],
    },
    /// Unrecognised map type
    Other {
        /// Map type byte
        map_type: u8,
    },
}

/// Logical Volume Descriptor (3/10.6)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolumeDescriptor {
    /// Sequence number
    pub sequence_number: u32,
    /// Logical volume identifier
    pub identifier: String,
    /// Logical block size
    pub block_size: u32,
    /// Domain identifier
    pub domain: EntityId,
    /// File set descriptor location
    pub fileset: LongAd,
    /// Partition map table length in bytes
    pub map_table_length: u32,
    /// Number of partition maps
    pub map_count: u32,
    /// Integrity sequence extent
    pub integrity_sequence: ExtentAd,
    /// Partition map entries, in table order
    pub maps: Vec<RawPartitionMap>,
}

/// Byte offset of the partition map table
pub const LVD_MAP_TABLE_OFFSET: usize = 440;

impl LogicalVolumeDescriptor {
    /// Parse a logical volume descriptor block
    ///
    /// # Arguments
    /// * `block` - Validated descriptor block
    /// * `block_size` - Logical block size of the volume
    ///
    /// # Returns
    /// The descriptor with its partition map table decoded; table length
    /// and entry framing errors are configuration errors.
    pub fn parse(block: &[u8], block_size: u32) -> Result<Self> {
        ensure_len(block, LVD_MAP_TABLE_OFFSET, "logical volume descriptor")?;
        let map_table_length = read_u32(block, 264);
        let max = block_size.saturating_sub(LVD_MAP_TABLE_OFFSET as u32);
        if map_table_length > max || LVD_MAP_TABLE_OFFSET + map_table_length as usize > block.len() {
            return Err(UdfError::PartitionTableTooLong {
                length: map_table_length,
                max,
            });
        }
        let map_count = read_u32(block, 268);
        let table = &block[LVD_MAP_TABLE_OFFSET..LVD_MAP_TABLE_OFFSET + map_table_length as usize];
        let maps = parse_map_table(table, map_count)?;

        Ok(Self {
            sequence_number: sequence_number(block),
            identifier: decode_dstring(&block[84..212]),
            block_size: read_u32(block, 212),
            domain: EntityId::parse(block, 216),
            fileset: LongAd::parse(block, 248),
            map_table_length,
            map_count,
            integrity_sequence: ExtentAd::parse(block, 432),
            maps,
        })
    }
}

fn parse_map_table(table: &[u8], count: u32) -> Result<Vec<RawPartitionMap>> {
    let mut maps = Vec::new();
    maps.try_reserve(count.min(table.len() as u32 / 2) as usize)
        .map_err(|_| UdfError::OutOfMemory("partition maps"))?;

    let mut offset = 0usize;
    for _ in 0..count {
        if offset + 2 > table.len() {
            return Err(UdfError::MalformedPartitionMap { offset });
        }
        let map_type = table[offset];
        let length = table[offset + 1] as usize;
        if length < 2 || offset + length > table.len() {
            return Err(UdfError::MalformedPartitionMap { offset });
        }
        let entry = &table[offset..offset + length];
        let map = match map_type {
            PARTITION_MAP_TYPE1 if length >= 6 => RawPartitionMap::Type1 {
                volume_sequence: read_u16(entry, 2),
                partition_number: read_u16(entry, 4),
            },
            PARTITION_MAP_TYPE2 if length >= 64 => {
                let mut payload = [0u8; 24];
                payload.copy_from_slice(&entry[40..64]);
                RawPartitionMap::Type2 {
                    ident: EntityId::parse(entry, 4),
                    volume_sequence: read_u16(entry, 36),
                    partition_number: read_u16(entry, 38),
                    payload,
                }
            }
            PARTITION_MAP_TYPE1 | PARTITION_MAP_TYPE2 => {
                return Err(UdfError::MalformedPartitionMap { offset });
            }
            other => RawPartitionMap::Other { map_type: other },
        };
        maps.push(map);
        offset += length;
    }
    Ok(maps)
}
