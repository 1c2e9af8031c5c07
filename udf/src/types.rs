//! Common types and constants for UDF

use crate::utils::sector::{read_u16, read_u32};
use crate::utils::string::trim_identifier;

/// Default logical block size (optical media sector)
pub const DEFAULT_BLOCK_SIZE: u32 = 2048;

/// Largest logical block size tried during negotiation
pub const MAX_BLOCK_SIZE: u32 = 4096;

/// Descriptor tag length
pub const TAG_SIZE: usize = 16;

/// Byte offset of the volume recognition sequence
pub const VRS_START: u64 = 32768;

/// The recognition sequence is not searched past this byte offset
pub const VRS_LIMIT: u64 = 0x80_0000;

/// Minimum recognition sector size
pub const VRS_SECTOR_SIZE: u64 = 2048;

/// Primary anchor location relative to the session start
pub const ANCHOR_BLOCK: u64 = 256;

/// Anchor location on half-open media
pub const ANCHOR_BLOCK_HALF_OPEN: u64 = 512;

/// Most volume descriptor pointers followed in one sequence walk
pub const MAX_DESCRIPTOR_POINTERS: usize = 64;

/// Integrity chain recursion limit
pub const MAX_INTEGRITY_NESTING: u32 = 1000;

/// Newest minimum read revision this implementation accepts
pub const MAX_READ_REVISION: u16 = 0x0260;

/// Newest minimum write revision this implementation accepts
pub const MAX_WRITE_REVISION: u16 = 0x0201;

/// Physical partition map type
pub const PARTITION_MAP_TYPE1: u8 = 1;

/// Identified partition map type
pub const PARTITION_MAP_TYPE2: u8 = 2;

/// Sentinel for "no file" in metadata partition maps
pub const NO_LOCATION: u32 = 0xFFFF_FFFF;

/// Domain identifier for OSTA conformant volumes
pub const IDENT_OSTA_COMPLIANT: &str = "*OSTA UDF Compliant";
/// Virtual partition map identifier
pub const IDENT_VIRTUAL_PARTITION: &str = "*UDF Virtual Partition";
/// Sparable partition map identifier
pub const IDENT_SPARABLE_PARTITION: &str = "*UDF Sparable Partition";
/// Metadata partition map identifier
pub const IDENT_METADATA_PARTITION: &str = "*UDF Metadata Partition";
/// Sparing table identifier
pub const IDENT_SPARING_TABLE: &str = "*UDF Sparing Table";
/// UDF 1.5 virtual allocation table trailer identifier
pub const IDENT_VAT_15: &str = "*UDF Virtual Alloc Tbl";
/// Partition contents identifiers for NSR02/NSR03 file systems
pub const PARTITION_CONTENTS_NSR02: &str = "+NSR02";
/// See [`PARTITION_CONTENTS_NSR02`]
pub const PARTITION_CONTENTS_NSR03: &str = "+NSR03";

/// Descriptor tag identifiers (ECMA-167 3/7.2.1, 4/7.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagIdentifier {
    /// Sparing table (UDF 2.2.12), and "no descriptor" in zero-filled space
    SparingTable,
    /// Primary Volume Descriptor
    PrimaryVolume,
    /// Anchor Volume Descriptor Pointer
    AnchorVolumePointer,
    /// Volume Descriptor Pointer
    VolumePointer,
    /// Implementation Use Volume Descriptor
    ImplementationUse,
    /// Partition Descriptor
    Partition,
    /// Logical Volume Descriptor
    LogicalVolume,
    /// Unallocated Space Descriptor
    UnallocatedSpace,
    /// Terminating Descriptor
    Terminating,
    /// Logical Volume Integrity Descriptor
    LogicalVolumeIntegrity,
    /// File Set Descriptor
    FileSet,
    /// File Identifier Descriptor
    FileIdentifier,
    /// Allocation Extent Descriptor
    AllocationExtent,
    /// Indirect Entry
    IndirectEntry,
    /// Terminal Entry
    TerminalEntry,
    /// File Entry
    FileEntry,
    /// Extended Attribute Header Descriptor
    ExtendedAttributeHeader,
    /// Unallocated Space Entry
    UnallocatedSpaceEntry,
    /// Space Bitmap Descriptor
    SpaceBitmap,
    /// Partition Integrity Entry
    PartitionIntegrity,
    /// Extended File Entry
    ExtendedFileEntry,
    /// Anything else
    Other(u16),
}

impl TagIdentifier {
    /// Decode the on-disk identifier
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::SparingTable,
            1 => Self::PrimaryVolume,
            2 => Self::AnchorVolumePointer,
            3 => Self::VolumePointer,
            4 => Self::ImplementationUse,
            5 => Self::Partition,
            6 => Self::LogicalVolume,
            7 => Self::UnallocatedSpace,
            8 => Self::Terminating,
            9 => Self::LogicalVolumeIntegrity,
            256 => Self::FileSet,
            257 => Self::FileIdentifier,
            258 => Self::AllocationExtent,
            259 => Self::IndirectEntry,
            260 => Self::TerminalEntry,
            261 => Self::FileEntry,
            262 => Self::ExtendedAttributeHeader,
            263 => Self::UnallocatedSpaceEntry,
            264 => Self::SpaceBitmap,
            265 => Self::PartitionIntegrity,
            266 => Self::ExtendedFileEntry,
            other => Self::Other(other),
        }
    }

    /// On-disk identifier value
    pub fn as_u16(self) -> u16 {
        match self {
            Self::SparingTable => 0,
            Self::PrimaryVolume => 1,
            Self::AnchorVolumePointer => 2,
            Self::VolumePointer => 3,
            Self::ImplementationUse => 4,
            Self::Partition => 5,
            Self::LogicalVolume => 6,
            Self::UnallocatedSpace => 7,
            Self::Terminating => 8,
            Self::LogicalVolumeIntegrity => 9,
            Self::FileSet => 256,
            Self::FileIdentifier => 257,
            Self::AllocationExtent => 258,
            Self::IndirectEntry => 259,
            Self::TerminalEntry => 260,
            Self::FileEntry => 261,
            Self::ExtendedAttributeHeader => 262,
            Self::UnallocatedSpaceEntry => 263,
            Self::SpaceBitmap => 264,
            Self::PartitionIntegrity => 265,
            Self::ExtendedFileEntry => 266,
            Self::Other(v) => v,
        }
    }
}

/// Extent descriptor: length in bytes plus an absolute block location
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentAd {
    /// Length in bytes
    pub length: u32,
    /// Starting block
    pub location: u32,
}

impl ExtentAd {
    /// Parse 8 bytes at `offset`
    pub fn parse(data: &[u8], offset: usize) -> Self {
        Self {
            length: read_u32(data, offset),
            location: read_u32(data, offset + 4),
        }
    }
}

/// Partition-relative block address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LbAddr {
    /// Block number within the partition
    pub block: u32,
    /// Partition reference number (index into the partition maps)
    pub partition: u16,
}

impl LbAddr {
    /// Parse 6 bytes at `offset`
    pub fn parse(data: &[u8], offset: usize) -> Self {
        Self {
            block: read_u32(data, offset),
            partition: read_u16(data, offset + 4),
        }
    }
}

/// Short allocation descriptor (extent inside the current partition)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShortAd {
    /// Extent length in bytes; the top two bits carry the extent type
    pub length: u32,
    /// Starting block
    pub position: u32,
}

impl ShortAd {
    /// On-disk size
    pub const SIZE: usize = 8;

    /// Parse 8 bytes at `offset`
    pub fn parse(data: &[u8], offset: usize) -> Self {
        Self {
            length: read_u32(data, offset),
            position: read_u32(data, offset + 4),
        }
    }

    /// Extent length in bytes without the type bits
    pub fn byte_length(&self) -> u32 {
        self.length & 0x3FFF_FFFF
    }
}

/// Long allocation descriptor (extent with an explicit partition)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LongAd {
    /// Extent length in bytes; the top two bits carry the extent type
    pub length: u32,
    /// Extent location
    pub location: LbAddr,
}

impl LongAd {
    /// On-disk size
    pub const SIZE: usize = 16;

    /// Parse 16 bytes at `offset`
    pub fn parse(data: &[u8], offset: usize) -> Self {
        Self {
            length: read_u32(data, offset),
            location: LbAddr::parse(data, offset + 4),
        }
    }

    /// Extent length in bytes without the type bits
    pub fn byte_length(&self) -> u32 {
        self.length & 0x3FFF_FFFF
    }
}

/// Entity identifier (1/7.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityId {
    /// Flags
    pub flags: u8,
    /// Identifier bytes
    pub identifier: [u8; 23],
    /// Identifier suffix
    pub suffix: [u8; 8],
}

impl EntityId {
    /// On-disk size
    pub const SIZE: usize = 32;

    /// Parse 32 bytes at `offset`
    pub fn parse(data: &[u8], offset: usize) -> Self {
        let mut identifier = [0u8; 23];
        identifier.copy_from_slice(&data[offset + 1..offset + 24]);
        let mut suffix = [0u8; 8];
        suffix.copy_from_slice(&data[offset + 24..offset + 32]);
        Self {
            flags: data[offset],
            identifier,
            suffix,
        }
    }

    /// Whether the identifier equals `name` (ignoring trailing padding)
    pub fn matches(&self, name: &str) -> bool {
        trim_identifier(&self.identifier) == name.as_bytes()
    }

    /// UDF revision recorded in the first two suffix bytes
    pub fn udf_revision(&self) -> u16 {
        u16::from_le_bytes([self.suffix[0], self.suffix[1]])
    }

    /// Domain flags recorded in the third suffix byte
    pub fn domain_flags(&self) -> u8 {
        self.suffix[2]
    }

    /// Identifier as text, for diagnostics
    pub fn name(&self) -> String {
        String::from_utf8_lossy(trim_identifier(&self.identifier)).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_identifier_mapping() {
        for raw in [0u16, 1, 2, 3, 5, 6, 8, 9, 256, 261, 264, 266] {
            assert_eq!(TagIdentifier::from_u16(raw).as_u16(), raw);
        }
        assert_eq!(TagIdentifier::from_u16(42), TagIdentifier::Other(42));
    }

    #[test]
    fn test_entity_id_matching() {
        let mut raw = [0u8; 32];
        raw[1..20].copy_from_slice(IDENT_OSTA_COMPLIANT.as_bytes());
        raw[24..26].copy_from_slice(&0x0250u16.to_le_bytes());
        raw[26] = 0x02;
        let ident = EntityId::parse(&raw, 0);
        assert!(ident.matches(IDENT_OSTA_COMPLIANT));
        assert!(!ident.matches(IDENT_VIRTUAL_PARTITION));
        assert_eq!(ident.udf_revision(), 0x0250);
        assert_eq!(ident.domain_flags(), 0x02);
    }

    #[test]
    fn test_allocation_descriptor_length_masks_type() {
        let mut raw = [0u8; 16];
        raw[0..4].copy_from_slice(&(0xC000_0800u32).to_le_bytes());
        raw[4..8].copy_from_slice(&77u32.to_le_bytes());
        raw[8..10].copy_from_slice(&1u16.to_le_bytes());
        let ad = LongAd::parse(&raw, 0);
        assert_eq!(ad.byte_length(), 0x800);
        assert_eq!(ad.location, LbAddr { block: 77, partition: 1 });
    }
}
