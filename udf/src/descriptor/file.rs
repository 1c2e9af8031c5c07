//! File structure descriptors (ECMA-167 part 4)
//!
//! Only what the mount pipeline needs: the File Set Descriptor, file
//! entries for the special files (VAT, metadata main/mirror/bitmap) and the
//! Space Bitmap header used to skip bitmaps during the fileset scan.

use crate::error::{Result, UdfError};
use crate::types::{EntityId, LongAd, ShortAd, TagIdentifier};
use crate::utils::sector::{read_u16, read_u32, read_u64};
use crate::utils::string::decode_dstring;

/// ICB file type: directory
pub const FILE_TYPE_DIRECTORY: u8 = 4;
/// ICB file type: UDF 2.0 virtual allocation table
pub const FILE_TYPE_VAT20: u8 = 248;
/// ICB file type: metadata file
pub const FILE_TYPE_METADATA: u8 = 250;
/// ICB file type: metadata mirror file
pub const FILE_TYPE_METADATA_MIRROR: u8 = 251;
/// ICB file type: metadata bitmap file
pub const FILE_TYPE_METADATA_BITMAP: u8 = 252;

/// File Set Descriptor (4/14.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSetDescriptor {
    /// Logical volume identifier
    pub logical_volume: String,
    /// File set identifier
    pub identifier: String,
    /// Root directory ICB
    pub root: LongAd,
    /// Domain identifier
    pub domain: EntityId,
    /// Next file set extent
    pub next: LongAd,
}

impl FileSetDescriptor {
    /// Parse a validated File Set Descriptor block
    pub fn parse(block: &[u8]) -> Result<Self> {
        if block.len() < 480 {
            return Err(UdfError::MissingDescriptor("file set descriptor"));
        }
        Ok(Self {
            logical_volume: decode_dstring(&block[112..240]),
            identifier: decode_dstring(&block[304..336]),
            root: LongAd::parse(block, 400),
            domain: EntityId::parse(block, 416),
            next: LongAd::parse(block, 448),
        })
    }
}

/// Space Bitmap Descriptor size in blocks
///
/// The bitmap header is 24 bytes followed by `number_of_bytes` of bitmap.
pub fn space_bitmap_blocks(block: &[u8], block_size: u32) -> u64 {
    let bytes = read_u32(block, 20) as u64;
    (24 + bytes).div_ceil(block_size as u64).max(1)
}

/// Allocation descriptor flavour from the ICB tag flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationType {
    /// Short allocation descriptors
    Short,
    /// Long allocation descriptors
    Long,
    /// Extended allocation descriptors
    Extended,
    /// Data embedded in the entry
    Inline,
}

/// A contiguous piece of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileExtent {
    /// Partition-relative first block
    pub position: u32,
    /// Length in bytes
    pub length: u32,
    /// Partition reference, when the descriptor names one
    pub partition: Option<u16>,
    /// Extent type (0 recorded, 1 allocated, 2 unallocated)
    pub kind: u8,
}

/// Content of a file entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileData {
    /// Bytes stored inside the entry
    Inline(Vec<u8>),
    /// Extents listed by allocation descriptors
    Extents(Vec<FileExtent>),
}

/// File Entry or Extended File Entry (4/14.9, 4/14.17)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Parsed from an Extended File Entry
    pub extended: bool,
    /// ICB file type
    pub file_type: u8,
    /// Allocation descriptor flavour
    pub allocation: AllocationType,
    /// File size in bytes
    pub information_length: u64,
    /// File contents
    pub data: FileData,
}

impl FileEntry {
    /// Parse a validated (Extended) File Entry block
    ///
    /// # Arguments
    /// * `block` - Raw block
    /// * `identifier` - Tag identifier from validation
    /// * `location` - Block number, for error reporting
    pub fn parse(block: &[u8], identifier: TagIdentifier, location: u64) -> Result<Self> {
        let (extended, ea_offset) = match identifier {
            TagIdentifier::FileEntry => (false, 168),
            TagIdentifier::ExtendedFileEntry => (true, 208),
            _ => {
                return Err(UdfError::Corrupt {
                    block: location,
                    detail: format!("expected file entry, found {:?}", identifier),
                })
            }
        };
        if block.len() < ea_offset + 8 {
            return Err(UdfError::Corrupt {
                block: location,
                detail: "file entry truncated".into(),
            });
        }
        let ea_len = read_u32(block, ea_offset) as usize;
        let ad_len = read_u32(block, ea_offset + 4) as usize;
        let ad_start = ea_offset + 8 + ea_len;
        let ad_end = ad_start
            .checked_add(ad_len)
            .filter(|end| *end <= block.len())
            .ok_or_else(|| UdfError::Corrupt {
                block: location,
                detail: format!("allocation area {}+{} exceeds block", ea_len, ad_len),
            })?;
        let area = &block[ad_start..ad_end];

        let icb_flags = read_u16(block, 16 + 18);
        let allocation = match icb_flags & 0x7 {
            0 => AllocationType::Short,
            1 => AllocationType::Long,
            2 => AllocationType::Extended,
            _ => AllocationType::Inline,
        };
        let data = match allocation {
            AllocationType::Inline => FileData::Inline(area.to_vec()),
            AllocationType::Short => FileData::Extents(short_extents(area)),
            AllocationType::Long => FileData::Extents(long_extents(area)),
            AllocationType::Extended => {
                return Err(UdfError::Corrupt {
                    block: location,
                    detail: "extended allocation descriptors unsupported".into(),
                })
            }
        };

        Ok(Self {
            extended,
            file_type: block[16 + 11],
            allocation,
            information_length: read_u64(block, 56),
            data,
        })
    }

    /// Recorded extents, empty for inline data
    pub fn extents(&self) -> &[FileExtent] {
        match &self.data {
            FileData::Extents(extents) => extents,
            FileData::Inline(_) => &[],
        }
    }
}

// Extent type 3 continues in an allocation extent descriptor; that chain is
// not followed.
fn short_extents(area: &[u8]) -> Vec<FileExtent> {
    area.chunks_exact(ShortAd::SIZE)
        .map(|raw| ShortAd::parse(raw, 0))
        .take_while(|ad| ad.byte_length() != 0 && ad.length >> 30 != 3)
        .map(|ad| FileExtent {
            position: ad.position,
            length: ad.byte_length(),
            partition: None,
            kind: (ad.length >> 30) as u8,
        })
        .collect()
}

fn long_extents(area: &[u8]) -> Vec<FileExtent> {
    area.chunks_exact(LongAd::SIZE)
        .map(|raw| LongAd::parse(raw, 0))
        .take_while(|ad| ad.byte_length() != 0 && ad.length >> 30 != 3)
        .map(|ad| FileExtent {
            position: ad.location.block,
            length: ad.byte_length(),
            partition: Some(ad.location.partition),
            kind: (ad.length >> 30) as u8,
        })
        .collect()
}
