//! Descriptor tag parsing and validation
//!
//! A block is trusted as a descriptor only when its tag checksum, version,
//! CRC (when the CRC range fits the block) and, if the caller knows where
//! it read the block from, the recorded tag location all agree.
//!
//! Zero-filled or unrecorded blocks fail the version check with identifier
//! 0; those are reported as [`Classification::NotDescriptor`] so that a scan
//! over blank space never treats them as corruption.

use bitflags::bitflags;

use crate::types::{TagIdentifier, TAG_SIZE};
use crate::utils::checksum::{crc_itu_t, tag_checksum, TAG_CHECKSUM_OFFSET};
use crate::utils::sector::{read_u16, read_u32, write_u16, write_u32};

bitflags! {
    /// Reasons a tag was rejected
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TagFaults: u8 {
        /// Tag checksum mismatch
        const CHECKSUM = 1 << 0;
        /// Descriptor version other than 2 or 3
        const VERSION = 1 << 1;
        /// Payload CRC mismatch
        const CRC = 1 << 2;
        /// Recorded tag location differs from the block read
        const LOCATION = 1 << 3;
    }
}

/// Parsed descriptor tag (3/7.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTag {
    /// Descriptor kind
    pub identifier: TagIdentifier,
    /// Descriptor version (2 for NSR02, 3 for NSR03)
    pub version: u16,
    /// Recorded checksum byte
    pub checksum: u8,
    /// Tag serial number
    pub serial: u16,
    /// Recorded CRC
    pub crc: u16,
    /// Bytes after the tag covered by the CRC
    pub crc_length: u16,
    /// Block the descriptor claims to be recorded at
    pub location: u32,
}

/// Outcome of [`validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Every check passed
    Valid(DescriptorTag),
    /// Blank or unrecorded space
    NotDescriptor,
    /// A tagged block that failed at least one check
    Invalid {
        /// Identifier as recorded
        identifier: TagIdentifier,
        /// Failed checks
        faults: TagFaults,
    },
}

impl Classification {
    /// The tag, if the block is a trusted descriptor
    pub fn valid(self) -> Option<DescriptorTag> {
        match self {
            Self::Valid(tag) => Some(tag),
            _ => None,
        }
    }
}

impl DescriptorTag {
    /// Parse the first 16 bytes of `block`
    pub fn parse(block: &[u8]) -> Option<Self> {
        if block.len() < TAG_SIZE {
            return None;
        }
        Some(Self {
            identifier: TagIdentifier::from_u16(read_u16(block, 0)),
            version: read_u16(block, 2),
            checksum: block[TAG_CHECKSUM_OFFSET],
            serial: read_u16(block, 6),
            crc: read_u16(block, 8),
            crc_length: read_u16(block, 10),
            location: read_u32(block, 12),
        })
    }

    /// Tag for a new descriptor; CRC and checksum are filled in by [`seal`]
    pub fn new(identifier: TagIdentifier, serial: u16, location: u32) -> Self {
        Self {
            identifier,
            version: 3,
            checksum: 0,
            serial,
            crc: 0,
            crc_length: 0,
            location,
        }
    }

    /// Store the tag fields into the first 16 bytes of `block`
    pub fn write_to(&self, block: &mut [u8]) {
        write_u16(block, 0, self.identifier.as_u16());
        write_u16(block, 2, self.version);
        block[TAG_CHECKSUM_OFFSET] = self.checksum;
        block[5] = 0;
        write_u16(block, 6, self.serial);
        write_u16(block, 8, self.crc);
        write_u16(block, 10, self.crc_length);
        write_u32(block, 12, self.location);
    }
}

/// Classify a raw block as a descriptor
///
/// # Arguments
/// * `block` - Raw block contents
/// * `expected_location` - Block number the data was read from, when known
pub fn validate(block: &[u8], expected_location: Option<u32>) -> Classification {
    let Some(tag) = DescriptorTag::parse(block) else {
        return Classification::NotDescriptor;
    };

    let mut faults = TagFaults::empty();
    if tag_checksum(block) != tag.checksum {
        faults |= TagFaults::CHECKSUM;
    }
    if tag.version != 2 && tag.version != 3 {
        faults |= TagFaults::VERSION;
    }
    let crc_end = TAG_SIZE + tag.crc_length as usize;
    if crc_end <= block.len() && crc_itu_t(&block[TAG_SIZE..crc_end]) != tag.crc {
        faults |= TagFaults::CRC;
    }
    if let Some(expected) = expected_location {
        if tag.location != expected {
            faults |= TagFaults::LOCATION;
        }
    }

    if faults.is_empty() {
        Classification::Valid(tag)
    } else if tag.identifier.as_u16() == 0 && faults.contains(TagFaults::VERSION) {
        Classification::NotDescriptor
    } else {
        Classification::Invalid {
            identifier: tag.identifier,
            faults,
        }
    }
}

/// Recompute CRC and checksum of a descriptor in place
///
/// The CRC range is clipped to the block.
pub fn seal(block: &mut [u8], crc_length: usize) {
    let crc_length = crc_length.min(block.len().saturating_sub(TAG_SIZE));
    write_u16(block, 10, crc_length as u16);
    let crc = crc_itu_t(&block[TAG_SIZE..TAG_SIZE + crc_length]);
    write_u16(block, 8, crc);
    block[TAG_CHECKSUM_OFFSET] = tag_checksum(block);
}
