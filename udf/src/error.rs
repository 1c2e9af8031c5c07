//! Error types for UDF mount operations
//!
//! Every failure carries one [`ErrorKind`], which decides how the mount
//! pipeline reacts to it:
//!
//! | Kind | Reaction | errno |
//! |------|----------|-------|
//! | `TransientIo` | next candidate / reserve sequence | `EIO` |
//! | `Structural` | reserve sequence, next anchor candidate | `EINVAL` / `EIO` |
//! | `Configuration` | mount fails, no fallback | `EIO` / `EINVAL` |
//! | `Resource` | mount fails, state released | `ENOMEM` |
//! | `Access` | mount fails, caller may retry read-only | `EACCES` |

use thiserror::Error;

/// Result type for UDF operations
pub type Result<T> = core::result::Result<T, UdfError>;

/// Coarse classification of a [`UdfError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Device timeout or read failure
    TransientIo,
    /// Checksum/CRC/version failures, missing or inconsistent descriptors
    Structural,
    /// Malformed partition tables, bad packet lengths, bad options
    Configuration,
    /// Allocation failure while building partition or cache tables
    Resource,
    /// The medium cannot be mounted with the requested access mode
    Access,
}

/// Errors that can occur while recognising or mounting a UDF volume
#[derive(Debug, Error)]
pub enum UdfError {
    /// Device read or write failed
    #[error("I/O error at block {block}: {detail}")]
    Io {
        /// Logical block of the failed transfer
        block: u64,
        /// Device error text
        detail: String,
    },

    /// Device read failed after exceeding the wall-clock read budget
    #[error("read of block {block} timed out after {elapsed_ms} ms")]
    Timeout {
        /// Logical block of the failed read
        block: u64,
        /// Time the read took
        elapsed_ms: u64,
    },

    /// Block lies past the end of the device
    #[error("block {block} beyond end of device ({blocks} blocks)")]
    OutOfRange {
        /// Requested logical block
        block: u64,
        /// Device size in logical blocks
        blocks: u64,
    },

    /// No NSR identifier in the volume recognition sequence
    #[error("no UDF volume recognition sequence found")]
    NotUdf,

    /// No anchor candidate yielded a usable descriptor sequence
    #[error("no anchor volume descriptor pointer found")]
    NoAnchor,

    /// Descriptor present but its contents are inconsistent
    #[error("corrupt metadata at block {block}: {detail}")]
    Corrupt {
        /// Block holding the descriptor
        block: u64,
        /// What is inconsistent
        detail: String,
    },

    /// A mandatory descriptor was not recorded
    #[error("{0} not found")]
    MissingDescriptor(&'static str),

    /// Neither the metadata file nor its mirror could be loaded
    #[error("metadata partition {partition}: neither metadata file nor mirror found")]
    MissingMetadataFiles {
        /// Partition number of the metadata map
        partition: u16,
    },

    /// Metadata bitmap file missing on a read-write mount
    #[error("metadata partition {partition}: bitmap file not found")]
    MissingMetadataBitmap {
        /// Partition number of the metadata map
        partition: u16,
    },

    /// Virtual allocation table could not be located
    #[error("virtual allocation table not found near block {near}")]
    MissingVat {
        /// Last block estimate the search started from
        near: u64,
    },

    /// No File Set Descriptor on any partition
    #[error("no file set descriptor found")]
    NoFileset,

    /// Logical volume declares no partitions
    #[error("no partition found")]
    NoPartitions,

    /// Minimum UDF read revision newer than supported
    #[error("minimum read revision {found:#06x} exceeds supported {supported:#06x}")]
    UnsupportedReadRevision {
        /// Minimum read revision recorded on the volume
        found: u16,
        /// Newest revision this crate reads
        supported: u16,
    },

    /// Requested access mode is incompatible with the medium
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Partition reference does not name a loaded partition map
    #[error("partition reference {0} out of range")]
    BadPartitionRef(u16),

    /// Block has no translation in the given partition
    #[error("block {block} not mapped in partition {partition}")]
    Unmapped {
        /// Partition reference
        partition: u16,
        /// Partition-relative block
        block: u32,
    },

    /// Sparing packet length is not a power of two
    #[error("invalid sparing packet length {0}")]
    InvalidPacketLength(u16),

    /// More sparing tables than the map format allows
    #[error("too many sparing tables ({0})")]
    TooManySparingTables(u8),

    /// Sparing table larger than one block
    #[error("sparing table size {size} exceeds block size {block_size}")]
    SparingTableTooLarge {
        /// Recorded table size in bytes
        size: u32,
        /// Logical block size
        block_size: u32,
    },

    /// Partition map table does not fit the logical volume descriptor
    #[error("partition map table length {length} exceeds {max}")]
    PartitionTableTooLong {
        /// Recorded table length in bytes
        length: u32,
        /// Room left in the descriptor
        max: u32,
    },

    /// Partition map entry overruns the table or has a bogus length
    #[error("malformed partition map at table offset {offset}")]
    MalformedPartitionMap {
        /// Byte offset of the entry within the table
        offset: usize,
    },

    /// Block size unsupported or incompatible with the device
    #[error("invalid block size {0}")]
    InvalidBlockSize(u32),

    /// Mount option could not be parsed
    #[error("invalid mount option `{0}`")]
    InvalidOption(String),

    /// Allocation failure
    #[error("out of memory allocating {0}")]
    OutOfMemory(&'static str),
}

impl UdfError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::Timeout { .. } | Self::OutOfRange { .. } => {
                ErrorKind::TransientIo
            }
            Self::NotUdf
            | Self::NoAnchor
            | Self::Corrupt { .. }
            | Self::MissingDescriptor(_)
            | Self::MissingMetadataFiles { .. }
            | Self::MissingMetadataBitmap { .. }
            | Self::MissingVat { .. }
            | Self::NoFileset
            | Self::NoPartitions
            | Self::UnsupportedReadRevision { .. }
            | Self::BadPartitionRef(_)
            | Self::Unmapped { .. } => ErrorKind::Structural,
            Self::InvalidPacketLength(_)
            | Self::TooManySparingTables(_)
            | Self::SparingTableTooLarge { .. }
            | Self::PartitionTableTooLong { .. }
            | Self::MalformedPartitionMap { .. }
            | Self::InvalidBlockSize(_)
            | Self::InvalidOption(_) => ErrorKind::Configuration,
            Self::OutOfMemory(_) => ErrorKind::Resource,
            Self::AccessDenied(_) => ErrorKind::Access,
        }
    }

    /// Whether the pipeline may try another sequence or anchor candidate
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientIo | ErrorKind::Structural)
    }

    /// POSIX errno for this error
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io { .. }
            | Self::Timeout { .. }
            | Self::OutOfRange { .. }
            | Self::Corrupt { .. }
            | Self::MissingDescriptor(_)
            | Self::MissingMetadataFiles { .. }
            | Self::MissingMetadataBitmap { .. }
            | Self::MissingVat { .. }
            | Self::Unmapped { .. }
            | Self::InvalidPacketLength(_)
            | Self::TooManySparingTables(_)
            | Self::SparingTableTooLarge { .. }
            | Self::PartitionTableTooLong { .. }
            | Self::MalformedPartitionMap { .. } => libc::EIO,
            Self::NotUdf
            | Self::NoAnchor
            | Self::NoFileset
            | Self::NoPartitions
            | Self::UnsupportedReadRevision { .. }
            | Self::BadPartitionRef(_)
            | Self::InvalidBlockSize(_)
            | Self::InvalidOption(_) => libc::EINVAL,
            Self::OutOfMemory(_) => libc::ENOMEM,
            Self::AccessDenied(_) => libc::EACCES,
        }
    }
}
