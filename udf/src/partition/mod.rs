//! Partition map resolution and address translation
//!
//! The logical volume descriptor lists partition maps; partition descriptors
//! give the physical extent behind each partition number. A map entry is
//! one of:
//!
//! | Kind | Translation |
//! |------|-------------|
//! | Physical | `root + block + offset` |
//! | Sparable | sparing table lookup, else physical |
//! | Virtual | VAT entry, then the backing physical map |
//! | Metadata | metadata file extents, then the backing physical map |
//!
//! Virtual and metadata maps share their partition number with a physical
//! or sparable map and can only be loaded after it, so partition
//! descriptors are applied in two steps by [`apply_descriptor`].

pub mod metadata;
pub mod sparing;
pub mod virtual_table;

use tracing::{debug, warn};

use crate::descriptor::volume::{
    AccessType, LogicalVolumeDescriptor, PartitionDescriptor, PartitionHeader, RawPartitionMap,
};
use crate::device::UdfDevice;
use crate::error::{Result, UdfError};
use crate::media::MediaReader;
use crate::types::{
    IDENT_METADATA_PARTITION, IDENT_SPARABLE_PARTITION, IDENT_VIRTUAL_PARTITION,
    PARTITION_CONTENTS_NSR02, PARTITION_CONTENTS_NSR03,
};
use crate::utils::sector::read_u32;

pub use metadata::MetadataPartition;
pub use sparing::{SparingEntry, SparingTable};
pub use virtual_table::{VatRevision, VirtualTable};

/// Kind-specific part of a partition map
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionKind {
    /// Type 1 map
    Physical,
    /// Rewritable media with packet remapping
    Sparable(SparingTable),
    /// Write-once media addressed through a VAT
    Virtual(VirtualTable),
    /// Metadata stored in a file on the backing partition
    Metadata(MetadataPartition),
    /// Map type this implementation does not handle
    Unknown,
}

impl PartitionKind {
    /// Physical and sparable maps address the medium directly
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Physical | Self::Sparable(_))
    }

    /// Virtual and metadata maps sit on top of a direct map
    pub fn is_layered(&self) -> bool {
        matches!(self, Self::Virtual(_) | Self::Metadata(_))
    }
}

/// One resolved partition map entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMap {
    /// Partition number shared with the partition descriptor
    pub number: u16,
    /// Volume sequence number
    pub volume_sequence: u16,
    /// First block of the partition
    pub root: u32,
    /// Length in blocks
    pub length: u32,
    /// Access type from the partition descriptor
    pub access: AccessType,
    /// Space management header, for NSR partitions
    pub header: Option<PartitionHeader>,
    /// A partition descriptor was applied to this map
    pub described: bool,
    /// Kind-specific state
    pub kind: PartitionKind,
}

impl PartitionMap {
    fn new(number: u16, volume_sequence: u16, kind: PartitionKind) -> Self {
        Self {
            number,
            volume_sequence,
            root: 0,
            length: 0,
            access: AccessType::Unspecified,
            header: None,
            described: false,
            kind,
        }
    }

    /// Whether this partition can take writes
    pub fn is_writable(&self) -> bool {
        if matches!(self.kind, PartitionKind::Virtual(_)) {
            return false;
        }
        if self.access != AccessType::Overwritable {
            return false;
        }
        match &self.header {
            Some(header) => {
                let allocation_info = header.unallocated_bitmap.byte_length() != 0
                    || header.unallocated_table.byte_length() != 0;
                let needs_erase = header.freed_bitmap.byte_length() != 0
                    || header.freed_table.byte_length() != 0;
                allocation_info && !needs_erase
            }
            None => false,
        }
    }
}

/// Mount-wide inputs for partition loading
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext {
    /// Mount is read-only
    pub read_only: bool,
    /// Logical block size
    pub block_size: u32,
    /// Last recorded block estimate
    pub last_block: u64,
    /// Last block of the device
    pub device_last_block: u64,
}

/// Turn the logical volume's raw map table into partition maps
///
/// # Errors
/// Configuration errors from sparable map validation; `OutOfMemory` when
/// the map list cannot be allocated.
pub fn resolve_maps(lvd: &LogicalVolumeDescriptor, block_size: u32) -> Result<Vec<PartitionMap>> {
    let mut maps = Vec::new();
    maps.try_reserve(lvd.maps.len())
        .map_err(|_| UdfError::OutOfMemory("partition maps"))?;

    for raw in &lvd.maps {
        let map = match raw {
            RawPartitionMap::Type1 {
                volume_sequence,
                partition_number,
            } => PartitionMap::new(*partition_number, *volume_sequence, PartitionKind::Physical),
            RawPartitionMap::Type2 {
                ident,
                volume_sequence,
                partition_number,
                payload,
            } => {
                let kind = if ident.matches(IDENT_SPARABLE_PARTITION) {
                    PartitionKind::Sparable(SparingTable::from_map_payload(payload, block_size)?)
                } else if ident.matches(IDENT_VIRTUAL_PARTITION) {
                    PartitionKind::Virtual(VirtualTable::new(VatRevision::from_suffix(
                        ident.udf_revision(),
                    )))
                } else if ident.matches(IDENT_METADATA_PARTITION) {
                    PartitionKind::Metadata(MetadataPartition::from_map_payload(payload))
                } else {
                    debug!(ident = %ident.name(), "unknown type 2 partition map");
                    PartitionKind::Unknown
                };
                PartitionMap::new(*partition_number, *volume_sequence, kind)
            }
            RawPartitionMap::Other { map_type } => {
                debug!(map_type, "unknown partition map type");
                PartitionMap::new(u16::MAX, 0, PartitionKind::Unknown)
            }
        };
        maps.push(map);
    }
    Ok(maps)
}

/// Load every sparable map's tables
pub fn load_sparing_tables<B: UdfDevice>(
    reader: &mut MediaReader<'_, B>,
    maps: &mut [PartitionMap],
) -> Result<()> {
    for map in maps.iter_mut() {
        if let PartitionKind::Sparable(table) = &mut map.kind {
            table.load(reader)?;
        }
    }
    Ok(())
}

fn fill_from_descriptor(map: &mut PartitionMap, pd: &PartitionDescriptor) {
    map.root = pd.start;
    map.length = pd.length;
    map.access = pd.access;
    map.header = (pd.contents.matches(PARTITION_CONTENTS_NSR02)
        || pd.contents.matches(PARTITION_CONTENTS_NSR03))
    .then_some(pd.header);
    map.described = true;
    debug!(
        partition = pd.number,
        root = pd.start,
        length = pd.length,
        access = ?pd.access,
        "partition descriptor applied"
    );
}

/// Check that a partition fits the requested access mode
///
/// # Returns
/// `true` when the partition makes the volume write-incompatible on a
/// read-only mount.
fn check_access(map: &PartitionMap, read_only: bool) -> Result<bool> {
    if map.is_writable() {
        return Ok(false);
    }
    if !read_only {
        return Err(UdfError::AccessDenied(format!(
            "partition {} ({:?}) cannot be mounted read-write",
            map.number, map.access
        )));
    }
    Ok(true)
}

/// Apply one partition descriptor to the maps naming its partition number
///
/// The direct (physical/sparable) map is filled first; a virtual or
/// metadata map with the same number is then filled and loaded on top of
/// it.
///
/// # Returns
/// Whether the volume must be treated as write-incompatible.
pub fn apply_descriptor<B: UdfDevice>(
    reader: &mut MediaReader<'_, B>,
    maps: &mut [PartitionMap],
    pd: &PartitionDescriptor,
    ctx: &ResolveContext,
) -> Result<bool> {
    let Some(direct) = maps
        .iter()
        .position(|m| m.number == pd.number && m.kind.is_direct())
    else {
        debug!(partition = pd.number, "partition descriptor without a map");
        return Ok(false);
    };
    fill_from_descriptor(&mut maps[direct], pd);
    let mut incompatible = check_access(&maps[direct], ctx.read_only)?;

    let Some(layered) = maps
        .iter()
        .position(|m| m.number == pd.number && m.kind.is_layered())
    else {
        return Ok(incompatible);
    };
    fill_from_descriptor(&mut maps[layered], pd);

    if matches!(maps[layered].kind, PartitionKind::Metadata(_)) {
        metadata::load(reader, maps, layered, direct, ctx)?;
    } else {
        if !ctx.read_only {
            return Err(UdfError::AccessDenied(format!(
                "virtual partition {} requires a read-only mount",
                pd.number
            )));
        }
        incompatible = true;
        virtual_table::load(reader, maps, layered, direct, ctx)?;
    }
    Ok(incompatible)
}

/// Translate a partition-relative block to an absolute block
///
/// # Arguments
/// * `maps` - Partition maps of the volume
/// * `partition` - Partition reference (index into `maps`)
/// * `block` - Block within the partition
/// * `offset` - Additional block offset
pub fn translate(maps: &[PartitionMap], partition: u16, block: u32, offset: u32) -> Result<u64> {
    let map = maps
        .get(partition as usize)
        .ok_or(UdfError::BadPartitionRef(partition))?;
    let relative = block.checked_add(offset).ok_or(UdfError::Unmapped { partition, block })?;

    match &map.kind {
        PartitionKind::Physical => Ok(map.root as u64 + relative as u64),
        PartitionKind::Sparable(table) => Ok(match table.lookup(relative) {
            Some(mapped) => mapped as u64,
            None => map.root as u64 + relative as u64,
        }),
        PartitionKind::Virtual(vat) => {
            let (backing, target) = vat
                .lookup(relative)
                .ok_or(UdfError::Unmapped { partition, block })?;
            translate_direct(maps, backing, target, partition, block)
        }
        PartitionKind::Metadata(meta) => {
            let (backing, target) = meta
                .lookup(relative)
                .ok_or(UdfError::Unmapped { partition, block })?;
            translate_direct(maps, backing, target, partition, block)
        }
        PartitionKind::Unknown => Err(UdfError::Unmapped { partition, block }),
    }
}

fn translate_direct(
    maps: &[PartitionMap],
    backing: usize,
    target: u32,
    partition: u16,
    block: u32,
) -> Result<u64> {
    match maps.get(backing) {
        Some(map) if map.kind.is_direct() => translate(maps, backing as u16, target, 0),
        _ => Err(UdfError::Unmapped { partition, block }),
    }
}

/// Count free blocks recorded in a partition's unallocated space bitmap
///
/// # Returns
/// `None` when the partition has no bitmap.
pub fn count_bitmap_free<B: UdfDevice>(
    reader: &mut MediaReader<'_, B>,
    maps: &[PartitionMap],
    partition: u16,
) -> Result<Option<u64>> {
    let map = maps
        .get(partition as usize)
        .ok_or(UdfError::BadPartitionRef(partition))?;
    let Some(header) = map.header.filter(|h| h.unallocated_bitmap.byte_length() != 0) else {
        return Ok(None);
    };
    let first = header.unallocated_bitmap.position;
    let bs = reader.block_size() as usize;

    // Space Bitmap Descriptor: 24 byte header, then one bit per block
    let header_block = translate(maps, partition, first, 0)?;
    let (bits, bytes) = reader.with_block(header_block, |data| {
        (read_u32(data, 16) as u64, read_u32(data, 20) as u64)
    })?;
    let bytes = bytes.min(bits.div_ceil(8));

    let mut free = 0u64;
    let mut remaining = bytes;
    let mut skip = 24usize;
    let mut index = 0u32;
    while remaining > 0 {
        let block = translate(maps, partition, first, index)?;
        let take = ((bs - skip) as u64).min(remaining) as usize;
        free += reader.with_block(block, |data| {
            data[skip..skip + take]
                .iter()
                .map(|b| b.count_ones() as u64)
                .sum::<u64>()
        })?;
        remaining -= take as u64;
        skip = 0;
        index += 1;
    }
    if free > bits {
        warn!(partition, free, bits, "space bitmap has bits set past its end");
        free = bits;
    }
    Ok(Some(free))
}
