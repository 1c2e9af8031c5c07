//! Metadata partitions (UDF 2.2.10)
//!
//! UDF 2.50+ keeps file system metadata inside a metadata file on the
//! backing physical partition, optionally duplicated in a mirror file.
//! Metadata partition block `n` is block `n` of the metadata file.

use tracing::{debug, warn};

use crate::descriptor::file::{
    FileData, FileEntry, FileExtent, FILE_TYPE_METADATA, FILE_TYPE_METADATA_BITMAP,
    FILE_TYPE_METADATA_MIRROR,
};
use crate::device::UdfDevice;
use crate::error::{Result, UdfError};
use crate::media::MediaReader;
use crate::types::{TagIdentifier, NO_LOCATION};
use crate::utils::sector::{blocks_for_bytes, read_u16, read_u32};

use super::{translate, PartitionKind, PartitionMap, ResolveContext};

/// A run of metadata file blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataExtent {
    /// First metadata file block covered
    pub file_block: u32,
    /// Blocks covered
    pub blocks: u32,
    /// First backing-partition block
    pub position: u32,
}

/// Metadata map payload and the loaded file layouts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPartition {
    /// Metadata file entry (backing-partition block)
    pub file_location: u32,
    /// Mirror file entry
    pub mirror_location: u32,
    /// Bitmap file entry, [`NO_LOCATION`] when absent
    pub bitmap_location: u32,
    /// Allocation unit size in blocks
    pub allocation_unit: u32,
    /// Alignment unit size in blocks
    pub alignment_unit: u16,
    /// Mirror holds a duplicate of the metadata
    pub duplicate: bool,
    /// Index of the direct map the files live on
    pub backing: Option<usize>,
    /// Metadata file layout
    pub main: Option<Vec<MetadataExtent>>,
    /// Mirror file layout
    pub mirror: Option<Vec<MetadataExtent>>,
    /// Bitmap file layout
    pub bitmap: Option<Vec<MetadataExtent>>,
}

impl MetadataPartition {
    /// Decode bytes 40..64 of a metadata partition map
    pub fn from_map_payload(payload: &[u8; 24]) -> Self {
        Self {
            file_location: read_u32(payload, 0),
            mirror_location: read_u32(payload, 4),
            bitmap_location: read_u32(payload, 8),
            allocation_unit: read_u32(payload, 12),
            alignment_unit: read_u16(payload, 16),
            duplicate: payload[18] & 0x01 != 0,
            backing: None,
            main: None,
            mirror: None,
            bitmap: None,
        }
    }

    /// Backing map index and block for a metadata block
    ///
    /// The metadata file is used when loaded, otherwise the mirror.
    pub fn lookup(&self, block: u32) -> Option<(usize, u32)> {
        let backing = self.backing?;
        let layout = self.main.as_ref().or(self.mirror.as_ref())?;
        layout
            .iter()
            .find(|e| block >= e.file_block && block - e.file_block < e.blocks)
            .map(|e| (backing, e.position + (block - e.file_block)))
    }
}

/// Load the metadata, mirror and bitmap files for map `index`
///
/// # Errors
/// `MissingMetadataFiles` when neither metadata nor mirror file loads;
/// `MissingMetadataBitmap` when the bitmap is recorded but unreadable on a
/// read-write mount.
pub fn load<B: UdfDevice>(
    reader: &mut MediaReader<'_, B>,
    maps: &mut [PartitionMap],
    index: usize,
    backing: usize,
    ctx: &ResolveContext,
) -> Result<()> {
    let PartitionKind::Metadata(meta) = &maps[index].kind else {
        return Ok(());
    };
    let meta = meta.clone();
    let number = maps[index].number;

    let mut backing = backing;
    let mut main = find_file(reader, maps, backing, meta.file_location, FILE_TYPE_METADATA, ctx)?;
    if main.is_none() {
        // Some encoders record the wrong partition number in the metadata map
        let fallback = maps.iter().position(|m| m.kind.is_direct());
        if let Some(alt) = fallback.filter(|alt| *alt != backing) {
            warn!(
                partition = number,
                recorded = backing,
                retry = alt,
                "metadata file not found, retrying on the first physical partition"
            );
            main = find_file(reader, maps, alt, meta.file_location, FILE_TYPE_METADATA, ctx)?;
            if main.is_some() {
                backing = alt;
            }
        }
    }

    let mirror = if meta.mirror_location != meta.file_location || main.is_none() {
        find_file(reader, maps, backing, meta.mirror_location, FILE_TYPE_METADATA_MIRROR, ctx)?
    } else {
        None
    };
    if main.is_none() && mirror.is_none() {
        return Err(UdfError::MissingMetadataFiles { partition: number });
    }
    if main.is_none() {
        warn!(partition = number, "metadata file missing, using mirror");
    }

    let bitmap = if meta.bitmap_location != NO_LOCATION {
        let found = find_file(
            reader,
            maps,
            backing,
            meta.bitmap_location,
            FILE_TYPE_METADATA_BITMAP,
            ctx,
        )?;
        if found.is_none() {
            if !ctx.read_only {
                return Err(UdfError::MissingMetadataBitmap { partition: number });
            }
            warn!(partition = number, "metadata bitmap missing, tolerated on read-only mount");
        }
        found
    } else {
        None
    };

    debug!(
        partition = number,
        main = main.is_some(),
        mirror = mirror.is_some(),
        bitmap = bitmap.is_some(),
        "metadata partition loaded"
    );
    if let PartitionKind::Metadata(meta) = &mut maps[index].kind {
        meta.backing = Some(backing);
        meta.main = main;
        meta.mirror = mirror;
        meta.bitmap = bitmap;
    }
    Ok(())
}

/// Read a metadata-family file entry and convert its extents
fn find_file<B: UdfDevice>(
    reader: &mut MediaReader<'_, B>,
    maps: &[PartitionMap],
    backing: usize,
    location: u32,
    file_type: u8,
    ctx: &ResolveContext,
) -> Result<Option<Vec<MetadataExtent>>> {
    if location == NO_LOCATION {
        return Ok(None);
    }
    let block = translate(maps, backing as u16, location, 0)?;
    let entry = reader.with_descriptor(block, Some(location), |tag, data| match tag.identifier {
        TagIdentifier::FileEntry | TagIdentifier::ExtendedFileEntry => {
            FileEntry::parse(data, tag.identifier, block).map(Some)
        }
        _ => Ok(None),
    });
    let entry = match entry {
        Ok(Some(Some(entry))) => entry,
        Ok(_) => return Ok(None),
        Err(err) if err.is_recoverable() => {
            debug!(location, %err, "metadata file entry unusable");
            return Ok(None);
        }
        Err(err) => return Err(err),
    };
    if entry.file_type != file_type {
        debug!(location, found = entry.file_type, expected = file_type, "wrong metadata file type");
        return Ok(None);
    }
    let FileData::Extents(extents) = &entry.data else {
        debug!(location, "metadata file with inline data");
        return Ok(None);
    };
    Ok(Some(layout(extents, ctx.block_size)))
}

fn layout(extents: &[FileExtent], block_size: u32) -> Vec<MetadataExtent> {
    let mut file_block = 0u32;
    let mut out = Vec::with_capacity(extents.len());
    for extent in extents {
        let blocks = blocks_for_bytes(extent.length as u64, block_size) as u32;
        // only recorded extents map to data
        if extent.kind == 0 {
            out.push(MetadataExtent {
                file_block,
                blocks,
                position: extent.position,
            });
        }
        file_block = file_block.saturating_add(blocks);
    }
    out
}
