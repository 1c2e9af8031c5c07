//! Virtual partitions (UDF 2.2.8, 2.2.11)
//!
//! On write-once media every rewrite of a block goes to a new location and
//! the Virtual Allocation Table maps virtual block numbers to the current
//! one. The VAT's file entry is normally the last block written, which
//! drives report unreliably, so the search tries the last block and up to
//! three before it, then repeats from the device's own last block.

use tracing::{debug, info};

use crate::descriptor::file::{FileData, FileEntry, FILE_TYPE_VAT20};
use crate::device::UdfDevice;
use crate::error::{Result, UdfError};
use crate::media::MediaReader;
use crate::types::{TagIdentifier, IDENT_VAT_15};
use crate::utils::sector::{blocks_for_bytes, read_u16, read_u32};
use crate::utils::string::trim_identifier;

use super::{translate, PartitionKind, PartitionMap, ResolveContext};

/// Blocks before the last block that may hold the VAT file entry
const VAT_SEARCH_DEPTH: u64 = 3;

/// UDF 1.5 tables end with a 32-byte identifier and a 4-byte previous VAT location
const VAT15_TRAILER_SIZE: usize = 36;

/// VAT files larger than this are treated as corrupt
const VAT_MAX_SIZE: u64 = 64 << 20;

/// Unused VAT entry
const VAT_UNUSED: u32 = 0xFFFF_FFFF;

/// Virtual allocation table format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VatRevision {
    /// UDF 1.50: no header, trailer identifier
    V15,
    /// UDF 2.00+: header with `length_header`
    V20,
}

impl VatRevision {
    /// Format named by the partition map identifier suffix
    pub fn from_suffix(udf_revision: u16) -> Self {
        if udf_revision < 0x0200 {
            Self::V15
        } else {
            Self::V20
        }
    }
}

/// Virtual map payload and the loaded table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualTable {
    /// Table format
    pub revision: VatRevision,
    /// Index of the physical map the VAT lives on
    pub backing: Option<usize>,
    /// Byte offset of the first entry in the VAT file
    pub start_offset: u32,
    /// Absolute block of the VAT file entry
    pub file_entry_block: Option<u64>,
    /// Virtual block to backing-partition block
    pub entries: Vec<u32>,
}

impl VirtualTable {
    /// Empty table of the given format
    pub fn new(revision: VatRevision) -> Self {
        Self {
            revision,
            backing: None,
            start_offset: 0,
            file_entry_block: None,
            entries: Vec::new(),
        }
    }

    /// Backing map index and block for a virtual block
    pub fn lookup(&self, block: u32) -> Option<(usize, u32)> {
        let backing = self.backing?;
        match self.entries.get(block as usize) {
            Some(&entry) if entry != VAT_UNUSED => Some((backing, entry)),
            _ => None,
        }
    }
}

/// Locate and load the VAT for map `index`, backed by map `backing`
pub fn load<B: UdfDevice>(
    reader: &mut MediaReader<'_, B>,
    maps: &mut [PartitionMap],
    index: usize,
    backing: usize,
    ctx: &ResolveContext,
) -> Result<()> {
    let revision = match &maps[index].kind {
        PartitionKind::Virtual(vat) => vat.revision,
        _ => return Ok(()),
    };

    let mut found = find_vat_entry(reader, maps, backing, revision, ctx.last_block)?;
    if found.is_none() && ctx.last_block != ctx.device_last_block {
        info!(
            last = ctx.last_block,
            device_last = ctx.device_last_block,
            "VAT not found at the last recorded block, retrying from the device end"
        );
        found = find_vat_entry(reader, maps, backing, revision, ctx.device_last_block)?;
    }
    let Some((block, entry)) = found else {
        return Err(UdfError::MissingVat {
            near: ctx.last_block,
        });
    };

    let data = read_file_data(reader, maps, backing, &entry, block)?;
    let (start_offset, entries) = parse_table(revision, &data, block)?;
    debug!(
        block,
        ?revision,
        entries = entries.len(),
        "virtual allocation table loaded"
    );

    if let PartitionKind::Virtual(vat) = &mut maps[index].kind {
        vat.backing = Some(backing);
        vat.start_offset = start_offset;
        vat.file_entry_block = Some(block);
        vat.entries = entries;
    }
    Ok(())
}

/// Search `start` and up to three blocks before it, not below the partition root
fn find_vat_entry<B: UdfDevice>(
    reader: &mut MediaReader<'_, B>,
    maps: &[PartitionMap],
    backing: usize,
    revision: VatRevision,
    start: u64,
) -> Result<Option<(u64, FileEntry)>> {
    let root = maps[backing].root as u64;
    if start < root {
        return Ok(None);
    }
    let lowest = start.saturating_sub(VAT_SEARCH_DEPTH).max(root);

    for candidate in (lowest..=start).rev() {
        let Ok(relative) = u32::try_from(candidate - root) else {
            debug!(candidate, "VAT candidate beyond partition addressing");
            continue;
        };
        let block = translate(maps, backing as u16, relative, 0)?;
        let entry = reader.with_descriptor(block, Some(relative), |tag, data| {
            match tag.identifier {
                TagIdentifier::FileEntry | TagIdentifier::ExtendedFileEntry => {
                    FileEntry::parse(data, tag.identifier, block).map(Some)
                }
                _ => Ok(None),
            }
        });
        match entry {
            Ok(Some(Some(fe))) if revision == VatRevision::V15 || fe.file_type == FILE_TYPE_VAT20 => {
                return Ok(Some((block, fe)));
            }
            Ok(_) => {}
            Err(err) if err.is_recoverable() => debug!(candidate, %err, "VAT candidate unusable"),
            Err(err) => return Err(err),
        }
    }
    Ok(None)
}

/// Collect a file's bytes, inline or through its extents on the backing map
pub(super) fn read_file_data<B: UdfDevice>(
    reader: &mut MediaReader<'_, B>,
    maps: &[PartitionMap],
    backing: usize,
    entry: &FileEntry,
    location: u64,
) -> Result<Vec<u8>> {
    if entry.information_length > VAT_MAX_SIZE {
        return Err(UdfError::Corrupt {
            block: location,
            detail: format!("file of {} bytes", entry.information_length),
        });
    }
    let length = entry.information_length as usize;
    let extents = match &entry.data {
        FileData::Inline(data) => return Ok(data[..length.min(data.len())].to_vec()),
        FileData::Extents(extents) => extents,
    };

    let mut out = Vec::new();
    out.try_reserve(length)
        .map_err(|_| UdfError::OutOfMemory("virtual allocation table"))?;
    let bs = reader.block_size();
    for extent in extents {
        let blocks = blocks_for_bytes(extent.length as u64, bs) as u32;
        for i in 0..blocks {
            if out.len() >= length {
                break;
            }
            let block = translate(maps, backing as u16, extent.position, i)?;
            let want = (length - out.len()).min(bs as usize);
            reader.with_block(block, |data| out.extend_from_slice(&data[..want.min(data.len())]))?;
        }
    }
    if out.len() < length {
        return Err(UdfError::Corrupt {
            block: location,
            detail: format!("file extents cover {} of {} bytes", out.len(), length),
        });
    }
    Ok(out)
}

fn parse_table(revision: VatRevision, data: &[u8], location: u64) -> Result<(u32, Vec<u32>)> {
    let (start, end) = match revision {
        VatRevision::V15 => {
            if data.len() < VAT15_TRAILER_SIZE {
                return Err(UdfError::Corrupt {
                    block: location,
                    detail: "VAT shorter than its trailer".into(),
                });
            }
            let trailer = data.len() - VAT15_TRAILER_SIZE;
            if trim_identifier(&data[trailer + 1..trailer + 24]) != IDENT_VAT_15.as_bytes() {
                debug!(location, "VAT 1.5 trailer identifier mismatch");
            }
            (0, trailer)
        }
        VatRevision::V20 => {
            if data.len() < 2 {
                return Err(UdfError::Corrupt {
                    block: location,
                    detail: "VAT header truncated".into(),
                });
            }
            let header = read_u16(data, 0) as usize;
            if header > data.len() {
                return Err(UdfError::Corrupt {
                    block: location,
                    detail: format!("VAT header length {} exceeds file", header),
                });
            }
            (header, data.len())
        }
    };
    let entries = data[start..end]
        .chunks_exact(4)
        .map(|raw| read_u32(raw, 0))
        .collect();
    Ok((start as u32, entries))
}
