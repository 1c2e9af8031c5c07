//! Volume Descriptor Sequence processing (ECMA-167 3/8.4)
//!
//! The walk goes block by block: anything that is not a trusted descriptor
//! is skipped, and each descriptor kind keeps the block with the highest
//! sequence number ("last writer wins"). Partition descriptors are kept per
//! partition number. Once the walk is done the winning descriptors are
//! re-read and applied in dependency order: primary, logical volume (maps,
//! sparing tables), then partition descriptors by ascending address.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace, warn};

use crate::descriptor::volume::{
    sequence_number, LogicalVolumeDescriptor, PartitionDescriptor, PrimaryVolumeDescriptor,
    VolumeDescriptorPointer,
};
use crate::device::UdfDevice;
use crate::error::{Result, UdfError};
use crate::media::MediaReader;
use crate::options::MountOptions;
use crate::partition::{apply_descriptor, load_sparing_tables, resolve_maps, PartitionMap, ResolveContext};
use crate::types::{EntityId, ExtentAd, TagIdentifier, IDENT_OSTA_COMPLIANT, MAX_DESCRIPTOR_POINTERS};
use crate::utils::sector::read_u16;

/// Entity identifier flag: contents may have been modified by a non-conforming writer
const ENTITY_FLAG_DIRTY: u8 = 0x01;
/// Domain flag: hard write protect
const DOMAIN_HARD_WRITE_PROTECT: u8 = 0x01;
/// Domain flag: soft write protect
const DOMAIN_SOFT_WRITE_PROTECT: u8 = 0x02;

/// Which copy of the sequence was used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    /// Main volume descriptor sequence
    Main,
    /// Reserve volume descriptor sequence
    Reserve,
}

/// Winning block of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRecord {
    /// Logical block
    pub block: u64,
    /// Volume descriptor sequence number
    pub sequence: u32,
}

fn offer(slot: &mut Option<SlotRecord>, record: SlotRecord) {
    if slot.map_or(true, |current| record.sequence >= current.sequence) {
        *slot = Some(record);
    }
}

/// Descriptor slots collected by one walk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceSlots {
    /// Primary Volume Descriptor
    pub primary: Option<SlotRecord>,
    /// Logical Volume Descriptor
    pub logical_volume: Option<SlotRecord>,
    /// Unallocated Space Descriptor
    pub unallocated_space: Option<SlotRecord>,
    /// Implementation Use Volume Descriptor
    pub implementation_use: Option<SlotRecord>,
    /// Last Volume Descriptor Pointer seen
    pub pointer: Option<SlotRecord>,
    /// Terminating Descriptor that ended the walk
    pub terminating: Option<SlotRecord>,
    /// Partition descriptors by partition number
    pub partitions: BTreeMap<u16, SlotRecord>,
}

impl SequenceSlots {
    /// Partition descriptor blocks in ascending address order
    pub fn partition_blocks(&self) -> Vec<u64> {
        let mut blocks: Vec<u64> = self.partitions.values().map(|r| r.block).collect();
        blocks.sort_unstable();
        blocks
    }

    fn offer_partition(&mut self, number: u16, record: SlotRecord) {
        let slot = self.partitions.entry(number).or_insert(record);
        if record.sequence >= slot.sequence {
            *slot = record;
        }
    }
}

enum Entry {
    Pointer(VolumeDescriptorPointer),
    Terminating,
    Primary(u32),
    LogicalVolume(u32),
    UnallocatedSpace(u32),
    ImplementationUse(u32),
    Partition { number: u16, sequence: u32 },
    Other(TagIdentifier),
}

fn read_entry<B: UdfDevice>(reader: &mut MediaReader<'_, B>, block: u64) -> Result<Option<Entry>> {
    let Ok(location) = u32::try_from(block) else {
        return Ok(None);
    };
    reader.with_descriptor(block, Some(location), |tag, data| {
        Ok(match tag.identifier {
            TagIdentifier::VolumePointer => Entry::Pointer(VolumeDescriptorPointer::parse(data)?),
            TagIdentifier::Terminating => Entry::Terminating,
            TagIdentifier::PrimaryVolume => Entry::Primary(sequence_number(data)),
            TagIdentifier::LogicalVolume => Entry::LogicalVolume(sequence_number(data)),
            TagIdentifier::UnallocatedSpace => Entry::UnallocatedSpace(sequence_number(data)),
            TagIdentifier::ImplementationUse => Entry::ImplementationUse(sequence_number(data)),
            TagIdentifier::Partition => Entry::Partition {
                number: read_u16(data, 22),
                sequence: sequence_number(data),
            },
            other => Entry::Other(other),
        })
    })
}

/// First and last block of an extent, `None` when it holds no whole block
fn span(extent: ExtentAd, block_size: u32) -> Option<(u64, u64)> {
    let blocks = extent.length as u64 / block_size as u64;
    (blocks > 0).then(|| (extent.location as u64, extent.location as u64 + blocks - 1))
}

/// Walk one sequence extent, following pointers
pub fn walk<B: UdfDevice>(reader: &mut MediaReader<'_, B>, extent: ExtentAd) -> Result<SequenceSlots> {
    let bs = reader.block_size();
    let mut slots = SequenceSlots::default();
    let Some((mut block, mut end)) = span(extent, bs) else {
        debug!(location = extent.location, length = extent.length, "empty descriptor sequence");
        return Ok(slots);
    };
    let mut pending: Option<ExtentAd> = None;
    let mut followed = BTreeSet::new();
    let mut redirects = 0usize;

    loop {
        let mut finished = block > end;
        if !finished {
            match read_entry(reader, block) {
                Ok(Some(entry)) => {
                    let record = |sequence| SlotRecord { block, sequence };
                    match entry {
                        Entry::Pointer(vdp) => {
                            offer(&mut slots.pointer, record(vdp.sequence_number));
                            if followed.insert(block) {
                                pending = Some(vdp.next);
                            }
                        }
                        Entry::Terminating => {
                            slots.terminating = Some(record(0));
                            finished = true;
                        }
                        Entry::Primary(seq) => offer(&mut slots.primary, record(seq)),
                        Entry::LogicalVolume(seq) => offer(&mut slots.logical_volume, record(seq)),
                        Entry::UnallocatedSpace(seq) => {
                            offer(&mut slots.unallocated_space, record(seq))
                        }
                        Entry::ImplementationUse(seq) => {
                            offer(&mut slots.implementation_use, record(seq))
                        }
                        Entry::Partition { number, sequence } => {
                            slots.offer_partition(number, record(sequence))
                        }
                        Entry::Other(identifier) => {
                            trace!(block, ?identifier, "ignoring descriptor in sequence")
                        }
                    }
                }
                Ok(None) => trace!(block, "skipping untrusted block"),
                Err(UdfError::OutOfRange { .. }) => finished = true,
                Err(err) if err.is_recoverable() => debug!(block, %err, "skipping unreadable block"),
                Err(err) => return Err(err),
            }
            block += 1;
        }
        if !finished {
            continue;
        }
        let Some(next) = pending.take() else {
            break;
        };
        redirects += 1;
        if redirects > MAX_DESCRIPTOR_POINTERS {
            warn!(
                max = MAX_DESCRIPTOR_POINTERS,
                "too many volume descriptor pointers, ending sequence"
            );
            break;
        }
        match span(next, bs) {
            Some((start, last)) => {
                debug!(start, last, "following volume descriptor pointer");
                block = start;
                end = last;
            }
            None => break,
        }
    }
    Ok(slots)
}

/// Descriptors of one successfully processed sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDescriptors {
    /// Sequence that produced them
    pub sequence: SequenceKind,
    /// Primary volume descriptor
    pub primary: PrimaryVolumeDescriptor,
    /// Logical volume descriptor
    pub logical: LogicalVolumeDescriptor,
    /// Resolved partition maps
    pub maps: Vec<PartitionMap>,
    /// Volume must not be written
    pub write_incompatible: bool,
}

fn load_descriptor<B: UdfDevice, T>(
    reader: &mut MediaReader<'_, B>,
    block: u64,
    expected: TagIdentifier,
    parse: impl FnOnce(&[u8]) -> Result<T>,
) -> Result<T> {
    let location = u32::try_from(block).map_err(|_| UdfError::OutOfRange { block, blocks: u32::MAX as u64 })?;
    let parsed = reader.with_descriptor(block, Some(location), |tag, data| {
        if tag.identifier != expected {
            return Err(UdfError::Corrupt {
                block,
                detail: format!("expected {:?}, found {:?}", expected, tag.identifier),
            });
        }
        parse(data)
    })?;
    parsed.ok_or_else(|| UdfError::Corrupt {
        block,
        detail: format!("{:?} no longer validates", expected),
    })
}

/// Check a domain identifier (UDF 2.1.5.3)
///
/// # Returns
/// `true` when the volume must be treated as write-incompatible.
///
/// # Errors
/// `AccessDenied` on a read-write mount; `Corrupt` in strict mode when the
/// domain is not OSTA compliant.
pub fn check_domain(domain: &EntityId, what: &str, block: u64, options: &MountOptions) -> Result<bool> {
    let compliance = if !domain.matches(IDENT_OSTA_COMPLIANT) {
        Some("is not OSTA UDF compliant")
    } else if domain.flags & ENTITY_FLAG_DIRTY != 0 {
        Some("is possibly not OSTA UDF compliant")
    } else {
        None
    };
    let problem = match compliance {
        Some(problem) if options.strict => {
            return Err(UdfError::Corrupt {
                block,
                detail: format!("{} domain {}", what, problem),
            });
        }
        Some(problem) => problem,
        None if domain.domain_flags() & (DOMAIN_HARD_WRITE_PROTECT | DOMAIN_SOFT_WRITE_PROTECT) != 0 => {
            "is write protected"
        }
        None => return Ok(false),
    };
    if !options.read_only {
        return Err(UdfError::AccessDenied(format!("{} domain {}", what, problem)));
    }
    warn!(descriptor = what, "domain {}, volume is read-only", problem);
    Ok(true)
}

/// Walk one sequence and build partition maps from it
///
/// # Errors
/// Structural errors when a mandatory descriptor is missing or no
/// partition can be resolved; everything the partition layer reports.
pub fn process<B: UdfDevice>(
    reader: &mut MediaReader<'_, B>,
    extent: ExtentAd,
    kind: SequenceKind,
    options: &MountOptions,
    ctx: &ResolveContext,
) -> Result<VolumeDescriptors> {
    debug!(?kind, location = extent.location, length = extent.length, "processing volume descriptor sequence");
    let slots = walk(reader, extent)?;

    let primary_slot = slots
        .primary
        .ok_or(UdfError::MissingDescriptor("primary volume descriptor"))?;
    let primary = load_descriptor(
        reader,
        primary_slot.block,
        TagIdentifier::PrimaryVolume,
        PrimaryVolumeDescriptor::parse,
    )?;
    debug!(volume = %primary.volume_identifier, block = primary_slot.block, "primary volume descriptor");

    let Some(lvd_slot) = slots.logical_volume else {
        debug!("no logical volume descriptor in sequence");
        return Err(UdfError::NoPartitions);
    };
    let bs = ctx.block_size;
    let logical = load_descriptor(reader, lvd_slot.block, TagIdentifier::LogicalVolume, |data| {
        LogicalVolumeDescriptor::parse(data, bs)
    })?;
    if logical.block_size != bs {
        return Err(UdfError::Corrupt {
            block: lvd_slot.block,
            detail: format!("logical block size {} on a {} byte mount", logical.block_size, bs),
        });
    }
    let mut write_incompatible = check_domain(&logical.domain, "logical volume", lvd_slot.block, options)?;

    let mut maps = resolve_maps(&logical, bs)?;
    if maps.is_empty() {
        return Err(UdfError::NoPartitions);
    }
    load_sparing_tables(reader, &mut maps)?;

    for block in slots.partition_blocks() {
        let pd = load_descriptor(reader, block, TagIdentifier::Partition, PartitionDescriptor::parse)?;
        write_incompatible |= apply_descriptor(reader, &mut maps, &pd, ctx)?;
    }
    if !maps.iter().any(|m| m.described) {
        return Err(UdfError::NoPartitions);
    }

    debug!(
        ?kind,
        logical_volume = %logical.identifier,
        partitions = maps.len(),
        "volume descriptor sequence loaded"
    );
    Ok(VolumeDescriptors {
        sequence: kind,
        primary,
        logical,
        maps,
        write_incompatible,
    })
}

/// Process the main sequence, falling back to the reserve on recoverable errors
pub fn load_sequences<B: UdfDevice>(
    reader: &mut MediaReader<'_, B>,
    main: ExtentAd,
    reserve: ExtentAd,
    options: &MountOptions,
    ctx: &ResolveContext,
) -> Result<VolumeDescriptors> {
    match process(reader, main, SequenceKind::Main, options, ctx) {
        Ok(descriptors) => return Ok(descriptors),
        Err(err) if err.is_recoverable() => {
            warn!(%err, "main volume descriptor sequence unusable, trying the reserve");
        }
        Err(err) => return Err(err),
    }
    process(reader, reserve, SequenceKind::Reserve, options, ctx)
}
