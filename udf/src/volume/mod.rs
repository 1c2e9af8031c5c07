//! Volume assembly
//!
//! [`mount`] runs the whole pipeline for each candidate block size:
//!
//! 1. Volume recognition sequence check (skipped with `novrs`)
//! 2. Anchor search, retried with variable packet addressing
//! 3. Main volume descriptor sequence, falling back to the reserve
//! 4. Integrity chain and UDF revision checks
//! 5. File set descriptor and root directory
//!
//! The result is a [`Volume`] owning the media reader, cache and partition
//! maps. A read-write mount marks the integrity record open and closes it
//! again on [`Volume::unmount`] (or on drop).

pub mod anchor;
pub mod integrity;
pub mod recognition;
pub mod sequence;

use tracing::{debug, error, info, warn};

use crate::cache::CacheStats;
use crate::descriptor::file::{space_bitmap_blocks, FileSetDescriptor};
use crate::descriptor::integrity::{mark_closed, mark_open, LogicalVolumeIntegrity};
use crate::device::{candidate_block_sizes, Addressing, Clock, MonotonicClock, RawDevice, UdfDevice};
use crate::error::{Result, UdfError};
use crate::media::MediaReader;
use crate::options::MountOptions;
use crate::partition::{count_bitmap_free, translate, PartitionMap, ResolveContext};
use crate::types::{
    LbAddr, LongAd, TagIdentifier, MAX_READ_REVISION, MAX_WRITE_REVISION, NO_LOCATION,
};
use crate::utils::datetime::UdfTimestamp;

use self::integrity::IntegrityRecord;
use self::recognition::Recognition;
use self::sequence::{check_domain, SequenceKind};

/// Free-space table entry meaning "not maintained"
const FREE_SPACE_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Everything the mount pipeline learned about the volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeState {
    /// Logical block size
    pub block_size: u32,
    /// Last block estimate the volume was mounted with
    pub last_block: u64,
    /// Block the anchor was found at
    pub anchor_block: u64,
    /// First block of the mounted session
    pub session_start: u64,
    /// Block addressing in effect
    pub addressing: Addressing,
    /// Recognition result, `None` with `novrs`
    pub recognition: Option<Recognition>,
    /// Sequence the descriptors came from
    pub sequence: SequenceKind,
    /// Partition maps, indexed by partition reference
    pub partitions: Vec<PartitionMap>,
    /// File set descriptor location
    pub fileset: LbAddr,
    /// Root directory ICB
    pub root: LbAddr,
    /// Prevailing integrity record
    pub integrity: Option<IntegrityRecord>,
    /// Mounted read-only
    pub read_only: bool,
    /// Volume must not be written even if it could be opened
    pub write_incompatible: bool,
    /// UDF revision used for the integrity record
    pub udf_revision: u16,
    /// Volume identifier from the primary volume descriptor
    pub volume_identifier: String,
    /// Logical volume identifier
    pub logical_volume_identifier: String,
    /// File set identifier
    pub fileset_identifier: String,
}

/// A mounted UDF volume
pub struct Volume<'d, B: UdfDevice> {
    reader: MediaReader<'d, B>,
    state: VolumeState,
    /// Integrity record was closed when mounted
    consistent: bool,
    /// Integrity record is currently marked open by this mount
    integrity_open: bool,
}

/// Mount the UDF volume on `device`
///
/// # Arguments
/// * `device` - Block device holding the volume
/// * `options` - Mount options
///
/// # Returns
/// The mounted volume; on error every cache and partition allocation made
/// by the attempt has been released.
pub fn mount<'d, B: UdfDevice>(device: &'d mut B, options: &MountOptions) -> Result<Volume<'d, B>> {
    mount_with_clock(device, options, Box::new(MonotonicClock::new()))
}

/// [`mount`] with an explicit clock for read timing and cache deadlines
pub fn mount_with_clock<'d, B: UdfDevice>(
    device: &'d mut B,
    options: &MountOptions,
    clock: Box<dyn Clock + 'd>,
) -> Result<Volume<'d, B>> {
    let device_block_size = device.block_size().to_u32();
    let sizes = candidate_block_sizes(options.block_size, device_block_size);
    let first = *sizes
        .first()
        .ok_or(UdfError::InvalidBlockSize(device_block_size))?;
    let raw = RawDevice::new(device, clock, first)?;
    let mut reader = MediaReader::new(raw, options.cache.clone(), options.session_start());

    let mut last_err = UdfError::NotUdf;
    for block_size in sizes {
        if let Err(err) = reader.set_block_size(block_size) {
            debug!(block_size, %err, "block size not usable on this device");
            last_err = err;
            continue;
        }
        match assemble(&mut reader, options) {
            Ok(state) => return Volume::open(reader, state),
            Err(err @ (UdfError::NotUdf | UdfError::NoAnchor)) => {
                debug!(block_size, %err, "no UDF volume at this block size");
                reader.teardown();
                last_err = err;
            }
            Err(err) => {
                error!(block_size, %err, "mount failed");
                reader.teardown();
                return Err(err);
            }
        }
    }
    error!(err = %last_err, "mount failed");
    Err(last_err)
}

fn assemble<B: UdfDevice>(reader: &mut MediaReader<'_, B>, options: &MountOptions) -> Result<VolumeState> {
    let block_size = reader.block_size();
    let session_start = options.session_start();

    let recognition = if options.novrs {
        debug!("volume recognition check skipped");
        None
    } else {
        let found = recognition::scan(reader, session_start);
        if !found.permits_mount() {
            return Err(UdfError::NotUdf);
        }
        if found == Recognition::Unrecorded {
            debug!("recognition area unrecorded, assuming an open disc");
        }
        Some(found)
    };

    let device_last_block = reader.device_last_block();
    let estimate = options
        .last_block
        .or_else(|| reader.last_written_block())
        .unwrap_or(device_last_block);
    debug!(block_size, estimate, device_last_block, "searching for an anchor");

    let (descriptors, hit, last_block) =
        anchor::locate(reader, options.anchor, session_start, estimate, |reader, hit| {
            let ctx = ResolveContext {
                read_only: options.read_only,
                block_size,
                last_block: hit.implied_last.unwrap_or(estimate),
                device_last_block,
            };
            sequence::load_sequences(
                reader,
                hit.anchor.main_sequence,
                hit.anchor.reserve_sequence,
                options,
                &ctx,
            )
        })?;
    let mut write_incompatible = descriptors.write_incompatible;

    let integrity = integrity::load_chain(reader, descriptors.logical.integrity_sequence)?;
    let (udf_revision, revision_incompatible) = check_revisions(
        integrity.as_ref(),
        descriptors.logical.domain.udf_revision(),
        options,
    )?;
    write_incompatible |= revision_incompatible;

    let (fileset, fsd) = find_fileset(reader, &descriptors.maps, descriptors.logical.fileset, options)?;
    let fsd_block = translate(&descriptors.maps, fileset.partition, fileset.block, 0)?;
    write_incompatible |= check_domain(&fsd.domain, "file set", fsd_block, options)?;
    let root = fsd.root.location;
    if root.partition as usize >= descriptors.maps.len() {
        return Err(UdfError::BadPartitionRef(root.partition));
    }

    info!(
        volume = %descriptors.primary.volume_identifier,
        block_size,
        anchor = hit.block,
        sequence = ?descriptors.sequence,
        partitions = descriptors.maps.len(),
        root_partition = root.partition,
        root_block = root.block,
        read_only = options.read_only,
        write_incompatible,
        "UDF volume mounted"
    );
    Ok(VolumeState {
        block_size,
        last_block,
        anchor_block: hit.block,
        session_start,
        addressing: reader.addressing(),
        recognition,
        sequence: descriptors.sequence,
        partitions: descriptors.maps,
        fileset,
        root,
        integrity,
        read_only: options.read_only,
        write_incompatible,
        udf_revision,
        volume_identifier: descriptors.primary.volume_identifier,
        logical_volume_identifier: descriptors.logical.identifier,
        fileset_identifier: fsd.identifier,
    })
}

/// Check the integrity record's revision fields
///
/// # Returns
/// The volume's UDF revision and whether it is write-incompatible.
fn check_revisions(
    integrity: Option<&IntegrityRecord>,
    domain_revision: u16,
    options: &MountOptions,
) -> Result<(u16, bool)> {
    let Some(integrity) = integrity else {
        if !options.read_only {
            return Err(UdfError::AccessDenied(
                "no valid logical volume integrity record".into(),
            ));
        }
        warn!("no valid logical volume integrity record, volume is read-only");
        return Ok((domain_revision, true));
    };
    let Some(revisions) = integrity.record.revisions else {
        return Err(UdfError::Corrupt {
            block: integrity.block,
            detail: "integrity record lacks UDF revision fields".into(),
        });
    };
    if revisions.min_read > MAX_READ_REVISION {
        return Err(UdfError::UnsupportedReadRevision {
            found: revisions.min_read,
            supported: MAX_READ_REVISION,
        });
    }
    if revisions.min_write > MAX_WRITE_REVISION {
        if !options.read_only {
            return Err(UdfError::AccessDenied(format!(
                "minimum write revision {:#06x} exceeds supported {:#06x}",
                revisions.min_write, MAX_WRITE_REVISION
            )));
        }
        warn!(
            min_write = revisions.min_write,
            "volume needs a newer UDF writer, volume is read-only"
        );
        return Ok((revisions.min_write, true));
    }
    Ok((revisions.min_write, false))
}

enum ScanStep {
    Found(FileSetDescriptor),
    Skip(u32),
}

fn read_fileset<B: UdfDevice>(
    reader: &mut MediaReader<'_, B>,
    maps: &[PartitionMap],
    location: LbAddr,
) -> Result<Option<ScanStep>> {
    let block = translate(maps, location.partition, location.block, 0)?;
    let bs = reader.block_size();
    reader.with_descriptor(block, Some(location.block), |tag, data| {
        Ok(match tag.identifier {
            TagIdentifier::FileSet => ScanStep::Found(FileSetDescriptor::parse(data)?),
            TagIdentifier::SpaceBitmap => {
                ScanStep::Skip(u32::try_from(space_bitmap_blocks(data, bs)).unwrap_or(u32::MAX))
            }
            _ => ScanStep::Skip(1),
        })
    })
}

/// Locate the File Set Descriptor
///
/// The recorded location is tried first. When it is unset or (outside
/// strict mode) does not hold a descriptor, partitions are scanned from the
/// last to the first.
fn find_fileset<B: UdfDevice>(
    reader: &mut MediaReader<'_, B>,
    maps: &[PartitionMap],
    recorded: LongAd,
    options: &MountOptions,
) -> Result<(LbAddr, FileSetDescriptor)> {
    let location = recorded.location;
    let unset = location.block == NO_LOCATION && location.partition == u16::MAX;
    if !unset {
        match read_fileset(reader, maps, location) {
            Ok(Some(ScanStep::Found(fsd))) => return Ok((location, fsd)),
            Ok(_) => debug!(?location, "no file set descriptor at the recorded location"),
            Err(err) if err.is_recoverable() => {
                debug!(?location, %err, "recorded file set location unusable")
            }
            Err(err) => return Err(err),
        }
    }
    if options.strict {
        return Err(UdfError::NoFileset);
    }

    warn!("searching partitions for a file set descriptor");
    for (index, map) in maps.iter().enumerate().rev() {
        let partition = index as u16;
        let mut block = 0u32;
        while block < map.length {
            let location = LbAddr { block, partition };
            let step = match read_fileset(reader, maps, location) {
                Ok(step) => step.unwrap_or(ScanStep::Skip(1)),
                Err(err) if err.is_recoverable() => ScanStep::Skip(1),
                Err(err) => return Err(err),
            };
            match step {
                ScanStep::Found(fsd) => {
                    debug!(?location, "file set descriptor found by scan");
                    return Ok((location, fsd));
                }
                ScanStep::Skip(blocks) => block = block.saturating_add(blocks.max(1)),
            }
        }
    }
    Err(UdfError::NoFileset)
}

impl<'d, B: UdfDevice> Volume<'d, B> {
    fn open(reader: MediaReader<'d, B>, state: VolumeState) -> Result<Self> {
        let mut volume = Self {
            reader,
            state,
            consistent: true,
            integrity_open: false,
        };
        if !volume.state.read_only {
            if let Err(err) = volume.open_integrity() {
                error!(%err, "could not mark the integrity record open");
                volume.reader.teardown();
                return Err(err);
            }
        }
        Ok(volume)
    }

    fn open_integrity(&mut self) -> Result<()> {
        let Some(integrity) = self.state.integrity.as_mut() else {
            return Ok(());
        };
        let block = integrity.block;
        let mut data = self.reader.with_block(block, <[u8]>::to_vec)?;
        self.consistent = mark_open(&mut data, UdfTimestamp::now());
        if !self.consistent {
            warn!(
                block,
                last_recorded = ?integrity.record.recorded.to_datetime(),
                "volume was not closed cleanly"
            );
        }
        self.reader.write_block(block, &data)?;
        self.reader.flush()?;
        if let Some(record) = LogicalVolumeIntegrity::parse(&data) {
            integrity.record = record;
        }
        self.integrity_open = true;
        debug!(block, "integrity record marked open");
        Ok(())
    }

    fn close_integrity(&mut self) -> Result<()> {
        if !self.integrity_open {
            return Ok(());
        }
        self.integrity_open = false;
        let Some(integrity) = self.state.integrity.as_mut() else {
            return Ok(());
        };
        let block = integrity.block;
        let mut data = self.reader.with_block(block, <[u8]>::to_vec)?;
        mark_closed(
            &mut data,
            UdfTimestamp::now(),
            self.state.udf_revision,
            MAX_WRITE_REVISION,
            self.consistent,
        );
        self.reader.write_block(block, &data)?;
        self.reader.flush()?;
        if let Some(record) = LogicalVolumeIntegrity::parse(&data) {
            integrity.record = record;
        }
        debug!(block, consistent = self.consistent, "integrity record closed");
        Ok(())
    }

    /// Mount-wide state
    pub fn state(&self) -> &VolumeState {
        &self.state
    }

    /// Root directory ICB location
    pub fn root_directory(&self) -> LbAddr {
        self.state.root
    }

    /// File set descriptor location
    pub fn fileset(&self) -> LbAddr {
        self.state.fileset
    }

    /// Number of partition maps
    pub fn partition_count(&self) -> usize {
        self.state.partitions.len()
    }

    /// Partition maps, indexed by partition reference
    pub fn partitions(&self) -> &[PartitionMap] {
        &self.state.partitions
    }

    /// Whether the mount is read-only
    pub fn is_read_only(&self) -> bool {
        self.state.read_only
    }

    /// Translate a partition-relative block to a logical block of the device
    pub fn translate(&self, partition: u16, block: u32) -> Result<u64> {
        translate(&self.state.partitions, partition, block, 0)
    }

    /// Read one partition-relative block
    pub fn read_logical(&mut self, partition: u16, block: u32) -> Result<Vec<u8>> {
        let absolute = self.translate(partition, block)?;
        self.reader.with_block(absolute, <[u8]>::to_vec)
    }

    /// Free blocks in a partition
    ///
    /// Taken from the integrity record's free-space table when it has a
    /// usable entry, otherwise counted from the unallocated space bitmap.
    pub fn free_blocks(&mut self, partition: u16) -> Result<u64> {
        if partition as usize >= self.state.partitions.len() {
            return Err(UdfError::BadPartitionRef(partition));
        }
        let recorded = self
            .state
            .integrity
            .as_ref()
            .and_then(|i| i.record.free_space.get(partition as usize).copied())
            .filter(|&free| free != FREE_SPACE_UNKNOWN && free != 0);
        if let Some(free) = recorded {
            return Ok(free as u64);
        }
        Ok(count_bitmap_free(&mut self.reader, &self.state.partitions, partition)?.unwrap_or(0))
    }

    /// Cache counters, when the cache is enabled
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.reader.cache_stats()
    }

    /// Close the integrity record (read-write mounts) and release the cache
    pub fn unmount(mut self) -> Result<()> {
        let closed = self.close_integrity();
        self.reader.teardown();
        info!(volume = %self.state.volume_identifier, "UDF volume unmounted");
        closed
    }
}

impl<'d, B: UdfDevice> Drop for Volume<'d, B> {
    fn drop(&mut self) {
        if let Err(err) = self.close_integrity() {
            error!(%err, "failed to close the integrity record");
        }
        self.reader.teardown();
    }
}
