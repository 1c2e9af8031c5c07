//! Logical volume integrity sequence (ECMA-167 3/8.4.2.3)
//!
//! Integrity descriptors are appended to an extent; when the extent fills
//! up, the last record points at a continuation extent. The current record
//! is the last valid one of the last extent in the chain.

use tracing::{debug, warn};

use crate::descriptor::integrity::LogicalVolumeIntegrity;
use crate::device::UdfDevice;
use crate::error::Result;
use crate::media::MediaReader;
use crate::types::{ExtentAd, TagIdentifier, MAX_INTEGRITY_NESTING};
use crate::utils::sector::blocks_for_bytes;

/// The prevailing integrity record and where it lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityRecord {
    /// Logical block of the record
    pub block: u64,
    /// Decoded record
    pub record: LogicalVolumeIntegrity,
}

/// Last valid integrity block of one extent
fn last_in_extent<B: UdfDevice>(
    reader: &mut MediaReader<'_, B>,
    extent: ExtentAd,
) -> Result<Option<(u64, ExtentAd, Option<LogicalVolumeIntegrity>)>> {
    let bs = reader.block_size();
    let mut last = None;
    for i in 0..blocks_for_bytes(extent.length as u64, bs) {
        let block = extent.location as u64 + i;
        let Ok(location) = u32::try_from(block) else {
            break;
        };
        let found = reader.with_descriptor(block, Some(location), |tag, data| {
            Ok((tag.identifier == TagIdentifier::LogicalVolumeIntegrity).then(|| {
                let next = ExtentAd::parse(data, 32);
                (next, LogicalVolumeIntegrity::parse(data))
            }))
        });
        match found {
            Ok(Some(Some((next, record)))) => last = Some((block, next, record)),
            Ok(_) => break,
            Err(err) if err.is_recoverable() => {
                debug!(block, %err, "integrity extent unreadable");
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(last)
}

/// Follow the integrity chain starting at `extent`
///
/// # Returns
/// `None` when no record is found, when the chain nests deeper than
/// [`MAX_INTEGRITY_NESTING`], or when the prevailing record does not fit
/// its block.
pub fn load_chain<B: UdfDevice>(
    reader: &mut MediaReader<'_, B>,
    mut extent: ExtentAd,
) -> Result<Option<IntegrityRecord>> {
    let mut current: Option<(u64, Option<LogicalVolumeIntegrity>)> = None;

    for _ in 0..MAX_INTEGRITY_NESTING {
        let Some((block, next, record)) = last_in_extent(reader, extent)? else {
            return Ok(finish(current));
        };
        current = Some((block, record));
        if next.length == 0 {
            return Ok(finish(current));
        }
        debug!(block, next = next.location, "following integrity extent");
        extent = next;
    }
    warn!(max = MAX_INTEGRITY_NESTING, "integrity chain nests too deep, ignoring");
    Ok(None)
}

fn finish(current: Option<(u64, Option<LogicalVolumeIntegrity>)>) -> Option<IntegrityRecord> {
    match current? {
        (block, Some(record)) => Some(IntegrityRecord { block, record }),
        (block, None) => {
            warn!(block, "integrity record does not fit its block, ignoring");
            None
        }
    }
}
