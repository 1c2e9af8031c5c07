//! Anchor Volume Descriptor Pointer search (ECMA-167 3/8.4.2.1, UDF 2.2.3)
//!
//! An AVDP is recorded at two of: block 256, last block − 256, last block.
//! Drives misreport the last block of recordable media often enough that
//! the search also tries a handful of neighbours, plus block 512 for
//! half-open discs. The search is a prioritized candidate list evaluated in
//! order; the first anchor whose sequences load wins.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::descriptor::volume::AnchorVolumeDescriptor;
use crate::device::{Addressing, UdfDevice};
use crate::error::{Result, UdfError};
use crate::media::MediaReader;
use crate::types::{TagIdentifier, ANCHOR_BLOCK, ANCHOR_BLOCK_HALF_OPEN};
use crate::utils::sector::{fixed_to_variable, variable_to_fixed};

/// Consecutive timeouts tolerated among last-block candidates
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 2;

/// Consecutive read errors tolerated among last-block candidates
pub const MAX_CONSECUTIVE_ERRORS: u32 = 12;

/// Offsets from the last-block estimate, in search order
const LAST_BLOCK_OFFSETS: [i64; 7] = [0, -1, 1, -2, 2, -150, -152];

/// Distance between the two end-of-media anchor locations
const ANCHOR_SPAN: u64 = 256;

/// Where a candidate comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorSource {
    /// `anchor=` mount option
    Override,
    /// Session start + 256
    Session,
    /// Around the last-block estimate
    LastBlock,
    /// Session start + 512
    HalfOpen,
}

/// One block to try
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorCandidate {
    /// Logical block
    pub block: u64,
    /// Search step
    pub source: AnchorSource,
    /// Last block implied when the anchor is found here
    pub implied_last: Option<u64>,
}

/// Build the candidate list for one search pass
pub fn candidates(anchor: Option<u64>, session: u64, last: u64) -> Vec<AnchorCandidate> {
    let mut out = Vec::with_capacity(2 + LAST_BLOCK_OFFSETS.len() * 2 + 1);
    if let Some(block) = anchor {
        out.push(AnchorCandidate {
            block,
            source: AnchorSource::Override,
            implied_last: None,
        });
    }
    out.push(AnchorCandidate {
        block: session + ANCHOR_BLOCK,
        source: AnchorSource::Session,
        implied_last: None,
    });
    for offset in LAST_BLOCK_OFFSETS {
        let Some(block) = last.checked_add_signed(offset) else {
            continue;
        };
        out.push(AnchorCandidate {
            block,
            source: AnchorSource::LastBlock,
            implied_last: Some(block),
        });
        if block >= ANCHOR_SPAN {
            out.push(AnchorCandidate {
                block: block - ANCHOR_SPAN,
                source: AnchorSource::LastBlock,
                implied_last: Some(block),
            });
        }
    }
    out.push(AnchorCandidate {
        block: session + ANCHOR_BLOCK_HALF_OPEN,
        source: AnchorSource::HalfOpen,
        implied_last: None,
    });
    out
}

/// Consecutive read failure counters of one search pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadBudget {
    timeouts: u32,
    errors: u32,
}

impl ReadBudget {
    /// A read went through
    pub fn record_success(&mut self) {
        *self = Self::default();
    }

    /// A read failed with `err`
    pub fn record_failure(&mut self, err: &UdfError) {
        match err {
            UdfError::Timeout { .. } => {
                self.timeouts += 1;
                self.errors += 1;
            }
            _ => {
                self.timeouts = 0;
                self.errors += 1;
            }
        }
    }

    /// Whether the remaining last-block candidates should be skipped
    pub fn exhausted(&self) -> bool {
        self.timeouts > MAX_CONSECUTIVE_TIMEOUTS || self.errors > MAX_CONSECUTIVE_ERRORS
    }
}

/// A valid anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorHit {
    /// Block the anchor was read from
    pub block: u64,
    /// Decoded anchor
    pub anchor: AnchorVolumeDescriptor,
    /// Last block implied by the candidate, if any
    pub implied_last: Option<u64>,
}

/// Result of one search pass
#[derive(Debug)]
pub enum SearchOutcome<T> {
    /// An anchor led to loadable sequences
    Found(T, AnchorHit),
    /// No valid anchor at any candidate
    NoAnchor,
    /// Valid anchors were found but none led to loadable sequences
    Failed(UdfError),
}

fn addressable<B: UdfDevice>(reader: &MediaReader<'_, B>, block: u64) -> bool {
    let physical = match reader.addressing() {
        Addressing::Fixed => block,
        Addressing::Variable => fixed_to_variable(block),
    };
    physical <= reader.device_last_block()
}

fn read_anchor<B: UdfDevice>(
    reader: &mut MediaReader<'_, B>,
    block: u64,
) -> Result<Option<AnchorVolumeDescriptor>> {
    let Ok(location) = u32::try_from(block) else {
        return Ok(None);
    };
    let anchor = reader.with_descriptor(block, Some(location), |tag, data| {
        match tag.identifier {
            TagIdentifier::AnchorVolumePointer => {
                AnchorVolumeDescriptor::parse(data).map(Some)
            }
            _ => Ok(None),
        }
    })?;
    Ok(anchor.flatten())
}

/// Evaluate `plan` in order, handing each valid anchor to `load`
///
/// `load` errors that are recoverable move the search on to the next
/// candidate; any other error ends it. Anchors pointing at sequences that
/// already failed are not loaded again.
pub fn search<'d, B, T, F>(
    reader: &mut MediaReader<'d, B>,
    plan: &[AnchorCandidate],
    load: &mut F,
) -> Result<SearchOutcome<T>>
where
    B: UdfDevice,
    F: FnMut(&mut MediaReader<'d, B>, &AnchorHit) -> Result<T>,
{
    let mut budget = ReadBudget::default();
    let mut visited = BTreeSet::new();
    let mut tried: Vec<AnchorVolumeDescriptor> = Vec::new();
    let mut failure: Option<UdfError> = None;

    for candidate in plan {
        if candidate.source == AnchorSource::LastBlock && budget.exhausted() {
            continue;
        }
        if !visited.insert(candidate.block) || !addressable(reader, candidate.block) {
            continue;
        }
        let anchor = match read_anchor(reader, candidate.block) {
            Ok(anchor) => {
                budget.record_success();
                anchor
            }
            Err(err) if err.is_recoverable() => {
                debug!(block = candidate.block, %err, "anchor candidate unreadable");
                budget.record_failure(&err);
                if candidate.source == AnchorSource::LastBlock && budget.exhausted() {
                    warn!(
                        block = candidate.block,
                        "too many consecutive read failures, skipping remaining last-block candidates"
                    );
                }
                continue;
            }
            Err(err) => return Err(err),
        };
        let Some(anchor) = anchor else {
            continue;
        };
        if tried.contains(&anchor) {
            debug!(block = candidate.block, "anchor repeats sequences already tried");
            continue;
        }
        tried.push(anchor);

        let hit = AnchorHit {
            block: candidate.block,
            anchor,
            implied_last: candidate.implied_last,
        };
        debug!(block = hit.block, source = ?candidate.source, "anchor found");
        match load(reader, &hit) {
            Ok(value) => return Ok(SearchOutcome::Found(value, hit)),
            Err(err) if err.is_recoverable() => {
                warn!(block = hit.block, %err, "anchor sequences unusable, trying next candidate");
                failure = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Ok(match failure {
        Some(err) => SearchOutcome::Failed(err),
        None => SearchOutcome::NoAnchor,
    })
}

/// Search for an anchor, retrying with variable packet addressing
///
/// # Returns
/// The loaded value, the anchor and the last-block estimate to use from
/// here on.
pub fn locate<'d, B, T, F>(
    reader: &mut MediaReader<'d, B>,
    anchor: Option<u64>,
    session: u64,
    last: u64,
    mut load: F,
) -> Result<(T, AnchorHit, u64)>
where
    B: UdfDevice,
    F: FnMut(&mut MediaReader<'d, B>, &AnchorHit) -> Result<T>,
{
    let plan = candidates(anchor, session, last);
    match search(reader, &plan, &mut load)? {
        SearchOutcome::Found(value, hit) => {
            let last = hit.implied_last.unwrap_or(last);
            return Ok((value, hit, last));
        }
        SearchOutcome::Failed(err) => return Err(err),
        SearchOutcome::NoAnchor => {}
    }
    if reader.addressing() == Addressing::Variable {
        return Err(UdfError::NoAnchor);
    }

    info!("no anchor with fixed addressing, retrying with variable packets");
    reader.set_addressing(Addressing::Variable);
    let converted = variable_to_fixed(last);
    let estimates = if converted == last {
        vec![last]
    } else {
        vec![converted, last]
    };
    for estimate in estimates {
        let plan = candidates(anchor, session, estimate);
        let outcome = match search(reader, &plan, &mut load) {
            Ok(outcome) => outcome,
            Err(err) => {
                reader.set_addressing(Addressing::Fixed);
                return Err(err);
            }
        };
        match outcome {
            SearchOutcome::Found(value, hit) => {
                let last = hit.implied_last.unwrap_or(estimate);
                return Ok((value, hit, last));
            }
            SearchOutcome::Failed(err) => {
                reader.set_addressing(Addressing::Fixed);
                return Err(err);
            }
            SearchOutcome::NoAnchor => {}
        }
    }
    reader.set_addressing(Addressing::Fixed);
    Err(UdfError::NoAnchor)
}
