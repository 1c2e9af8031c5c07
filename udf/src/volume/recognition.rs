//! Volume Recognition Sequence (ECMA-167 2/8.3)
//!
//! The VRS starts at byte 32768 of the session and is a run of 2048-byte
//! volume structure descriptors: `BEA01`, one `NSR02`/`NSR03`, `TEA01`,
//! possibly mixed with ISO 9660 (`CD001`) descriptors on hybrid discs.
//! Sectors are read at `max(block size, 2048)` strides. Some writers lay
//! the descriptors out at 2048-byte strides even on 4096-byte media, so
//! the second half of a 4096-byte sector is checked too.

use tracing::{debug, trace};

use crate::device::UdfDevice;
use crate::media::MediaReader;
use crate::types::{VRS_LIMIT, VRS_SECTOR_SIZE, VRS_START};

const STANDARD_IDENTIFIER_LEN: usize = 5;

/// NSR descriptor revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NsrRevision {
    /// ECMA-167 2nd edition (UDF 1.02 - 1.50)
    Nsr02,
    /// ECMA-167 3rd edition (UDF 2.00+)
    Nsr03,
}

/// Outcome of a recognition scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recognition {
    /// An NSR descriptor was found
    Standard {
        /// Best revision seen
        revision: NsrRevision,
        /// Byte offset of that descriptor
        offset: u64,
    },
    /// Only ISO 9660 / extended area descriptors
    LegacyOnly {
        /// Byte offset of the first legacy descriptor
        offset: u64,
    },
    /// First sector blank or unreadable; treated as an open disc
    Unrecorded,
    /// No usable sequence
    NotPresent,
}

impl Recognition {
    /// Whether the mount may go on to the anchor search
    pub fn permits_mount(&self) -> bool {
        matches!(self, Self::Standard { .. } | Self::Unrecorded)
    }
}

/// Scanner progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Nothing decisive seen yet
    Unchecked,
    /// An NSR descriptor was seen; scanning on for a better revision
    StandardIdentifierFound,
    /// Stopped after a terminator
    Done,
    /// Stopped without an NSR descriptor
    NotPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectorKind {
    Nsr(NsrRevision),
    Legacy,
    Terminator,
}

fn classify(sector: &[u8]) -> SectorKind {
    let Some(ident) = sector.get(1..1 + STANDARD_IDENTIFIER_LEN) else {
        return SectorKind::Terminator;
    };
    match ident {
        b"NSR02" => SectorKind::Nsr(NsrRevision::Nsr02),
        b"NSR03" => SectorKind::Nsr(NsrRevision::Nsr03),
        b"CD001" | b"BEA01" | b"BOOT2" | b"CDW02" => SectorKind::Legacy,
        // TEA01, blank or anything unknown ends the area
        _ => SectorKind::Terminator,
    }
}

/// Incremental VRS state machine, fed one sector at a time
#[derive(Debug, Clone)]
pub struct VrsScanner {
    state: ScanState,
    sectors: u64,
    blank_start: bool,
    best: Option<(NsrRevision, u64)>,
    legacy: Option<u64>,
}

impl Default for VrsScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl VrsScanner {
    /// Fresh scanner
    pub fn new() -> Self {
        Self {
            state: ScanState::Unchecked,
            sectors: 0,
            blank_start: false,
            best: None,
            legacy: None,
        }
    }

    /// Current state
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Whether more sectors are wanted
    pub fn wants_more(&self) -> bool {
        matches!(
            self.state,
            ScanState::Unchecked | ScanState::StandardIdentifierFound
        )
    }

    /// Feed the sector at byte `offset`
    pub fn feed(&mut self, offset: u64, sector: &[u8]) {
        if !self.wants_more() {
            return;
        }
        let first = self.sectors == 0;
        self.sectors += 1;
        let blank = sector
            .get(..1 + STANDARD_IDENTIFIER_LEN)
            .map_or(true, |head| head[1..].iter().all(|&b| b == 0));
        if first && blank {
            self.blank_start = true;
        }
        match classify(sector) {
            SectorKind::Nsr(revision) => self.note_nsr(revision, offset),
            SectorKind::Legacy => {
                self.legacy.get_or_insert(offset);
            }
            SectorKind::Terminator => self.stop(),
        }
    }

    /// Feed the second 2048-byte half of a 4096-byte sector
    ///
    /// Only recognised descriptors count here; anything else is ignored.
    pub fn feed_secondary(&mut self, offset: u64, half: &[u8]) {
        if !self.wants_more() {
            return;
        }
        match classify(half) {
            SectorKind::Nsr(revision) => self.note_nsr(revision, offset),
            SectorKind::Legacy => {
                self.legacy.get_or_insert(offset);
            }
            SectorKind::Terminator => {}
        }
    }

    /// Record a sector that could not be read; the scan ends
    pub fn read_failed(&mut self) {
        if self.sectors == 0 {
            self.blank_start = true;
        }
        self.sectors += 1;
        self.stop();
    }

    fn note_nsr(&mut self, revision: NsrRevision, offset: u64) {
        if self.best.map_or(true, |(best, _)| revision > best) {
            self.best = Some((revision, offset));
        }
        self.state = ScanState::StandardIdentifierFound;
    }

    fn stop(&mut self) {
        self.state = if self.best.is_some() {
            ScanState::Done
        } else {
            ScanState::NotPresent
        };
    }

    /// Final result
    pub fn finish(self) -> Recognition {
        if let Some((revision, offset)) = self.best {
            return Recognition::Standard { revision, offset };
        }
        if self.blank_start {
            return Recognition::Unrecorded;
        }
        match self.legacy {
            Some(offset) => Recognition::LegacyOnly { offset },
            None => Recognition::NotPresent,
        }
    }
}

/// Scan the recognition area of the session starting at `session_start`
pub fn scan<B: UdfDevice>(reader: &mut MediaReader<'_, B>, session_start: u64) -> Recognition {
    let bs = reader.block_size() as u64;
    let stride = bs.max(VRS_SECTOR_SIZE);
    let base = session_start * bs;
    let mut scanner = VrsScanner::new();
    let mut offset = base + VRS_START;

    while scanner.wants_more() && offset - base < VRS_LIMIT {
        let block = offset / bs;
        let within = (offset % bs) as usize;
        let read = reader.with_block(block, |data| {
            let sector = data.get(within..).unwrap_or(&[]);
            scanner.feed(offset, sector);
            if bs == 2 * VRS_SECTOR_SIZE {
                if let Some(half) = sector.get(VRS_SECTOR_SIZE as usize..) {
                    scanner.feed_secondary(offset + VRS_SECTOR_SIZE, half);
                }
            }
        });
        if let Err(err) = read {
            trace!(offset, %err, "recognition sector unreadable");
            scanner.read_failed();
        }
        offset += stride;
    }

    let result = scanner.finish();
    debug!(?result, "volume recognition sequence scanned");
    result
}
