//! Optical media block cache
//!
//! Descriptor scans on BD/DVD media are dominated by seek time, and scratched
//! discs fail reads or take seconds to return. The cache batches reads over a
//! bounded block range and hands out [`BlockHandle`]s instead of copies.
//!
//! # Policies
//!
//! - **Simple**: the first in-range read fills the whole range. Any failure
//!   throws the fill away and the cache is done for this mount.
//! - **Smart**: same fill, but failed batches are retried block by block
//!   until a wall-clock deadline; what still fails is marked unreadable.
//! - **Intelligent**: reads a window around the requested block, keeps only
//!   blocks that validate as descriptors, and stops filling once a ceiling of
//!   physically read blocks is reached.
//!
//! # Ownership
//!
//! The cache owns every resident block in an arena. A [`BlockHandle::Resident`]
//! is an index into that arena; [`BlockCache::release`] is a no-op for it.
//! Blocks that were read but not kept come back as
//! [`BlockHandle::Detached`] and own their buffer. Callers always go through
//! [`BlockCache::bytes`] and [`BlockCache::release`], regardless of origin.
//!
//! Reads outside the range, reads of released or unreadable blocks, and
//! reads after the cache gave up fall through to a direct device read.

mod eager;
mod window;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::device::BlockSource;
use crate::error::{Result, UdfError};

/// Cache fill strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Eager fill, give up on the first failure
    Simple,
    /// Eager fill with per-block retry under a deadline
    Smart,
    /// Windowed fill keeping only descriptor blocks
    #[default]
    Intelligent,
}

impl FromStr for CachePolicy {
    type Err = UdfError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simple" => Ok(Self::Simple),
            "smart" => Ok(Self::Smart),
            "intelligent" => Ok(Self::Intelligent),
            other => Err(UdfError::InvalidOption(format!("cache={}", other))),
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Simple => "simple",
            Self::Smart => "smart",
            Self::Intelligent => "intelligent",
        })
    }
}

/// Cache tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Fill strategy
    pub policy: CachePolicy,
    /// Intelligent window size in blocks
    pub window: u64,
    /// Intelligent ceiling of physically read blocks
    pub ceiling: u64,
    /// Smart retry deadline, measured from the start of the fill
    pub deadline: Duration,
    /// Blocks per device read during fills
    pub batch: u64,
    /// Cacheable blocks counted from the session start
    pub span: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            policy: CachePolicy::default(),
            window: 1024,
            ceiling: 16384,
            deadline: Duration::from_secs(10),
            batch: 32,
            span: 16384,
        }
    }
}

impl CacheConfig {
    /// Default tuning with the given policy
    pub fn with_policy(policy: CachePolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Cacheable range for a session, clipped to the device
    pub fn range_for(&self, session_start: u64, block_count: u64) -> Range<u64> {
        let start = session_start.min(block_count);
        let end = session_start.saturating_add(self.span).min(block_count);
        start..end
    }
}

/// Fill progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Nothing read yet
    Cold,
    /// Serving from the cache; Intelligent may still add windows
    Warm,
    /// No further fills; residents (if any) are still served
    Full,
}

/// Counters reported by [`BlockCache::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from a resident block
    pub hits: u64,
    /// In-range reads that were not hits
    pub misses: u64,
    /// Reads that bypassed the cache
    pub direct_reads: u64,
    /// Blocks physically read by fills
    pub blocks_read: u64,
    /// Blocks currently held
    pub resident: u64,
}

/// Per-block bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Resident(usize),
    /// Read but not kept, or invalidated by a write
    Released,
    /// Failed during a fill
    Unreadable,
}

/// A block returned by [`BlockCache::read`]
#[derive(Debug, PartialEq, Eq)]
pub enum BlockHandle {
    /// Owned by the cache arena
    Resident {
        /// Logical block number
        block: u64,
        /// Arena slot
        slot: usize,
    },
    /// Owned by the handle
    Detached {
        /// Logical block number
        block: u64,
        /// Block contents
        data: Vec<u8>,
    },
}

impl BlockHandle {
    /// Block number this handle refers to
    pub fn block(&self) -> u64 {
        match self {
            Self::Resident { block, .. } | Self::Detached { block, .. } => *block,
        }
    }

    /// Whether the cache owns the data
    pub fn is_resident(&self) -> bool {
        matches!(self, Self::Resident { .. })
    }
}

/// Block cache instance, owned by one mount
#[derive(Debug)]
pub struct BlockCache {
    config: CacheConfig,
    range: Range<u64>,
    state: CacheState,
    arena: Vec<Option<Box<[u8]>>>,
    free: Vec<usize>,
    index: BTreeMap<u64, Entry>,
    stats: CacheStats,
}

impl BlockCache {
    /// Create an empty cache over `range`
    pub fn new(config: CacheConfig, range: Range<u64>) -> Self {
        debug!(
            policy = %config.policy,
            start = range.start,
            end = range.end,
            "block cache created"
        );
        Self {
            config,
            range,
            state: CacheState::Cold,
            arena: Vec::new(),
            free: Vec::new(),
            index: BTreeMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Active policy
    pub fn policy(&self) -> CachePolicy {
        self.config.policy
    }

    /// Cacheable range
    pub fn range(&self) -> Range<u64> {
        self.range.clone()
    }

    /// Fill progress
    pub fn state(&self) -> CacheState {
        self.state
    }

    /// Counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            resident: (self.arena.len() - self.free.len()) as u64,
            ..self.stats
        }
    }

    /// Read a block through the cache
    pub fn read<S: BlockSource + ?Sized>(&mut self, source: &mut S, block: u64) -> Result<BlockHandle> {
        if !self.range.contains(&block) {
            return self.direct(source, block);
        }
        if let Some(Entry::Resident(slot)) = self.index.get(&block) {
            self.stats.hits += 1;
            return Ok(BlockHandle::Resident { block, slot: *slot });
        }
        self.stats.misses += 1;
        match self.config.policy {
            CachePolicy::Simple | CachePolicy::Smart => self.read_eager(source, block),
            CachePolicy::Intelligent => self.read_windowed(source, block),
        }
    }

    /// Borrow the contents of a handle
    ///
    /// A resident handle whose block has since been invalidated or cleaned
    /// up yields an empty slice.
    pub fn bytes<'a>(&'a self, handle: &'a BlockHandle) -> &'a [u8] {
        match handle {
            BlockHandle::Detached { data, .. } => data,
            BlockHandle::Resident { block, slot } => match self.index.get(block) {
                Some(Entry::Resident(current)) if current == slot => {
                    self.arena[*slot].as_deref().unwrap_or(&[])
                }
                _ => &[],
            },
        }
    }

    /// Give a handle back; frees detached buffers, no-op for resident ones
    pub fn release(&mut self, handle: BlockHandle) {
        drop(handle);
    }

    /// Forget the cached copy of a block after it was written
    pub fn invalidate(&mut self, block: u64) {
        if let Some(entry) = self.index.get_mut(&block) {
            if let Entry::Resident(slot) = *entry {
                self.arena[slot] = None;
                self.free.push(slot);
            }
            *entry = Entry::Released;
        }
    }

    /// Drop every held block and reset counters
    pub fn cleanup(&mut self) {
        let stats = self.stats();
        debug!(
            hits = stats.hits,
            misses = stats.misses,
            direct = stats.direct_reads,
            read = stats.blocks_read,
            resident = stats.resident,
            "block cache cleanup"
        );
        self.arena.clear();
        self.free.clear();
        self.index.clear();
        self.stats = CacheStats::default();
        self.state = CacheState::Cold;
    }

    fn direct<S: BlockSource + ?Sized>(&mut self, source: &mut S, block: u64) -> Result<BlockHandle> {
        self.stats.direct_reads += 1;
        let mut data = vec![0u8; source.block_size()];
        source.read_blocks(block, &mut data)?;
        Ok(BlockHandle::Detached { block, data })
    }

    /// Serve an in-range block after any fill has run
    fn serve<S: BlockSource + ?Sized>(&mut self, source: &mut S, block: u64) -> Result<BlockHandle> {
        match self.index.get(&block) {
            Some(Entry::Resident(slot)) => Ok(BlockHandle::Resident { block, slot: *slot }),
            _ => self.direct(source, block),
        }
    }

    fn store(&mut self, block: u64, data: &[u8]) -> Result<()> {
        let boxed: Box<[u8]> = data.into();
        let slot = match self.free.pop() {
            Some(slot) => {
                self.arena[slot] = Some(boxed);
                slot
            }
            None => {
                self.arena
                    .try_reserve(1)
                    .map_err(|_| UdfError::OutOfMemory("block cache"))?;
                self.arena.push(Some(boxed));
                self.arena.len() - 1
            }
        };
        self.index.insert(block, Entry::Resident(slot));
        Ok(())
    }

    fn mark(&mut self, block: u64, entry: Entry) {
        self.index.insert(block, entry);
    }

    fn is_known(&self, block: u64) -> bool {
        self.index.contains_key(&block)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::descriptor::tag::{seal, DescriptorTag};
    use crate::types::TagIdentifier;
    use std::cell::Cell;
    use std::collections::BTreeSet;
    use std::rc::Rc;

    /// Block source over an in-memory image with failure and latency knobs
    pub(crate) struct FakeSource {
        pub blocks: Vec<Vec<u8>>,
        pub failing: BTreeSet<u64>,
        pub reads: Vec<(u64, u64)>,
        pub hints: Vec<(u64, u64)>,
        pub clock: Rc<Cell<Duration>>,
        pub latency: Duration,
    }

    impl FakeSource {
        pub fn new(count: u64) -> Self {
            Self {
                blocks: (0..count).map(|_| vec![0u8; 2048]).collect(),
                failing: BTreeSet::new(),
                reads: Vec::new(),
                hints: Vec::new(),
                clock: Rc::new(Cell::new(Duration::ZERO)),
                latency: Duration::ZERO,
            }
        }

        pub fn put_descriptor(&mut self, block: u64) {
            let data = &mut self.blocks[block as usize];
            DescriptorTag::new(TagIdentifier::Terminating, 1, block as u32).write_to(data);
            seal(data, 496);
        }

        pub fn physical_reads(&self) -> u64 {
            self.reads.iter().map(|(_, n)| n).sum()
        }
    }

    impl BlockSource for FakeSource {
        fn block_size(&self) -> usize {
            2048
        }

        fn block_count(&self) -> u64 {
            self.blocks.len() as u64
        }

        fn read_blocks(&mut self, start: u64, buf: &mut [u8]) -> Result<()> {
            let count = (buf.len() / 2048) as u64;
            self.reads.push((start, count));
            self.clock.set(self.clock.get() + self.latency);
            for i in 0..count {
                let block = start + i;
                if self.failing.contains(&block) || block >= self.block_count() {
                    return Err(UdfError::Io {
                        block,
                        detail: "injected".into(),
                    });
                }
                let at = i as usize * 2048;
                buf[at..at + 2048].copy_from_slice(&self.blocks[block as usize]);
            }
            Ok(())
        }

        fn read_ahead(&mut self, start: u64, count: u64) {
            self.hints.push((start, count));
        }

        fn now(&self) -> Duration {
            self.clock.get()
        }
    }

    fn config(policy: CachePolicy) -> CacheConfig {
        CacheConfig {
            policy,
            window: 64,
            ceiling: 256,
            batch: 8,
            ..CacheConfig::default()
        }
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("smart".parse::<CachePolicy>().unwrap(), CachePolicy::Smart);
        assert!("fast".parse::<CachePolicy>().is_err());
        assert_eq!(CachePolicy::default(), CachePolicy::Intelligent);
    }

    #[test]
    fn test_range_clipped_to_device() {
        let cfg = CacheConfig::default();
        assert_eq!(cfg.range_for(0, 1000), 0..1000);
        assert_eq!(cfg.range_for(100, 100_000), 100..16484);
    }

    #[test]
    fn test_out_of_range_reads_are_direct() {
        let mut source = FakeSource::new(64);
        let mut cache = BlockCache::new(config(CachePolicy::Simple), 0..32);
        let handle = cache.read(&mut source, 40).unwrap();
        assert!(!handle.is_resident());
        assert_eq!(cache.stats().direct_reads, 1);
        assert_eq!(cache.state(), CacheState::Cold);
    }

    #[test]
    fn test_simple_fill_then_hits() {
        let mut source = FakeSource::new(64);
        source.blocks[5][0] = 0xAB;
        let mut cache = BlockCache::new(config(CachePolicy::Simple), 0..32);

        let first = cache.read(&mut source, 5).unwrap();
        assert!(first.is_resident());
        assert_eq!(cache.bytes(&first)[0], 0xAB);
        let reads = source.physical_reads();
        assert_eq!(reads, 32);

        let again = cache.read(&mut source, 5).unwrap();
        assert_eq!(cache.bytes(&again)[0], 0xAB);
        assert_eq!(source.physical_reads(), reads);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().resident, 32);
        cache.release(first);
        cache.release(again);
    }

    #[test]
    fn test_simple_failure_discards_everything() {
        let mut source = FakeSource::new(64);
        source.failing.insert(20);
        let mut cache = BlockCache::new(config(CachePolicy::Simple), 0..32);

        let handle = cache.read(&mut source, 3).unwrap();
        assert!(!handle.is_resident());
        assert_eq!(cache.state(), CacheState::Full);
        assert_eq!(cache.stats().resident, 0);

        // later reads never try to fill again
        let before = source.reads.len();
        cache.read(&mut source, 4).unwrap();
        assert_eq!(source.reads.len(), before + 1);
        assert!(cache.read(&mut source, 20).is_err());
    }

    #[test]
    fn test_smart_marks_failing_blocks_unreadable() {
        let mut source = FakeSource::new(64);
        source.failing.insert(9);
        let mut cache = BlockCache::new(config(CachePolicy::Smart), 0..32);

        let handle = cache.read(&mut source, 0).unwrap();
        assert!(handle.is_resident());
        assert_eq!(cache.stats().resident, 31);
        assert_eq!(cache.state(), CacheState::Warm);

        source.failing.clear();
        let nine = cache.read(&mut source, 9).unwrap();
        assert!(!nine.is_resident());
    }

    #[test]
    fn test_smart_deadline_abandons_rest() {
        let mut source = FakeSource::new(64);
        source.failing.extend([0u64, 1, 2, 3]);
        source.latency = Duration::from_secs(4);
        let mut cache = BlockCache::new(config(CachePolicy::Smart), 0..32);

        assert!(cache.read(&mut source, 0).is_err());
        // batch read (4s) + block retries until 10s pass; the rest is skipped
        assert!(cache.stats().resident < 8);
        assert!(source.physical_reads() < 32);
        source.failing.clear();
        let late = cache.read(&mut source, 30).unwrap();
        assert!(!late.is_resident());
    }

    #[test]
    fn test_intelligent_keeps_only_descriptors() {
        let mut source = FakeSource::new(256);
        source.put_descriptor(100);
        source.put_descriptor(110);
        let mut cache = BlockCache::new(config(CachePolicy::Intelligent), 0..256);

        let handle = cache.read(&mut source, 100).unwrap();
        assert!(handle.is_resident());
        assert_eq!(source.hints, vec![(68, 64)]);
        assert_eq!(cache.stats().resident, 2);

        let plain = cache.read(&mut source, 101).unwrap();
        assert!(!plain.is_resident());
        assert_eq!(cache.stats().direct_reads, 1);

        let hit = cache.read(&mut source, 110).unwrap();
        assert!(hit.is_resident());
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_intelligent_released_block_is_never_a_hit() {
        let mut source = FakeSource::new(256);
        let mut cache = BlockCache::new(config(CachePolicy::Intelligent), 0..256);

        let first = cache.read(&mut source, 50).unwrap();
        assert!(!first.is_resident());
        source.blocks[50][0] = 0x77;
        let second = cache.read(&mut source, 50).unwrap();
        assert!(!second.is_resident());
        assert_eq!(cache.bytes(&second)[0], 0x77);
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn test_intelligent_counts_only_successful_reads() {
        let mut source = FakeSource::new(256);
        source.failing.insert(70);
        let mut cache = BlockCache::new(config(CachePolicy::Intelligent), 0..256);

        cache.read(&mut source, 100).unwrap();
        // window 68..132; the batch holding 70 is retried block by block
        assert_eq!(cache.stats().blocks_read, 63);
        assert!(source.physical_reads() > 64);
    }

    #[test]
    fn test_smart_counts_only_successful_reads() {
        let mut source = FakeSource::new(64);
        source.failing.insert(9);
        let mut cache = BlockCache::new(config(CachePolicy::Smart), 0..32);

        cache.read(&mut source, 0).unwrap();
        assert_eq!(cache.stats().blocks_read, 31);
    }

    #[test]
    fn test_intelligent_ceiling_flips_full() {
        let mut source = FakeSource::new(512);
        let mut cache = BlockCache::new(config(CachePolicy::Intelligent), 0..512);
        for block in [40u64, 120, 200, 280] {
            cache.read(&mut source, block).unwrap();
        }
        assert_eq!(cache.state(), CacheState::Full);
        let reads = source.physical_reads();
        cache.read(&mut source, 400).unwrap();
        assert_eq!(source.physical_reads(), reads + 1);
    }

    #[test]
    fn test_invalidate_and_cleanup() {
        let mut source = FakeSource::new(64);
        source.put_descriptor(8);
        let mut cache = BlockCache::new(config(CachePolicy::Intelligent), 0..64);
        let stale = cache.read(&mut source, 8).unwrap();
        assert!(stale.is_resident());

        cache.invalidate(8);
        assert!(cache.bytes(&stale).is_empty());
        let fresh = cache.read(&mut source, 8).unwrap();
        assert!(!fresh.is_resident());

        cache.cleanup();
        assert_eq!(cache.stats(), CacheStats::default());
        assert_eq!(cache.state(), CacheState::Cold);
    }
}
