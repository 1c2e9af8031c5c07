//! Simple and Smart policies: fill the whole range on first use

use tracing::{debug, warn};

use super::{BlockCache, BlockHandle, CachePolicy, CacheState, Entry};
use crate::device::BlockSource;
use crate::error::Result;

impl BlockCache {
    pub(super) fn read_eager<S: BlockSource + ?Sized>(
        &mut self,
        source: &mut S,
        block: u64,
    ) -> Result<BlockHandle> {
        if self.state == CacheState::Cold {
            match self.config.policy {
                CachePolicy::Simple => self.fill_simple(source)?,
                CachePolicy::Smart => self.fill_smart(source)?,
                CachePolicy::Intelligent => {}
            }
        }
        self.serve(source, block)
    }

    fn fill_simple<S: BlockSource + ?Sized>(&mut self, source: &mut S) -> Result<()> {
        let bs = source.block_size();
        let batch = self.config.batch.max(1);
        let mut buf = vec![0u8; bs * batch as usize];
        let mut start = self.range.start;

        while start < self.range.end {
            let count = batch.min(self.range.end - start);
            let chunk = &mut buf[..count as usize * bs];
            if let Err(err) = source.read_blocks(start, chunk) {
                warn!(%err, "cache fill failed, reading uncached for the rest of this mount");
                self.discard();
                self.state = CacheState::Full;
                return Ok(());
            }
            self.stats.blocks_read += count;
            for (i, data) in chunk.chunks(bs).enumerate() {
                self.store(start + i as u64, data)?;
            }
            start += count;
        }

        debug!(blocks = self.range.end - self.range.start, "cache filled");
        self.state = CacheState::Warm;
        Ok(())
    }

    fn fill_smart<S: BlockSource + ?Sized>(&mut self, source: &mut S) -> Result<()> {
        let bs = source.block_size();
        let batch = self.config.batch.max(1);
        let deadline = self.config.deadline;
        let started = source.now();
        let expired = |now: std::time::Duration| now.saturating_sub(started) >= deadline;

        let mut buf = vec![0u8; bs * batch as usize];
        let mut single = vec![0u8; bs];
        let mut unreadable = 0u64;
        let mut start = self.range.start;
        self.state = CacheState::Warm;

        while start < self.range.end {
            if expired(source.now()) {
                unreadable += self.abandon(start);
                break;
            }
            let count = batch.min(self.range.end - start);
            let chunk = &mut buf[..count as usize * bs];
            if source.read_blocks(start, chunk).is_ok() {
                self.stats.blocks_read += count;
                for (i, data) in chunk.chunks(bs).enumerate() {
                    self.store(start + i as u64, data)?;
                }
                start += count;
                continue;
            }

            debug!(start, count, "cache batch failed, retrying per block");
            for block in start..start + count {
                if expired(source.now()) {
                    unreadable += self.abandon(block);
                    warn!(unreadable, "cache fill deadline passed");
                    return Ok(());
                }
                match source.read_blocks(block, &mut single) {
                    Ok(()) => {
                        self.stats.blocks_read += 1;
                        self.store(block, &single)?;
                    }
                    Err(_) => {
                        self.mark(block, Entry::Unreadable);
                        unreadable += 1;
                    }
                }
            }
            start += count;
        }

        if unreadable > 0 {
            warn!(unreadable, "cache filled with unreadable blocks");
        } else {
            debug!(blocks = self.range.end - self.range.start, "cache filled");
        }
        Ok(())
    }

    /// Mark `from..range.end` unreadable; returns how many blocks that was
    fn abandon(&mut self, from: u64) -> u64 {
        let end = self.range.end;
        for block in from..end {
            self.mark(block, Entry::Unreadable);
        }
        end.saturating_sub(from)
    }

    fn discard(&mut self) {
        self.arena.clear();
        self.free.clear();
        self.index.clear();
    }
}
