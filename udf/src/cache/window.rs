//! Intelligent policy: windowed reads, keep descriptors only

use std::ops::Range;

use tracing::debug;

use super::{BlockCache, BlockHandle, CacheState, Entry};
use crate::descriptor::tag::{validate, Classification};
use crate::device::BlockSource;
use crate::error::Result;

impl BlockCache {
    pub(super) fn read_windowed<S: BlockSource + ?Sized>(
        &mut self,
        source: &mut S,
        block: u64,
    ) -> Result<BlockHandle> {
        // released and unreadable blocks are never filled again
        if self.is_known(block) || self.state == CacheState::Full {
            return self.direct(source, block);
        }

        let window = self.window_around(block);
        source.read_ahead(window.start, window.end - window.start);

        let bs = source.block_size();
        let batch = self.config.batch.max(1);
        let mut buf = vec![0u8; bs * batch as usize];
        let mut single = vec![0u8; bs];
        let mut requested = None;
        let mut kept = 0u64;
        let mut start = window.start;

        while start < window.end {
            let count = batch.min(window.end - start);
            let chunk = &mut buf[..count as usize * bs];
            if source.read_blocks(start, chunk).is_ok() {
                self.stats.blocks_read += count;
                for (i, data) in chunk.chunks(bs).enumerate() {
                    let at = start + i as u64;
                    kept += self.classify(at, data, block, &mut requested)?;
                }
            } else {
                for at in start..start + count {
                    if source.read_blocks(at, &mut single).is_ok() {
                        self.stats.blocks_read += 1;
                        kept += self.classify(at, &single, block, &mut requested)?;
                    } else if !self.is_known(at) {
                        self.mark(at, Entry::Unreadable);
                    }
                }
            }
            start += count;
        }

        self.state = if self.stats.blocks_read >= self.config.ceiling {
            debug!(read = self.stats.blocks_read, "cache ceiling reached");
            CacheState::Full
        } else {
            CacheState::Warm
        };
        debug!(start = window.start, end = window.end, kept, "cache window read");

        match requested {
            Some(data) => Ok(BlockHandle::Detached { block, data }),
            None => self.serve(source, block),
        }
    }

    /// Window of `config.window` blocks centred on `block`, clipped to the range
    fn window_around(&self, block: u64) -> Range<u64> {
        let half = self.config.window / 2;
        let start = block.saturating_sub(half).max(self.range.start);
        let end = start.saturating_add(self.config.window).min(self.range.end);
        let start = end.saturating_sub(self.config.window).max(self.range.start);
        start..end
    }

    /// Keep a freshly read block if it is a descriptor
    ///
    /// The requested block's data is handed back through `requested` when it
    /// is not kept, so it need not be read twice.
    fn classify(
        &mut self,
        at: u64,
        data: &[u8],
        wanted: u64,
        requested: &mut Option<Vec<u8>>,
    ) -> Result<u64> {
        if self.is_known(at) {
            return Ok(0);
        }
        match validate(data, None) {
            Classification::Valid(_) => {
                self.store(at, data)?;
                Ok(1)
            }
            _ => {
                self.mark(at, Entry::Released);
                if at == wanted {
                    *requested = Some(data.to_vec());
                }
                Ok(0)
            }
        }
    }
}
