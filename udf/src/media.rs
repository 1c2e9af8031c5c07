//! Single read/release entry point for the mount pipeline
//!
//! Every descriptor read of a mount goes through one [`MediaReader`]. It
//! owns the mount's [`BlockCache`] (when enabled) and the logical-block view
//! of the device, so there is no cache state outside the mount that created
//! it.

use tracing::trace;

use crate::cache::{BlockCache, BlockHandle, CacheConfig, CacheStats};
use crate::descriptor::tag::{validate, DescriptorTag};
use crate::device::{Addressing, BlockSource, RawDevice, UdfDevice};
use crate::error::Result;

/// Cached reader over a [`UdfDevice`]
pub struct MediaReader<'d, B: UdfDevice> {
    raw: RawDevice<'d, B>,
    cache: Option<BlockCache>,
    cache_config: Option<CacheConfig>,
    session_start: u64,
}

impl<'d, B: UdfDevice> MediaReader<'d, B> {
    /// Create a reader; `cache` of `None` reads everything directly
    pub fn new(raw: RawDevice<'d, B>, cache: Option<CacheConfig>, session_start: u64) -> Self {
        let mut reader = Self {
            raw,
            cache: None,
            cache_config: cache,
            session_start,
        };
        reader.rebuild_cache();
        reader
    }

    fn rebuild_cache(&mut self) {
        self.cache = self.cache_config.as_ref().map(|config| {
            let range = config.range_for(self.session_start, self.raw.block_count());
            BlockCache::new(config.clone(), range)
        });
    }

    /// Read a logical block
    pub fn read(&mut self, block: u64) -> Result<BlockHandle> {
        match self.cache.as_mut() {
            Some(cache) => cache.read(&mut self.raw, block),
            None => {
                let mut data = vec![0u8; self.raw.block_size()];
                self.raw.read_blocks(block, &mut data)?;
                Ok(BlockHandle::Detached { block, data })
            }
        }
    }

    /// Borrow the contents of a handle
    pub fn bytes<'a>(&'a self, handle: &'a BlockHandle) -> &'a [u8] {
        match (&self.cache, handle) {
            (Some(cache), _) => cache.bytes(handle),
            (None, BlockHandle::Detached { data, .. }) => data,
            (None, BlockHandle::Resident { .. }) => &[],
        }
    }

    /// Return a handle obtained from [`read`](Self::read)
    pub fn release(&mut self, handle: BlockHandle) {
        match self.cache.as_mut() {
            Some(cache) => cache.release(handle),
            None => drop(handle),
        }
    }

    /// Read a block and run `f` over its bytes
    pub fn with_block<T>(&mut self, block: u64, f: impl FnOnce(&[u8]) -> T) -> Result<T> {
        let handle = self.read(block)?;
        let out = f(self.bytes(&handle));
        self.release(handle);
        Ok(out)
    }

    /// Read a block and run `f` over it when it validates as a descriptor
    ///
    /// # Arguments
    /// * `block` - Logical block to read
    /// * `location` - Expected tag location, when known
    /// * `f` - Parser for the trusted block
    ///
    /// # Returns
    /// `Ok(None)` when the block is not a trusted descriptor; read errors
    /// and errors from `f` are propagated.
    pub fn with_descriptor<T>(
        &mut self,
        block: u64,
        location: Option<u32>,
        f: impl FnOnce(&DescriptorTag, &[u8]) -> Result<T>,
    ) -> Result<Option<T>> {
        let handle = self.read(block)?;
        let data = self.bytes(&handle);
        let out = match validate(data, location).valid() {
            Some(tag) => f(&tag, data).map(Some),
            None => {
                trace!(block, "not a trusted descriptor");
                Ok(None)
            }
        };
        self.release(handle);
        out
    }

    /// Write a logical block, dropping any cached copy
    pub fn write_block(&mut self, block: u64, data: &[u8]) -> Result<()> {
        if let Some(cache) = self.cache.as_mut() {
            cache.invalidate(block);
        }
        self.raw.write_block(block, data)
    }

    /// Flush device write caches
    pub fn flush(&mut self) -> Result<()> {
        self.raw.flush()
    }

    /// Logical block size
    pub fn block_size(&self) -> u32 {
        self.raw.logical_block_size()
    }

    /// Device block size
    pub fn device_block_size(&self) -> u32 {
        self.raw.device_block_size()
    }

    /// Switch logical block size; cached blocks are dropped
    pub fn set_block_size(&mut self, block_size: u32) -> Result<()> {
        if block_size != self.raw.logical_block_size() {
            self.raw.set_block_size(block_size)?;
            self.teardown();
            self.rebuild_cache();
        }
        Ok(())
    }

    /// Current addressing mode
    pub fn addressing(&self) -> Addressing {
        self.raw.addressing()
    }

    /// Switch addressing mode; cached blocks are dropped
    pub fn set_addressing(&mut self, addressing: Addressing) {
        if addressing != self.raw.addressing() {
            self.raw.set_addressing(addressing);
            if let Some(cache) = self.cache.as_mut() {
                cache.cleanup();
            }
        }
    }

    /// Number of logical blocks on the device
    pub fn block_count(&self) -> u64 {
        self.raw.block_count()
    }

    /// Last logical block of the device
    pub fn device_last_block(&self) -> u64 {
        self.raw.device_last_block()
    }

    /// Last recorded block as reported by the drive
    pub fn last_written_block(&mut self) -> Option<u64> {
        self.raw.last_written_block()
    }

    /// Cache counters, when a cache is active
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(BlockCache::stats)
    }

    /// The active cache, if any
    pub fn cache(&self) -> Option<&BlockCache> {
        self.cache.as_ref()
    }

    /// Release every cached block
    pub fn teardown(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.cleanup();
        }
    }
}
