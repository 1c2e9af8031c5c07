//! Device seam
//!
//! The mount pipeline reads through [`gpt_disk_io::BlockIo`], the same
//! block device trait the rest of the workspace uses. [`UdfDevice`] adds the
//! two optical-drive hooks the pipeline can make use of; both default to
//! no-ops so any `BlockIo` can opt in with an empty impl.
//!
//! [`RawDevice`] sits on top and speaks in *logical* blocks: it scales the
//! negotiated UDF block size onto the device block size, applies fixed or
//! variable packet addressing, and classifies failed reads as timeouts or
//! plain read errors using an injected [`Clock`].

use std::time::{Duration, Instant};

use gpt_disk_io::BlockIo;
use gpt_disk_types::Lba;
use tracing::{debug, trace};

use crate::error::{Result, UdfError};
use crate::utils::sector::fixed_to_variable;

/// A failed read slower than this is reported as a timeout
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Optical-drive extensions to [`BlockIo`]
pub trait UdfDevice: BlockIo {
    /// Hint that `count` device blocks starting at `start` will be read soon
    fn read_ahead(&mut self, _start: Lba, _count: u64) {}

    /// Last recorded block in device blocks, if the drive can tell
    ///
    /// Drives of recordable media often know where the last session ends;
    /// this is a better last-block estimate than the device size.
    fn last_written_block(&mut self) -> Option<u64> {
        None
    }
}

/// Time source for read classification and cache deadlines
pub trait Clock {
    /// Time elapsed since an arbitrary fixed origin
    fn now(&self) -> Duration;
}

/// [`Clock`] backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Clock whose origin is the moment of creation
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Block address mapping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Addressing {
    /// Logical block n is device block n
    #[default]
    Fixed,
    /// 32 user blocks per 39-block packet
    Variable,
}

/// Source of raw logical blocks, as seen by the cache
pub trait BlockSource {
    /// Logical block size in bytes
    fn block_size(&self) -> usize;

    /// Number of addressable logical blocks
    fn block_count(&self) -> u64;

    /// Read `buf.len() / block_size` consecutive blocks starting at `start`
    fn read_blocks(&mut self, start: u64, buf: &mut [u8]) -> Result<()>;

    /// Pass a read-ahead hint to the device
    fn read_ahead(&mut self, start: u64, count: u64);

    /// Current time for deadline bookkeeping
    fn now(&self) -> Duration;
}

/// Logical-block view of a [`UdfDevice`]
pub struct RawDevice<'d, B: UdfDevice> {
    device: &'d mut B,
    clock: Box<dyn Clock + 'd>,
    block_size: u32,
    /// Device blocks per logical block
    ratio: u64,
    device_blocks: u64,
    addressing: Addressing,
}

impl<'d, B: UdfDevice> RawDevice<'d, B> {
    /// Wrap a device with the given logical block size
    ///
    /// # Errors
    /// `InvalidBlockSize` when `block_size` is not a multiple of the device
    /// block size; `Io` when the device size cannot be queried.
    pub fn new(device: &'d mut B, clock: Box<dyn Clock + 'd>, block_size: u32) -> Result<Self> {
        let device_blocks = device.num_blocks().map_err(|e| UdfError::Io {
            block: 0,
            detail: e.to_string(),
        })?;
        let mut raw = Self {
            device,
            clock,
            block_size: 0,
            ratio: 1,
            device_blocks,
            addressing: Addressing::Fixed,
        };
        raw.set_block_size(block_size)?;
        Ok(raw)
    }

    /// Device block size in bytes
    pub fn device_block_size(&self) -> u32 {
        self.device.block_size().to_u32()
    }

    /// Switch the logical block size
    pub fn set_block_size(&mut self, block_size: u32) -> Result<()> {
        let dev = self.device_block_size();
        if block_size == 0 || dev == 0 || block_size < dev || block_size % dev != 0 {
            return Err(UdfError::InvalidBlockSize(block_size));
        }
        self.block_size = block_size;
        self.ratio = (block_size / dev) as u64;
        Ok(())
    }

    /// Current logical block size
    pub fn logical_block_size(&self) -> u32 {
        self.block_size
    }

    /// Current addressing mode
    pub fn addressing(&self) -> Addressing {
        self.addressing
    }

    /// Switch addressing mode
    pub fn set_addressing(&mut self, addressing: Addressing) {
        if self.addressing != addressing {
            debug!("switching to {:?} block addressing", addressing);
        }
        self.addressing = addressing;
    }

    /// Last block of the device in logical blocks
    pub fn device_last_block(&self) -> u64 {
        (self.device_blocks / self.ratio).saturating_sub(1)
    }

    /// Last recorded logical block as reported by the drive, if any
    pub fn last_written_block(&mut self) -> Option<u64> {
        self.device
            .last_written_block()
            .map(|last| last / self.ratio)
    }

    fn map(&self, block: u64) -> u64 {
        match self.addressing {
            Addressing::Fixed => block,
            Addressing::Variable => fixed_to_variable(block),
        }
    }

    fn read_mapped(&mut self, mapped: u64, buf: &mut [u8]) -> Result<()> {
        let count = (buf.len() / self.block_size as usize) as u64;
        let blocks = self.device_blocks / self.ratio;
        if mapped.checked_add(count).map_or(true, |end| end > blocks) {
            return Err(UdfError::OutOfRange { block: mapped, blocks });
        }
        let started = self.clock.now();
        let lba = Lba(mapped * self.ratio);
        match self.device.read_blocks(lba, buf) {
            Ok(()) => Ok(()),
            Err(e) => {
                let elapsed = self.clock.now().saturating_sub(started);
                if elapsed > READ_TIMEOUT {
                    Err(UdfError::Timeout {
                        block: mapped,
                        elapsed_ms: elapsed.as_millis() as u64,
                    })
                } else {
                    Err(UdfError::Io {
                        block: mapped,
                        detail: e.to_string(),
                    })
                }
            }
        }
    }

    /// Write one logical block
    pub fn write_block(&mut self, block: u64, data: &[u8]) -> Result<()> {
        let mapped = self.map(block);
        let lba = Lba(mapped * self.ratio);
        self.device.write_blocks(lba, data).map_err(|e| UdfError::Io {
            block,
            detail: e.to_string(),
        })
    }

    /// Flush device write caches
    pub fn flush(&mut self) -> Result<()> {
        self.device.flush().map_err(|e| UdfError::Io {
            block: 0,
            detail: e.to_string(),
        })
    }
}

impl<'d, B: UdfDevice> BlockSource for RawDevice<'d, B> {
    fn block_size(&self) -> usize {
        self.block_size as usize
    }

    fn block_count(&self) -> u64 {
        self.device_blocks / self.ratio
    }

    fn read_blocks(&mut self, start: u64, buf: &mut [u8]) -> Result<()> {
        trace!(start, len = buf.len(), "raw read");
        match self.addressing {
            Addressing::Fixed => self.read_mapped(start, buf),
            Addressing::Variable => {
                // packets are not contiguous on the device
                let bs = self.block_size as usize;
                for (i, chunk) in buf.chunks_mut(bs).enumerate() {
                    let mapped = self.map(start + i as u64);
                    self.read_mapped(mapped, chunk)?;
                }
                Ok(())
            }
        }
    }

    fn read_ahead(&mut self, start: u64, count: u64) {
        let lba = Lba(self.map(start) * self.ratio);
        self.device.read_ahead(lba, count * self.ratio);
    }

    fn now(&self) -> Duration {
        self.clock.now()
    }
}

/// Block sizes to try, in order
///
/// A configured size is tried alone. Otherwise 2048 first, then the
/// device block size doubled up to 4096.
pub fn candidate_block_sizes(configured: Option<u32>, device_block_size: u32) -> Vec<u32> {
    if let Some(size) = configured {
        return vec![size];
    }
    let mut sizes = Vec::new();
    if device_block_size <= crate::types::DEFAULT_BLOCK_SIZE {
        sizes.push(crate::types::DEFAULT_BLOCK_SIZE);
    }
    let mut size = device_block_size.max(512);
    while size <= crate::types::MAX_BLOCK_SIZE {
        if !sizes.contains(&size) {
            sizes.push(size);
        }
        size <<= 1;
    }
    sizes
}
