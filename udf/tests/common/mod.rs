//! Common test utilities and mock block devices

#![allow(dead_code)]

pub mod builder;
pub use builder::UdfImageBuilder;

use gpt_disk_io::BlockIo;
use gpt_disk_types::{BlockSize, Lba};
use std::cell::Cell;
use std::collections::BTreeSet;
use std::io;
use std::rc::Rc;
use std::time::Duration;
use udf::{Clock, UdfDevice};

/// Clock the tests advance by hand
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<Duration>>);

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        self.0.set(self.0.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.0.get()
    }
}

/// In-memory block device for testing
#[derive(Debug, Clone)]
pub struct MemoryBlockDevice {
    pub data: Vec<u8>,
    pub block_size: usize,
    /// Device LBAs whose reads fail
    pub failing: BTreeSet<u64>,
    /// Advanced by `fail_latency` on every failed read
    pub clock: Option<ManualClock>,
    pub fail_latency: Duration,
    /// (start LBA, block count) of every read
    pub reads: Vec<(u64, u64)>,
    /// (start LBA, block count) of every read-ahead hint
    pub hints: Vec<(u64, u64)>,
    /// Start LBA of every write
    pub writes: Vec<u64>,
    /// Reported by `last_written_block`
    pub last_written: Option<u64>,
}

impl MemoryBlockDevice {
    /// Create a new memory block device from raw data
    pub fn new(data: Vec<u8>, block_size: usize) -> Self {
        Self {
            data,
            block_size,
            failing: BTreeSet::new(),
            clock: None,
            fail_latency: Duration::ZERO,
            reads: Vec::new(),
            hints: Vec::new(),
            writes: Vec::new(),
            last_written: None,
        }
    }

    /// Make reads touching `lba` fail
    pub fn fail_at(&mut self, lba: u64) {
        self.failing.insert(lba);
    }

    /// Attach a clock that failed reads advance
    pub fn with_clock(&mut self, latency: Duration) -> ManualClock {
        let clock = ManualClock::default();
        self.clock = Some(clock.clone());
        self.fail_latency = latency;
        clock
    }

    /// Whether any read touched `lba`
    pub fn was_read(&self, lba: u64) -> bool {
        self.reads
            .iter()
            .any(|&(start, count)| lba >= start && lba < start + count)
    }

    /// Copy of one device block
    pub fn block(&self, lba: u64) -> &[u8] {
        let at = lba as usize * self.block_size;
        &self.data[at..at + self.block_size]
    }

    pub fn block_mut(&mut self, lba: u64) -> &mut [u8] {
        let at = lba as usize * self.block_size;
        &mut self.data[at..at + self.block_size]
    }
}

impl BlockIo for MemoryBlockDevice {
    type Error = io::Error;

    fn block_size(&self) -> BlockSize {
        BlockSize::new(self.block_size as u32).expect("valid block size")
    }

    fn num_blocks(&mut self) -> Result<u64, Self::Error> {
        Ok((self.data.len() / self.block_size) as u64)
    }

    fn read_blocks(&mut self, start_lba: Lba, dst: &mut [u8]) -> Result<(), Self::Error> {
        let count = (dst.len() / self.block_size) as u64;
        self.reads.push((start_lba.0, count));
        if (start_lba.0..start_lba.0 + count).any(|lba| self.failing.contains(&lba)) {
            if let Some(clock) = &self.clock {
                clock.advance(self.fail_latency);
            }
            return Err(io::Error::new(io::ErrorKind::Other, "medium error"));
        }
        let offset = start_lba.0 as usize * self.block_size;
        if offset + dst.len() > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read beyond end of device",
            ));
        }
        dst.copy_from_slice(&self.data[offset..offset + dst.len()]);
        Ok(())
    }

    fn write_blocks(&mut self, start_lba: Lba, src: &[u8]) -> Result<(), Self::Error> {
        let offset = start_lba.0 as usize * self.block_size;
        if offset + src.len() > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write beyond end of device",
            ));
        }
        self.writes.push(start_lba.0);
        self.data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl UdfDevice for MemoryBlockDevice {
    fn read_ahead(&mut self, start: Lba, count: u64) {
        self.hints.push((start.0, count));
    }

    fn last_written_block(&mut self) -> Option<u64> {
        self.last_written
    }
}
