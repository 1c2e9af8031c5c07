//! UDF Volume Recognition and Mount
//!
//! Recognises and mounts UDF (ECMA-167 / OSTA UDF) volumes on optical and
//! block media, up to the point where higher layers can start walking
//! directories.
//!
//! # Overview
//!
//! UDF is the file system of DVD and Blu-ray media and of packet-written
//! rewritable discs. This crate provides:
//! - Descriptor tag validation (checksum, CRC, version, location)
//! - Volume recognition sequence and anchor pointer search
//! - Main/reserve volume descriptor sequence processing
//! - Physical, sparable, virtual (VAT) and metadata partitions
//! - Logical volume integrity handling for read-write mounts
//! - An optional block cache tuned for slow, scratched optical media
//!
//! # Architecture
//!
//! The implementation is layered:
//! 1. **Device layer** - [`device`] scales UDF blocks onto any
//!    `gpt_disk_io::BlockIo` and classifies failed reads
//! 2. **Cache layer** - [`cache`] and [`media`] serve every descriptor read
//! 3. **Descriptor layer** - [`descriptor`] validates and decodes blocks
//! 4. **Partition layer** - [`partition`] resolves maps and translates blocks
//! 5. **Volume layer** - [`volume`] runs the mount pipeline
//!
//! # Usage
//!
//! ```ignore
//! use udf::{mount, MountOptions};
//!
//! let options: MountOptions = "ro,cache=intelligent".parse()?;
//! let mut volume = mount(&mut block_io, &options)?;
//!
//! let root = volume.root_directory();
//! let icb = volume.read_logical(root.partition, root.block)?;
//!
//! volume.unmount()?;
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod media;
pub mod options;
pub mod partition;
pub mod types;
pub mod utils;
pub mod volume;

pub use cache::{CacheConfig, CachePolicy, CacheStats};
pub use device::{Clock, MonotonicClock, UdfDevice};
pub use error::{ErrorKind, Result, UdfError};
pub use options::MountOptions;
pub use types::LbAddr;

// High-level API exports
pub use volume::{mount, mount_with_clock, Volume, VolumeState};
