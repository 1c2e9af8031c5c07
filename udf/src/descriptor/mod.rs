//! On-disk descriptor handling
//!
//! [`tag`] decides whether a block can be trusted at all; the remaining
//! modules decode the fixed layouts of trusted blocks.

pub mod file;
pub mod integrity;
pub mod tag;
pub mod volume;

pub use tag::{seal, validate, Classification, DescriptorTag, TagFaults};
