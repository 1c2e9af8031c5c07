//! Low-level helpers shared by the descriptor codecs and the mount pipeline

pub mod checksum;
pub mod datetime;
pub mod sector;
pub mod string;
