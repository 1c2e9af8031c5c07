//! Sparable partitions (UDF 2.2.9, 2.2.12)
//!
//! Rewritable media remap defective packets through sparing tables. Each
//! table is recorded at an absolute block and lists `(original packet,
//! replacement block)` pairs sorted by original packet. Up to four copies
//! of the table may exist; copies that do not identify themselves as a
//! sparing table, or whose entries overrun the block, are dropped.

use tracing::{debug, warn};

use crate::device::UdfDevice;
use crate::error::{Result, UdfError};
use crate::media::MediaReader;
use crate::types::{EntityId, TagIdentifier, IDENT_SPARING_TABLE};
use crate::utils::sector::{read_u16, read_u32};

/// Most sparing tables a map may declare
pub const MAX_SPARING_TABLES: u8 = 4;

/// Fixed part of a sparing table before the entries
const TABLE_HEADER_SIZE: usize = 56;
const ENTRY_SIZE: usize = 8;

/// Original locations at or above this value mark unused entries
const UNUSED_ENTRY: u32 = 0xFFFF_FFF0;

/// One remapped packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SparingEntry {
    /// First block of the original packet (partition relative)
    pub original: u32,
    /// First block of the replacement packet (absolute)
    pub mapped: u32,
}

/// Sparable map payload plus the loaded remap entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparingTable {
    /// Packet length in blocks, a power of two
    pub packet_length: u16,
    /// Size of each table in bytes
    pub table_size: u32,
    /// Absolute block of every recorded table copy
    pub locations: Vec<u32>,
    /// Remap entries sorted by original packet
    pub entries: Vec<SparingEntry>,
    /// Table copies that loaded successfully
    pub loaded_tables: usize,
}

impl SparingTable {
    /// Decode bytes 40..64 of a sparable partition map
    ///
    /// # Errors
    /// Configuration errors for a packet length that is not a power of two,
    /// more than four tables, or a table larger than one block.
    pub fn from_map_payload(payload: &[u8; 24], block_size: u32) -> Result<Self> {
        let packet_length = read_u16(payload, 0);
        let table_count = payload[2];
        let table_size = read_u32(payload, 4);

        if packet_length == 0 || !packet_length.is_power_of_two() {
            return Err(UdfError::InvalidPacketLength(packet_length));
        }
        if table_count > MAX_SPARING_TABLES {
            return Err(UdfError::TooManySparingTables(table_count));
        }
        if table_size > block_size {
            return Err(UdfError::SparingTableTooLarge {
                size: table_size,
                block_size,
            });
        }

        let locations = (0..table_count as usize)
            .map(|i| read_u32(payload, 8 + i * 4))
            .collect();
        Ok(Self {
            packet_length,
            table_size,
            locations,
            entries: Vec::new(),
            loaded_tables: 0,
        })
    }

    /// Read every table copy and merge their entries
    pub fn load<B: UdfDevice>(&mut self, reader: &mut MediaReader<'_, B>) -> Result<()> {
        let mut entries: Vec<SparingEntry> = Vec::new();
        self.loaded_tables = 0;

        for &location in &self.locations {
            let parsed = match reader.with_descriptor(location as u64, Some(location), |tag, data| {
                Ok(parse_table(tag.identifier, data))
            }) {
                Ok(Some(Some(table))) => table,
                Ok(_) => {
                    debug!(location, "sparing table copy rejected");
                    continue;
                }
                Err(err) if err.is_recoverable() => {
                    warn!(location, %err, "sparing table unreadable");
                    continue;
                }
                Err(err) => return Err(err),
            };
            entries
                .try_reserve(parsed.len())
                .map_err(|_| UdfError::OutOfMemory("sparing table"))?;
            entries.extend(parsed);
            self.loaded_tables += 1;
        }

        // first copy wins for duplicated originals
        entries.sort_by_key(|e| e.original);
        entries.dedup_by_key(|e| e.original);
        debug!(
            tables = self.loaded_tables,
            entries = entries.len(),
            "sparing tables loaded"
        );
        self.entries = entries;
        Ok(())
    }

    /// Remapped absolute block for a partition-relative block, if any
    pub fn lookup(&self, block: u32) -> Option<u32> {
        let mask = self.packet_length as u32 - 1;
        let packet = block & !mask;
        self.entries
            .binary_search_by_key(&packet, |e| e.original)
            .ok()
            .map(|i| self.entries[i].mapped + (block & mask))
    }
}

fn parse_table(identifier: TagIdentifier, data: &[u8]) -> Option<Vec<SparingEntry>> {
    if identifier != TagIdentifier::SparingTable || data.len() < TABLE_HEADER_SIZE {
        return None;
    }
    if !EntityId::parse(data, 16).matches(IDENT_SPARING_TABLE) {
        return None;
    }
    let count = read_u16(data, 48) as usize;
    if TABLE_HEADER_SIZE + count * ENTRY_SIZE > data.len() {
        return None;
    }
    Some(
        (0..count)
            .map(|i| {
                let at = TABLE_HEADER_SIZE + i * ENTRY_SIZE;
                SparingEntry {
                    original: read_u32(data, at),
                    mapped: read_u32(data, at + 4),
                }
            })
            .filter(|e| e.original < UNUSED_ENTRY)
            .collect(),
    )
}
