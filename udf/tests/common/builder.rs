use crate::common::MemoryBlockDevice;
use udf::descriptor::tag::{seal, DescriptorTag};
use udf::types::TagIdentifier;
use udf::utils::sector::{write_u16, write_u32};
use udf::utils::string::encode_dstring;

pub const MAIN_VDS: u32 = 32;
pub const RESERVE_VDS: u32 = 48;
pub const VDS_BLOCKS: u32 = 16;
/// Continuation extent used by `pointer_continuation`
pub const CONTINUATION_VDS: u32 = 100;
pub const LVID_BLOCK: u32 = 64;
pub const LVID_BLOCKS: u32 = 4;
/// Second integrity extent used by `lvid_chain`
pub const LVID_CONTINUATION: u32 = 70;
pub const SPARING_TABLES: [u32; 2] = [80, 81];
pub const PARTITION_START: u32 = 272;
/// Second physical partition used by `misnumbered_metadata`
pub const SECOND_PARTITION_START: u32 = 200;
pub const SECOND_PARTITION_LENGTH: u32 = 40;

/// Metadata file entries and extent, relative to the physical partition
pub const METADATA_FILE: u32 = 10;
pub const METADATA_MIRROR: u32 = 11;
pub const METADATA_EXTENT: u32 = 20;
pub const METADATA_BLOCKS: u32 = 16;

/// Leading partition blocks marked allocated: bitmap, file set, root
pub const USED_BLOCKS: u32 = 3;

const NO_LOCATION: u32 = u32::MAX;
const FILE_TYPE_DIRECTORY: u8 = 4;
const FILE_TYPE_VAT20: u8 = 248;
const FILE_TYPE_METADATA: u8 = 250;
const FILE_TYPE_METADATA_MIRROR: u8 = 251;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionLayout {
    /// One type 1 map
    Physical,
    /// Sparable map; `remap` holds (original packet, replacement block) pairs
    Sparable { packet: u16, remap: Vec<(u32, u32)> },
    /// Physical map plus a metadata map; either file entry can be left out
    Metadata { main: bool, mirror: bool },
    /// Physical map plus a virtual map, VAT 2.00 in the last block
    Virtual,
}

/// Builds small but complete UDF images
pub struct UdfImageBuilder {
    block_size: usize,
    device_block_size: usize,
    blocks: u64,
    layout: PartitionLayout,
    vrs: Vec<&'static [u8; 5]>,
    anchors: Option<Vec<u64>>,
    reserve: bool,
    corrupt_main_pvd: bool,
    pointer_continuation: bool,
    overwritable: bool,
    lvid: bool,
    lvid_chain: bool,
    revisions: Option<(u16, u16, u16)>,
    udf_revision: u16,
    free_space: u32,
    fileset_unset: bool,
    domain_flags: u8,
    volume_id: &'static str,
    metadata_bitmap: Option<u32>,
    misnumbered_metadata: bool,
}

struct Image {
    data: Vec<u8>,
    bs: usize,
}

impl Image {
    fn block(&mut self, block: u64) -> &mut [u8] {
        let at = block as usize * self.bs;
        &mut self.data[at..at + self.bs]
    }

    /// Write a descriptor at `block` whose tag records `location`
    fn descriptor(
        &mut self,
        block: u64,
        identifier: TagIdentifier,
        location: u32,
        fill: impl FnOnce(&mut [u8]),
    ) {
        let bs = self.bs;
        let data = self.block(block);
        data.fill(0);
        DescriptorTag::new(identifier, 1, location).write_to(data);
        fill(data);
        seal(data, bs - 16);
    }
}

fn entity(data: &mut [u8], at: usize, flags: u8, ident: &str, suffix: &[u8]) {
    data[at] = flags;
    data[at + 1..at + 1 + ident.len()].copy_from_slice(ident.as_bytes());
    data[at + 24..at + 24 + suffix.len()].copy_from_slice(suffix);
}

fn long_ad(data: &mut [u8], at: usize, length: u32, block: u32, partition: u16) {
    write_u32(data, at, length);
    write_u32(data, at + 4, block);
    write_u16(data, at + 8, partition);
}

impl Default for UdfImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UdfImageBuilder {
    pub fn new() -> Self {
        Self {
            block_size: 2048,
            device_block_size: 2048,
            blocks: 1024,
            layout: PartitionLayout::Physical,
            vrs: vec![b"BEA01", b"NSR03", b"TEA01"],
            anchors: None,
            reserve: true,
            corrupt_main_pvd: false,
            pointer_continuation: false,
            overwritable: false,
            lvid: true,
            lvid_chain: false,
            revisions: Some((0x0201, 0x0201, 0x0201)),
            udf_revision: 0x0201,
            free_space: NO_LOCATION,
            fileset_unset: false,
            domain_flags: 0,
            volume_id: "TEST_UDF",
            metadata_bitmap: None,
            misnumbered_metadata: false,
        }
    }

    /// Logical block size of the image; the device uses it too unless overridden
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self.device_block_size = block_size;
        self
    }

    pub fn device_block_size(mut self, size: usize) -> Self {
        self.device_block_size = size;
        self
    }

    pub fn blocks(mut self, blocks: u64) -> Self {
        self.blocks = blocks;
        self
    }

    pub fn layout(mut self, layout: PartitionLayout) -> Self {
        match layout {
            PartitionLayout::Metadata { .. } => {
                self.udf_revision = 0x0250;
                self.revisions = Some((0x0250, 0x0250, 0x0250));
            }
            PartitionLayout::Virtual => {
                self.udf_revision = 0x0200;
                self.revisions = Some((0x0200, 0x0200, 0x0200));
            }
            _ => {}
        }
        self.layout = layout;
        self
    }

    /// Volume structure descriptors written from byte 32768
    pub fn vrs(mut self, identifiers: &[&'static [u8; 5]]) -> Self {
        self.vrs = identifiers.to_vec();
        self
    }

    /// Blocks holding an AVDP; default 256 and the last block
    pub fn anchors(mut self, blocks: Vec<u64>) -> Self {
        self.anchors = Some(blocks);
        self
    }

    pub fn without_reserve(mut self) -> Self {
        self.reserve = false;
        self
    }

    /// Break the main sequence's PVD checksum
    pub fn corrupt_main_pvd(mut self) -> Self {
        self.corrupt_main_pvd = true;
        self
    }

    /// Record the main sequence's PD, LVD and TD behind a pointer
    pub fn pointer_continuation(mut self) -> Self {
        self.pointer_continuation = true;
        self
    }

    /// Overwritable partition with an unallocated space bitmap
    pub fn overwritable(mut self) -> Self {
        self.overwritable = true;
        self
    }

    pub fn without_lvid(mut self) -> Self {
        self.lvid = false;
        self
    }

    /// Stale open record at the first extent pointing at the live one
    pub fn lvid_chain(mut self) -> Self {
        self.lvid_chain = true;
        self
    }

    /// (min read, min write, max write); `None` drops the fields
    pub fn revisions(mut self, revisions: Option<(u16, u16, u16)>) -> Self {
        self.revisions = revisions;
        self
    }

    /// Free-space table entry of every partition
    pub fn free_space(mut self, free: u32) -> Self {
        self.free_space = free;
        self
    }

    /// Leave the LVD file set location unrecorded
    pub fn fileset_unset(mut self) -> Self {
        self.fileset_unset = true;
        self
    }

    /// Domain flags of the LVD and FSD domain identifiers
    pub fn domain_flags(mut self, flags: u8) -> Self {
        self.domain_flags = flags;
        self
    }

    pub fn volume_id(mut self, id: &'static str) -> Self {
        self.volume_id = id;
        self
    }

    /// Metadata bitmap file location recorded in the metadata map
    pub fn metadata_bitmap(mut self, location: u32) -> Self {
        self.metadata_bitmap = Some(location);
        self
    }

    /// Metadata map naming a second, empty physical partition instead of
    /// the one holding the metadata files
    pub fn misnumbered_metadata(mut self) -> Self {
        self.misnumbered_metadata = true;
        self
    }

    pub fn last_block(&self) -> u64 {
        self.blocks - 1
    }

    pub fn partition_length(&self) -> u32 {
        let tail = match self.layout {
            PartitionLayout::Virtual => 0,
            _ => 16,
        };
        (self.blocks - PARTITION_START as u64 - tail) as u32
    }

    /// Absolute block of a physical partition block, after sparing
    pub fn physical(&self, relative: u32) -> u64 {
        if let PartitionLayout::Sparable { packet, remap } = &self.layout {
            let mask = *packet as u32 - 1;
            let original = relative & !mask;
            if let Some((_, mapped)) = remap.iter().find(|(o, _)| *o == original) {
                return (*mapped + (relative & mask)) as u64;
            }
        }
        (PARTITION_START + relative) as u64
    }

    /// Partition reference holding the file set and root directory
    fn fileset_partition(&self) -> u16 {
        match self.layout {
            PartitionLayout::Metadata { .. } if self.misnumbered_metadata => 2,
            PartitionLayout::Metadata { .. } | PartitionLayout::Virtual => 1,
            _ => 0,
        }
    }

    fn map_count(&self) -> u32 {
        match self.layout {
            PartitionLayout::Physical | PartitionLayout::Sparable { .. } => 1,
            PartitionLayout::Metadata { .. } if self.misnumbered_metadata => 3,
            _ => 2,
        }
    }

    pub fn build(&self) -> MemoryBlockDevice {
        let bs = self.block_size;
        let mut image = Image {
            data: vec![0u8; self.blocks as usize * bs],
            bs,
        };

        let stride = bs.max(2048);
        for (i, ident) in self.vrs.iter().enumerate() {
            let at = 32768 + i * stride;
            image.data[at + 1..at + 6].copy_from_slice(*ident);
            image.data[at + 6] = 1;
        }

        self.write_sequence(&mut image, MAIN_VDS, true);
        if self.reserve {
            self.write_sequence(&mut image, RESERVE_VDS, false);
        }
        if self.lvid {
            self.write_integrity(&mut image);
        }
        if let PartitionLayout::Sparable { remap, .. } = &self.layout {
            self.write_sparing_tables(&mut image, remap);
        }
        self.write_partition_contents(&mut image);

        let reserve = if self.reserve {
            (VDS_BLOCKS * bs as u32, RESERVE_VDS)
        } else {
            (0, 0)
        };
        let anchors = self.anchors.clone().unwrap_or_else(|| match self.layout {
            PartitionLayout::Virtual => vec![256],
            _ => vec![256, self.last_block()],
        });
        for block in anchors {
            image.descriptor(block, TagIdentifier::AnchorVolumePointer, block as u32, |d| {
                write_u32(d, 16, VDS_BLOCKS * bs as u32);
                write_u32(d, 20, MAIN_VDS);
                write_u32(d, 24, reserve.0);
                write_u32(d, 28, reserve.1);
            });
        }

        if self.corrupt_main_pvd {
            image.block(MAIN_VDS as u64)[4] ^= 0xFF;
        }
        MemoryBlockDevice::new(image.data, self.device_block_size)
    }

    fn write_sequence(&self, image: &mut Image, start: u32, main: bool) {
        let start = start as u64;
        image.descriptor(start, TagIdentifier::PrimaryVolume, start as u32, |d| {
            write_u32(d, 16, 1);
            encode_dstring(&mut d[24..56], self.volume_id);
            write_u16(d, 56, 1);
            write_u16(d, 58, 1);
            encode_dstring(&mut d[72..200], "TEST_SET");
        });
        image.descriptor(start + 1, TagIdentifier::UnallocatedSpace, start as u32 + 1, |d| {
            write_u32(d, 16, 1);
        });

        let rest = if main && self.pointer_continuation {
            let next = CONTINUATION_VDS;
            image.descriptor(start + 2, TagIdentifier::VolumePointer, start as u32 + 2, |d| {
                write_u32(d, 16, 2);
                write_u32(d, 20, 4 * image_bs(self));
                write_u32(d, 24, next);
            });
            next as u64
        } else {
            start + 2
        };

        image.descriptor(rest, TagIdentifier::Partition, rest as u32, |d| self.fill_pd(d));
        image.descriptor(rest + 1, TagIdentifier::LogicalVolume, rest as u32 + 1, |d| {
            self.fill_lvd(d)
        });
        let mut end = rest + 2;
        if self.misnumbered_metadata {
            image.descriptor(end, TagIdentifier::Partition, end as u32, |d| {
                write_u32(d, 16, 3);
                write_u16(d, 20, 1);
                write_u16(d, 22, 1);
                entity(d, 24, 2, "+NSR03", &[]);
                write_u32(d, 184, 1);
                write_u32(d, 188, SECOND_PARTITION_START);
                write_u32(d, 192, SECOND_PARTITION_LENGTH);
            });
            end += 1;
        }
        image.descriptor(end, TagIdentifier::Terminating, end as u32, |_| {});
    }

    fn fill_pd(&self, d: &mut [u8]) {
        write_u32(d, 16, 1);
        write_u16(d, 20, 1);
        write_u16(d, 22, 0);
        entity(d, 24, 2, "+NSR03", &[]);
        if self.overwritable {
            let bytes = self.partition_length().div_ceil(8);
            write_u32(d, 64, 24 + bytes);
            write_u32(d, 68, 0);
        }
        let access = match self.layout {
            _ if self.overwritable => 4,
            PartitionLayout::Virtual => 2,
            PartitionLayout::Sparable { .. } => 3,
            _ => 1,
        };
        write_u32(d, 184, access);
        write_u32(d, 188, PARTITION_START);
        write_u32(d, 192, self.partition_length());
    }

    fn fill_lvd(&self, d: &mut [u8]) {
        let bs = image_bs(self);
        let revision = self.udf_revision.to_le_bytes();
        write_u32(d, 16, 1);
        encode_dstring(&mut d[84..212], "TEST_LV");
        write_u32(d, 212, bs);
        entity(
            d,
            216,
            0,
            "*OSTA UDF Compliant",
            &[revision[0], revision[1], self.domain_flags],
        );
        if self.fileset_unset {
            long_ad(d, 248, 0, NO_LOCATION, u16::MAX);
        } else {
            let partition = self.fileset_partition();
            let block = if partition == 0 { 1 } else { 0 };
            long_ad(d, 248, bs, block, partition);
        }

        let mut maps: Vec<u8> = vec![1, 6, 1, 0, 0, 0];
        let type2 = |ident: &str, number: u16, payload: &[u8]| {
            let mut map = vec![0u8; 64];
            map[0] = 2;
            map[1] = 64;
            entity(&mut map, 4, 0, ident, &revision);
            write_u16(&mut map, 36, 1);
            write_u16(&mut map, 38, number);
            map[40..40 + payload.len()].copy_from_slice(payload);
            map
        };
        match &self.layout {
            PartitionLayout::Physical => {}
            PartitionLayout::Sparable { packet, remap } => {
                let mut payload = [0u8; 24];
                write_u16(&mut payload, 0, *packet);
                payload[2] = SPARING_TABLES.len() as u8;
                write_u32(&mut payload, 4, 56 + 8 * remap.len() as u32);
                for (i, location) in SPARING_TABLES.iter().enumerate() {
                    write_u32(&mut payload, 8 + i * 4, *location);
                }
                maps = type2("*UDF Sparable Partition", 0, &payload);
            }
            PartitionLayout::Metadata { .. } => {
                let mut payload = [0u8; 24];
                write_u32(&mut payload, 0, METADATA_FILE);
                write_u32(&mut payload, 4, METADATA_MIRROR);
                write_u32(&mut payload, 8, self.metadata_bitmap.unwrap_or(NO_LOCATION));
                write_u32(&mut payload, 12, 32);
                write_u16(&mut payload, 16, 1);
                let number = if self.misnumbered_metadata {
                    maps.extend([1, 6, 1, 0, 1, 0]);
                    1
                } else {
                    0
                };
                maps.extend(type2("*UDF Metadata Partition", number, &payload));
            }
            PartitionLayout::Virtual => {
                maps.extend(type2("*UDF Virtual Partition", 0, &[]));
            }
        }
        write_u32(d, 264, maps.len() as u32);
        write_u32(d, 268, self.map_count());
        write_u32(d, 432, LVID_BLOCKS * bs);
        write_u32(d, 436, LVID_BLOCK);
        d[440..440 + maps.len()].copy_from_slice(&maps);
    }

    fn write_integrity(&self, image: &mut Image) {
        let bs = image_bs(self);
        let partitions = self.map_count();
        let record = |d: &mut [u8], integrity_type: u32, free: u32| {
            write_u32(d, 28, integrity_type);
            write_u32(d, 72, partitions);
            let impl_len = if self.revisions.is_some() { 46 } else { 32 };
            write_u32(d, 76, impl_len);
            for i in 0..partitions as usize {
                write_u32(d, 80 + i * 4, free);
                write_u32(d, 80 + (partitions as usize + i) * 4, self.partition_length());
            }
            let iu = 80 + partitions as usize * 8;
            entity(d, iu, 0, "*Test UDF Builder", &[]);
            if let Some((min_read, min_write, max_write)) = self.revisions {
                write_u32(d, iu + 32, 1);
                write_u32(d, iu + 36, 1);
                write_u16(d, iu + 40, min_read);
                write_u16(d, iu + 42, min_write);
                write_u16(d, iu + 44, max_write);
            }
        };

        if self.lvid_chain {
            image.descriptor(
                LVID_BLOCK as u64,
                TagIdentifier::LogicalVolumeIntegrity,
                LVID_BLOCK,
                |d| {
                    record(d, 0, 0);
                    write_u32(d, 32, 2 * bs);
                    write_u32(d, 36, LVID_CONTINUATION);
                },
            );
            image.descriptor(
                LVID_CONTINUATION as u64,
                TagIdentifier::LogicalVolumeIntegrity,
                LVID_CONTINUATION,
                |d| record(d, 1, self.free_space),
            );
        } else {
            image.descriptor(
                LVID_BLOCK as u64,
                TagIdentifier::LogicalVolumeIntegrity,
                LVID_BLOCK,
                |d| record(d, 1, self.free_space),
            );
        }
    }

    fn write_sparing_tables(&self, image: &mut Image, remap: &[(u32, u32)]) {
        let revision = self.udf_revision.to_le_bytes();
        for location in SPARING_TABLES {
            image.descriptor(location as u64, TagIdentifier::SparingTable, location, |d| {
                entity(d, 16, 0, "*UDF Sparing Table", &revision);
                write_u16(d, 48, remap.len() as u16);
                write_u32(d, 52, 1);
                for (i, (original, mapped)) in remap.iter().enumerate() {
                    write_u32(d, 56 + i * 8, *original);
                    write_u32(d, 60 + i * 8, *mapped);
                }
            });
        }
    }

    fn write_partition_contents(&self, image: &mut Image) {
        let bs = image_bs(self);
        // (physical partition block, tag location) of the FSD and root
        let (fsd, root) = match self.layout {
            PartitionLayout::Metadata { .. } => {
                ((METADATA_EXTENT, 0), (METADATA_EXTENT + 1, 1))
            }
            PartitionLayout::Virtual => ((1, 0), (2, 1)),
            _ => ((1, 1), (2, 2)),
        };

        if self.overwritable {
            let bits = self.partition_length();
            image.descriptor(self.physical(0), TagIdentifier::SpaceBitmap, 0, |d| {
                write_u32(d, 16, bits);
                write_u32(d, 20, bits.div_ceil(8));
                for block in USED_BLOCKS..bits {
                    d[24 + (block / 8) as usize] |= 1 << (block % 8);
                }
            });
        }

        let partition = self.fileset_partition();
        let revision = self.udf_revision.to_le_bytes();
        image.descriptor(self.physical(fsd.0), TagIdentifier::FileSet, fsd.1, |d| {
            write_u16(d, 28, 3);
            write_u16(d, 30, 3);
            write_u32(d, 32, 1);
            write_u32(d, 36, 1);
            encode_dstring(&mut d[112..240], "TEST_LV");
            encode_dstring(&mut d[304..336], "TEST_FILESET");
            long_ad(d, 400, bs, root.1, partition);
            entity(
                d,
                416,
                0,
                "*OSTA UDF Compliant",
                &[revision[0], revision[1], self.domain_flags],
            );
        });
        image.descriptor(self.physical(root.0), TagIdentifier::FileEntry, root.1, |d| {
            write_u16(d, 20, 4);
            write_u16(d, 24, 1);
            d[27] = FILE_TYPE_DIRECTORY;
            write_u16(d, 48, 1);
        });

        match self.layout {
            PartitionLayout::Metadata { main, mirror } => {
                let files = [
                    (main, METADATA_FILE, FILE_TYPE_METADATA),
                    (mirror, METADATA_MIRROR, FILE_TYPE_METADATA_MIRROR),
                ];
                for (present, location, file_type) in files {
                    if !present {
                        continue;
                    }
                    image.descriptor(self.physical(location), TagIdentifier::FileEntry, location, |d| {
                        d[27] = file_type;
                        write_u32(d, 56, METADATA_BLOCKS * bs);
                        write_u32(d, 172, 8);
                        write_u32(d, 176, METADATA_BLOCKS * bs);
                        write_u32(d, 180, METADATA_EXTENT);
                    });
                }
            }
            PartitionLayout::Virtual => {
                let block = self.last_block();
                let relative = (block - PARTITION_START as u64) as u32;
                let (min_read, min_write, max_write) = self.revisions.unwrap_or_default();
                image.descriptor(block, TagIdentifier::FileEntry, relative, |d| {
                    d[27] = FILE_TYPE_VAT20;
                    write_u16(d, 34, 3);
                    write_u32(d, 56, 160);
                    write_u32(d, 172, 160);
                    let vat = &mut d[176..176 + 160];
                    write_u16(vat, 0, 152);
                    encode_dstring(&mut vat[4..132], "TEST_LV");
                    write_u32(vat, 132, NO_LOCATION);
                    write_u16(vat, 144, min_read);
                    write_u16(vat, 146, min_write);
                    write_u16(vat, 148, max_write);
                    write_u32(vat, 152, fsd.0);
                    write_u32(vat, 156, root.0);
                });
            }
            _ => {}
        }
    }
}

fn image_bs(builder: &UdfImageBuilder) -> u32 {
    builder.block_size as u32
}
