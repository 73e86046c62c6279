//! Boot sector parsing and the derived on-disk geometry.

use storage_api_types::{Error, Result, Sector, SECTOR_SIZE};

// ─── Boot sector offsets ───────────────────────────────────────────────────────

const JUMP:              usize = 0x00;
const BYTES_PER_SECTOR:  usize = 0x0B;
const SECTORS_PER_CLUS:  usize = 0x0D;
const RESERVED_SECTORS:  usize = 0x0E;
const NUM_FATS:          usize = 0x10;
const ROOT_ENTRY_COUNT:  usize = 0x11;
const TOTAL_SECTORS_16:  usize = 0x13;
const FAT_SIZE_16:       usize = 0x16;
const TOTAL_SECTORS_32:  usize = 0x20;
const FAT_SIZE_32:       usize = 0x24;
const ROOT_CLUSTER:      usize = 0x2C;

/// First MBR partition entry's starting-LBA field. Entries are 16 bytes apart.
const PARTITION_LBA:     usize = 0x1C6;
const PARTITION_STRIDE:  usize = 16;
pub const MAX_PARTITIONS: u8   = 4;

/// Volumes with fewer data clusters are FAT12 (unsupported).
pub const FAT16_MIN_CLUSTERS: u32 = 4085;
/// Volumes with at least this many data clusters are FAT32.
pub const FAT32_MIN_CLUSTERS: u32 = 65525;

pub(crate) const DIR_ENTRY_SIZE: u32 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatType {
    Fat16,
    Fat32,
}

impl FatType {
    /// Bytes per FAT entry.
    pub fn entry_width(self) -> u32 {
        match self {
            FatType::Fat16 => 2,
            FatType::Fat32 => 4,
        }
    }

    /// Meaningful bits of a FAT entry.
    pub fn entry_mask(self) -> u32 {
        match self {
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }

    /// Smallest value that terminates a chain.
    pub fn end_of_chain(self) -> u32 {
        match self {
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }
}

/// Geometry of a mounted volume, all in absolute sectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    pub fat_type: FatType,
    /// Absolute sector of the boot sector (0, or the partition start).
    pub boot_sector: u32,
    /// log2(sectors per cluster).
    pub cluster_shift: u8,
    pub fat_start: u32,
    pub fat_size: u32,
    pub fat_copies: u8,
    /// First sector of the root directory.
    pub root_dir_start: u32,
    /// Length of the fixed FAT16 root region. Zero on FAT32.
    pub root_dir_sectors: u32,
    /// First cluster of the FAT32 root directory. Zero on FAT16.
    pub root_cluster: u32,
    pub first_data_sector: u32,
    pub cluster_count: u32,
}

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// A boot sector starts with an x86 jump and declares 512-byte sectors.
/// Anything else at sector 0 is treated as a partition table.
pub fn is_boot_sector(sector: &Sector) -> bool {
    matches!(sector[JUMP], 0xEB | 0xE9) && u16_at(sector, BYTES_PER_SECTOR) as usize == SECTOR_SIZE
}

/// Starting LBA of MBR partition `index` (0-3).
pub fn partition_start(mbr: &Sector, index: u8) -> Result<u32> {
    if index >= MAX_PARTITIONS {
        return Err(Error::InvalidPartition);
    }
    match u32_at(mbr, PARTITION_LBA + index as usize * PARTITION_STRIDE) {
        0 => Err(Error::InvalidPartition),
        lba => Ok(lba),
    }
}

impl Layout {
    /// Derive the volume geometry from the boot sector found at `boot_sector`.
    pub fn parse(boot: &Sector, boot_sector: u32) -> Result<Self> {
        if u16_at(boot, BYTES_PER_SECTOR) as usize != SECTOR_SIZE {
            return Err(Error::UnsupportedFilesystem);
        }

        let sectors_per_clus = boot[SECTORS_PER_CLUS];
        if !sectors_per_clus.is_power_of_two() {
            return Err(Error::MalformedVolume);
        }
        let cluster_shift = sectors_per_clus.trailing_zeros() as u8;

        let reserved   = u16_at(boot, RESERVED_SECTORS) as u32;
        let fat_copies = boot[NUM_FATS];
        let root_entries = u16_at(boot, ROOT_ENTRY_COUNT) as u32;

        let fat_size = match u16_at(boot, FAT_SIZE_16) {
            0 => u32_at(boot, FAT_SIZE_32),
            n => n as u32,
        };
        let total_sectors = match u16_at(boot, TOTAL_SECTORS_16) {
            0 => u32_at(boot, TOTAL_SECTORS_32),
            n => n as u32,
        };
        if reserved == 0 || fat_copies == 0 || fat_size == 0 || total_sectors == 0 {
            return Err(Error::MalformedVolume);
        }

        let root_dir_sectors = (root_entries * DIR_ENTRY_SIZE).div_ceil(SECTOR_SIZE as u32);
        // The whole volume must be addressable with 32-bit sector numbers.
        boot_sector.checked_add(total_sectors).ok_or(Error::MalformedVolume)?;
        let fat_start = boot_sector + reserved;
        let fat_region = (fat_copies as u32)
            .checked_mul(fat_size)
            .ok_or(Error::MalformedVolume)?;
        let meta_sectors = reserved
            .checked_add(fat_region)
            .and_then(|n| n.checked_add(root_dir_sectors))
            .ok_or(Error::MalformedVolume)?;
        let data_sectors = total_sectors
            .checked_sub(meta_sectors)
            .ok_or(Error::MalformedVolume)?;
        let cluster_count = data_sectors >> cluster_shift;

        let fat_type = if cluster_count < FAT16_MIN_CLUSTERS {
            return Err(Error::UnsupportedFilesystem);
        } else if cluster_count < FAT32_MIN_CLUSTERS {
            FatType::Fat16
        } else {
            FatType::Fat32
        };

        // Every data cluster plus the two reserved entries must fit in one FAT.
        let fat_capacity = fat_size as u64 * SECTOR_SIZE as u64 / fat_type.entry_width() as u64;
        if fat_capacity < cluster_count as u64 + 2 {
            return Err(Error::MalformedVolume);
        }

        let after_fats = fat_start + fat_region;
        let mut layout = Layout {
            fat_type,
            boot_sector,
            cluster_shift,
            fat_start,
            fat_size,
            fat_copies,
            root_dir_start: after_fats,
            root_dir_sectors: 0,
            root_cluster: 0,
            first_data_sector: after_fats,
            cluster_count,
        };

        match fat_type {
            FatType::Fat16 => {
                if root_dir_sectors == 0 {
                    return Err(Error::MalformedVolume);
                }
                layout.root_dir_sectors = root_dir_sectors;
                layout.first_data_sector = after_fats + root_dir_sectors;
            }
            FatType::Fat32 => {
                let root = u32_at(boot, ROOT_CLUSTER) & FatType::Fat32.entry_mask();
                if !layout.is_valid_cluster(root) {
                    return Err(Error::MalformedVolume);
                }
                layout.root_cluster = root;
                layout.root_dir_start = layout.cluster_to_sector(root);
            }
        }
        Ok(layout)
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        1 << self.cluster_shift
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        (SECTOR_SIZE as u32) << self.cluster_shift
    }

    /// Clusters 2..cluster_count+2 address the data region.
    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster - 2 < self.cluster_count
    }

    pub fn is_end_of_chain(&self, value: u32) -> bool {
        value >= self.fat_type.end_of_chain()
    }

    pub fn cluster_to_sector(&self, cluster: u32) -> u32 {
        self.first_data_sector + ((cluster - 2) << self.cluster_shift)
    }

    /// Sector and byte offset of `cluster`'s entry in the first FAT copy.
    pub fn fat_entry_location(&self, cluster: u32) -> (u32, usize) {
        let byte = cluster * self.fat_type.entry_width();
        (self.fat_start + byte / SECTOR_SIZE as u32, byte as usize % SECTOR_SIZE)
    }

    /// Cluster number a directory entry uses for the root directory.
    pub fn root_dir_cluster(&self) -> u32 {
        self.root_cluster
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Boot sector for a volume with `clusters` data clusters.
    fn boot(spc: u8, clusters: u32) -> Sector {
        let reserved = 4u32;
        let fats = 2u32;
        let root_entries = 512u32;
        // Sized for 4-byte entries so both types have room.
        let fat_size = ((clusters + 2) * 4).div_ceil(512);
        let total = reserved + fats * fat_size + 32 + clusters * spc as u32;

        let mut s = [0u8; 512];
        s[0] = 0xEB;
        s[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        s[0x0D] = spc;
        s[0x0E..0x10].copy_from_slice(&(reserved as u16).to_le_bytes());
        s[0x10] = fats as u8;
        s[0x11..0x13].copy_from_slice(&(root_entries as u16).to_le_bytes());
        if total < 0x1_0000 {
            s[0x13..0x15].copy_from_slice(&(total as u16).to_le_bytes());
        } else {
            s[0x20..0x24].copy_from_slice(&total.to_le_bytes());
        }
        s[0x24..0x28].copy_from_slice(&fat_size.to_le_bytes());
        s[0x2C..0x30].copy_from_slice(&2u32.to_le_bytes());
        s[510] = 0x55;
        s[511] = 0xAA;
        s
    }

    #[test]
    fn classification_follows_cluster_count() {
        for shift in 0..7 {
            let spc = 1u8 << shift;
            for clusters in [4084, 4085, 20_000, 65_524, 65_525, 100_000] {
                let result = Layout::parse(&boot(spc, clusters), 0);
                match clusters {
                    c if c < FAT16_MIN_CLUSTERS => {
                        assert_eq!(result, Err(Error::UnsupportedFilesystem), "spc {spc} clusters {c}")
                    }
                    c => {
                        let layout = result.unwrap();
                        assert_eq!(layout.cluster_count, c);
                        let expected = if c < FAT32_MIN_CLUSTERS { FatType::Fat16 } else { FatType::Fat32 };
                        assert_eq!(layout.fat_type, expected, "spc {spc} clusters {c}");
                    }
                }
            }
        }
    }

    #[test]
    fn fat16_regions_follow_each_other() {
        let layout = Layout::parse(&boot(4, 10_000), 0).unwrap();
        let fat_size = (10_002u32 * 4).div_ceil(512);
        assert_eq!(layout.fat_start, 4);
        assert_eq!(layout.root_dir_start, 4 + 2 * fat_size);
        assert_eq!(layout.root_dir_sectors, 32);
        assert_eq!(layout.first_data_sector, layout.root_dir_start + 32);
        assert_eq!(layout.sectors_per_cluster(), 4);
        assert_eq!(layout.cluster_to_sector(3), layout.first_data_sector + 4);
        assert_eq!(layout.root_dir_cluster(), 0);
    }

    #[test]
    fn fat32_root_is_a_cluster() {
        let layout = Layout::parse(&boot(1, 70_000), 100).unwrap();
        assert_eq!(layout.fat_type, FatType::Fat32);
        assert_eq!(layout.fat_start, 104);
        assert_eq!(layout.root_cluster, 2);
        assert_eq!(layout.root_dir_start, layout.cluster_to_sector(2));
        assert_eq!(layout.root_dir_start, layout.first_data_sector);
    }

    #[test]
    fn fat_entry_location_spans_sectors() {
        let layout = Layout::parse(&boot(1, 10_000), 0).unwrap();
        assert_eq!(layout.fat_entry_location(2), (4, 4));
        assert_eq!(layout.fat_entry_location(256), (5, 0));
        assert_eq!(layout.fat_entry_location(257), (5, 2));
    }

    #[test]
    fn end_of_chain_thresholds() {
        let fat16 = Layout::parse(&boot(1, 10_000), 0).unwrap();
        assert!(!fat16.is_end_of_chain(0xFFF7));
        assert!(fat16.is_end_of_chain(0xFFF8));
        assert!(fat16.is_end_of_chain(0xFFFF));
        let fat32 = Layout::parse(&boot(1, 70_000), 0).unwrap();
        assert!(!fat32.is_end_of_chain(0xFFFF));
        assert!(fat32.is_end_of_chain(0x0FFF_FFF8));
    }

    #[test]
    fn rejects_malformed_fields() {
        let mut s = boot(1, 10_000);
        s[0x0D] = 3;
        assert_eq!(Layout::parse(&s, 0), Err(Error::MalformedVolume));

        let mut s = boot(1, 10_000);
        s[0x10] = 0;
        assert_eq!(Layout::parse(&s, 0), Err(Error::MalformedVolume));

        let mut s = boot(1, 10_000);
        s[0x0B..0x0D].copy_from_slice(&1024u16.to_le_bytes());
        assert_eq!(Layout::parse(&s, 0), Err(Error::UnsupportedFilesystem));

        // FAT too small for the cluster count.
        let mut s = boot(1, 10_000);
        s[0x24..0x28].copy_from_slice(&8u32.to_le_bytes());
        assert_eq!(Layout::parse(&s, 0), Err(Error::MalformedVolume));
    }

    #[test]
    fn fat32_root_cluster_must_exist() {
        let mut s = boot(1, 70_000);
        s[0x2C..0x30].copy_from_slice(&1u32.to_le_bytes());
        assert_eq!(Layout::parse(&s, 0), Err(Error::MalformedVolume));
    }

    #[test]
    fn partition_table_lookup() {
        let mut mbr = [0u8; 512];
        mbr[0x1C6..0x1CA].copy_from_slice(&2048u32.to_le_bytes());
        mbr[0x1D6..0x1DA].copy_from_slice(&9000u32.to_le_bytes());
        assert!(!is_boot_sector(&mbr));
        assert_eq!(partition_start(&mbr, 0), Ok(2048));
        assert_eq!(partition_start(&mbr, 1), Ok(9000));
        assert_eq!(partition_start(&mbr, 2), Err(Error::InvalidPartition));
        assert_eq!(partition_start(&mbr, 4), Err(Error::InvalidPartition));
    }
}
