//! Cluster chains: FAT lookups, links, allocation and cursor movement.

use storage_api_types::{BlockDevice, Error, Result};

use crate::buffer::Role;
use crate::fs::FatFs;
use crate::layout::FatType;

/// Position inside a cluster chain.
///
/// `next` is the FAT value of `cluster`, fetched when the cursor arrived there,
/// so stepping forward never needs a second FAT lookup for the current link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChainCursor {
    pub cluster: u32,
    pub next: u32,
    /// First sector of `cluster`.
    pub base: u32,
    /// Sector within the cluster.
    pub offset: u32,
    /// Clusters walked from the chain start.
    pub index: u32,
}

impl ChainCursor {
    /// Points nowhere. Forces the next user to rewind.
    pub const DETACHED: ChainCursor =
        ChainCursor { cluster: 0, next: 0, base: 0, offset: 0, index: u32::MAX };

    pub fn sector(&self) -> u32 {
        self.base + self.offset
    }
}

impl<D: BlockDevice> FatFs<D> {
    /// FAT value of `cluster`: the next cluster, an end-of-chain marker or zero if free.
    pub fn fat_value(&mut self, cluster: u32) -> Result<u32> {
        let layout = self.mounted_layout()?;
        if !layout.is_valid_cluster(cluster) {
            return Err(Error::BadCluster);
        }
        let (sector, at) = layout.fat_entry_location(cluster);
        self.buffer.load(&mut self.device, Role::FatScan, sector)?;
        let bytes = self.buffer.bytes();
        let value = match layout.fat_type {
            FatType::Fat16 => u16::from_le_bytes([bytes[at], bytes[at + 1]]) as u32,
            FatType::Fat32 => u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]),
        };
        Ok(value & layout.fat_type.entry_mask())
    }

    /// Store `value` for `cluster` in every FAT copy.
    pub(crate) fn set_fat_value(&mut self, cluster: u32, value: u32) -> Result<()> {
        let layout = self.mounted_layout()?;
        if !layout.is_valid_cluster(cluster) {
            return Err(Error::BadCluster);
        }
        let (sector, at) = layout.fat_entry_location(cluster);
        for copy in 0..layout.fat_copies as u32 {
            self.buffer.load(&mut self.device, Role::FatScan, sector + copy * layout.fat_size)?;
            let bytes = self.buffer.bytes_mut();
            match layout.fat_type {
                FatType::Fat16 => bytes[at..at + 2].copy_from_slice(&(value as u16).to_le_bytes()),
                FatType::Fat32 => {
                    // The top four bits are reserved and must survive.
                    let old = u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
                    let new = (old & !0x0FFF_FFFF) | (value & 0x0FFF_FFFF);
                    bytes[at..at + 4].copy_from_slice(&new.to_le_bytes());
                }
            }
        }
        log::trace!("fat: FAT[{}] = {:#x}", cluster, value);
        Ok(())
    }

    /// Claim the first free cluster at or after the allocation hint, wrapping once.
    /// The new cluster is marked end-of-chain.
    pub(crate) fn allocate_cluster(&mut self) -> Result<u32> {
        let layout = self.mounted_layout()?;
        let first = 2;
        let end = layout.cluster_count + 2;
        let start = if (first..end).contains(&self.alloc_hint) { self.alloc_hint } else { first };

        for cluster in (start..end).chain(first..start) {
            if self.fat_value(cluster)? == 0 {
                self.set_fat_value(cluster, layout.fat_type.entry_mask())?;
                self.alloc_hint = cluster + 1;
                log::trace!("fat: allocated cluster {}", cluster);
                return Ok(cluster);
            }
        }
        log::warn!("fat: volume full");
        Err(Error::NoSpace)
    }

    /// Cursor on the first sector of the chain starting at `first`, with its link prefetched.
    pub(crate) fn start_chain(&mut self, first: u32) -> Result<ChainCursor> {
        let layout = self.mounted_layout()?;
        let next = self.fat_value(first)?;
        Ok(ChainCursor { cluster: first, next, base: layout.cluster_to_sector(first), offset: 0, index: 0 })
    }

    /// Step to the next cluster using the prefetched link.
    pub(crate) fn advance(&mut self, cursor: &mut ChainCursor) -> Result<()> {
        let layout = self.mounted_layout()?;
        if layout.is_end_of_chain(cursor.next) {
            return Err(Error::ReadingPastEndOfChain);
        }
        if !layout.is_valid_cluster(cursor.next) {
            log::warn!("fat: cluster {} links to {:#x}", cursor.cluster, cursor.next);
            return Err(Error::BadCluster);
        }
        let cluster = cursor.next;
        let next = self.fat_value(cluster)?;
        *cursor = ChainCursor {
            cluster,
            next,
            base: layout.cluster_to_sector(cluster),
            offset: 0,
            index: cursor.index + 1,
        };
        Ok(())
    }

    /// Like [`advance`](Self::advance), but appends a fresh cluster at the end of the chain.
    ///
    /// The new cluster is marked end-of-chain before the link is written. If the
    /// link fails the cluster stays allocated but unreachable, and the chain never
    /// points at a free cluster.
    pub(crate) fn advance_or_grow(&mut self, cursor: &mut ChainCursor) -> Result<()> {
        let layout = self.mounted_layout()?;
        if layout.is_end_of_chain(cursor.next) {
            let new = self.allocate_cluster()?;
            self.set_fat_value(cursor.cluster, new)?;
            cursor.next = new;
        }
        self.advance(cursor)
    }

    /// Move to the `target`th cluster of the chain starting at `first`.
    /// Going backwards restarts from `first`; going forwards walks link by link.
    pub(crate) fn seek_cluster(
        &mut self,
        cursor: &mut ChainCursor,
        first: u32,
        target: u32,
        grow: bool,
    ) -> Result<()> {
        if target < cursor.index || cursor.index == ChainCursor::DETACHED.index {
            *cursor = self.start_chain(first)?;
        }
        while cursor.index < target {
            if grow {
                self.advance_or_grow(cursor)?;
            } else {
                self.advance(cursor)?;
            }
        }
        Ok(())
    }

    /// Step to the next sector, crossing into the next cluster when needed.
    pub(crate) fn next_sector(&mut self, cursor: &mut ChainCursor) -> Result<()> {
        let layout = self.mounted_layout()?;
        if cursor.offset + 1 < layout.sectors_per_cluster() {
            cursor.offset += 1;
            Ok(())
        } else {
            self.advance(cursor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn fs_with_chain(len: usize) -> (FatFs<testing::MemDisk>, u32) {
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let disk = testing::with_files(testing::fat16_disk(), &[("CHAIN.BIN", &data)]);
        let mut fs = FatFs::new(disk);
        fs.mount(0).unwrap();
        let (_, entry) = fs.find(b"CHAIN.BIN").unwrap();
        let first = entry.first_cluster(FatType::Fat16);
        (fs, first)
    }

    #[test]
    fn lookahead_matches_independent_lookup() {
        // 2048-byte clusters, so five clusters.
        let (mut fs, first) = fs_with_chain(10_000);
        let layout = *fs.layout().unwrap();
        let mut cursor = fs.start_chain(first).unwrap();
        let mut walked = 1;
        while !layout.is_end_of_chain(cursor.next) {
            let expected = fs.fat_value(cursor.cluster).unwrap();
            fs.advance(&mut cursor).unwrap();
            assert_eq!(cursor.cluster, expected);
            assert_eq!(cursor.base, layout.cluster_to_sector(expected));
            assert_eq!(cursor.index, walked);
            walked += 1;
        }
        assert_eq!(walked, 5);
        assert_eq!(fs.advance(&mut cursor), Err(Error::ReadingPastEndOfChain));
    }

    #[test]
    fn seek_backwards_matches_fresh_walk() {
        let (mut fs, first) = fs_with_chain(10_000);
        let mut fresh = fs.start_chain(first).unwrap();
        fs.advance(&mut fresh).unwrap();

        let mut cursor = fs.start_chain(first).unwrap();
        fs.seek_cluster(&mut cursor, first, 4, false).unwrap();
        assert_eq!(cursor.index, 4);
        fs.seek_cluster(&mut cursor, first, 1, false).unwrap();
        assert_eq!(cursor, fresh);
    }

    #[test]
    fn seek_past_chain_end_fails_without_grow() {
        let (mut fs, first) = fs_with_chain(100);
        let mut cursor = ChainCursor::DETACHED;
        assert_eq!(fs.seek_cluster(&mut cursor, first, 1, false), Err(Error::ReadingPastEndOfChain));
    }

    #[test]
    fn grow_links_new_cluster_in_every_fat() {
        let (mut fs, first) = fs_with_chain(100);
        let layout = *fs.layout().unwrap();
        let mut cursor = ChainCursor::DETACHED;
        fs.seek_cluster(&mut cursor, first, 1, true).unwrap();
        assert_eq!(fs.fat_value(first).unwrap(), cursor.cluster);
        assert!(layout.is_end_of_chain(cursor.next));

        fs.unmount().unwrap();
        let disk = fs.into_device();
        let (sector, at) = layout.fat_entry_location(first);
        for copy in 0..layout.fat_copies as u32 {
            let byte = (sector + copy * layout.fat_size) as usize * 512 + at;
            let value = u16::from_le_bytes([disk.data[byte], disk.data[byte + 1]]) as u32;
            assert_eq!(value, cursor.cluster);
        }
    }

    #[test]
    fn allocation_hint_moves_forward() {
        let (mut fs, _) = fs_with_chain(100);
        let a = fs.allocate_cluster().unwrap();
        let b = fs.allocate_cluster().unwrap();
        assert_eq!(b, a + 1);
        let value = fs.fat_value(a).unwrap();
        assert!(fs.layout().unwrap().is_end_of_chain(value));
    }

    #[test]
    fn failed_link_keeps_chain_end() {
        let (mut fs, first) = fs_with_chain(100);
        let layout = *fs.layout().unwrap();
        let mut cursor = fs.start_chain(first).unwrap();
        // Enough writes to mark the new cluster in both FATs, not to link it.
        let writes = fs.device().writes;
        fs.device_mut().write_limit = Some(writes + 2);
        assert_eq!(fs.advance_or_grow(&mut cursor), Err(Error::Bus));
        assert_eq!(cursor.cluster, first);
        assert!(layout.is_end_of_chain(cursor.next));

        let disk = fs.into_device();
        let (sector, at) = layout.fat_entry_location(first);
        for copy in 0..layout.fat_copies as u32 {
            let byte = (sector + copy * layout.fat_size) as usize * 512 + at;
            let value = u16::from_le_bytes([disk.data[byte], disk.data[byte + 1]]) as u32;
            assert!(layout.is_end_of_chain(value), "copy {copy}: {value:#x}");
        }
    }

    #[test]
    fn next_sector_crosses_cluster_boundary() {
        let (mut fs, first) = fs_with_chain(5000);
        let mut cursor = fs.start_chain(first).unwrap();
        for _ in 0..3 {
            fs.next_sector(&mut cursor).unwrap();
        }
        assert_eq!((cursor.index, cursor.offset), (0, 3));
        fs.next_sector(&mut cursor).unwrap();
        assert_eq!((cursor.index, cursor.offset), (1, 0));
    }

    #[test]
    fn free_cluster_is_not_a_chain_start() {
        let (mut fs, _) = fs_with_chain(100);
        assert_eq!(fs.fat_value(0), Err(Error::BadCluster));
        assert_eq!(fs.fat_value(1), Err(Error::BadCluster));
    }
}
