//! Volume state: the block device, the shared sector and the mounted geometry.

use storage_api_types::{BlockDevice, Error, Result};

use crate::buffer::{FileId, Role, SectorBuffer};
use crate::chain::ChainCursor;
use crate::layout::{self, Layout};

/// A FAT16/FAT32 volume on top of a [`BlockDevice`].
///
/// All I/O goes through one 512-byte buffer. Open files, directory scans and
/// FAT lookups take turns owning it (see [`Role`]).
pub struct FatFs<D> {
    pub(crate) device: D,
    pub(crate) buffer: SectorBuffer,
    pub(crate) layout: Option<Layout>,
    /// First cluster of the current directory. Zero is the fixed FAT16 root.
    pub(crate) cwd: u32,
    /// Scan position inside the current directory.
    pub(crate) dir: ChainCursor,
    /// Allocation resumes after the last cluster handed out.
    pub(crate) alloc_hint: u32,
    next_file_id: u16,
}

impl<D: BlockDevice> FatFs<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            buffer: SectorBuffer::new(),
            layout: None,
            cwd: 0,
            dir: ChainCursor::DETACHED,
            alloc_hint: 2,
            next_file_id: 0,
        }
    }

    /// Mount the volume. Sector 0 may hold the boot sector itself or an MBR,
    /// in which case `partition` (0-3) selects the entry to follow.
    pub fn mount(&mut self, partition: u8) -> Result<()> {
        if self.layout.is_some() {
            return Err(Error::AlreadyMounted);
        }

        // The boot sector passes through the directory slot; the root scan below replaces it.
        self.buffer.load(&mut self.device, Role::Directory, 0)?;
        let boot_sector = if layout::is_boot_sector(self.buffer.bytes()) {
            if partition != 0 {
                return Err(Error::InvalidPartition);
            }
            0
        } else {
            let lba = layout::partition_start(self.buffer.bytes(), partition)?;
            log::debug!("fat: partition {} starts at sector {}", partition, lba);
            self.buffer.ensure_loaded(&mut self.device, lba)?;
            lba
        };

        let layout = Layout::parse(self.buffer.bytes(), boot_sector).inspect_err(|e| {
            log::warn!("fat: rejecting volume at sector {}: {}", boot_sector, e);
        })?;
        log::debug!(
            "fat: fat@{} x{} size {}, root@{} ({} sectors), data@{}",
            layout.fat_start,
            layout.fat_copies,
            layout.fat_size,
            layout.root_dir_start,
            layout.root_dir_sectors,
            layout.first_data_sector,
        );

        self.layout = Some(layout);
        self.cwd = layout.root_dir_cluster();
        self.dir = ChainCursor::DETACHED;
        self.alloc_hint = 2;
        if let Err(e) = self.rewind_dir() {
            self.layout = None;
            return Err(e);
        }

        log::info!(
            "fat: mounted {:?}, {} clusters of {} bytes",
            layout.fat_type,
            layout.cluster_count,
            layout.bytes_per_cluster()
        );
        Ok(())
    }

    /// Write back anything pending and forget the volume.
    pub fn unmount(&mut self) -> Result<()> {
        if self.layout.is_none() {
            return Err(Error::NotMounted);
        }
        self.buffer.release(&mut self.device)?;
        self.layout = None;
        self.dir = ChainCursor::DETACHED;
        log::info!("fat: unmounted");
        Ok(())
    }

    pub fn is_mounted(&self) -> bool {
        self.layout.is_some()
    }

    pub fn layout(&self) -> Option<&Layout> {
        self.layout.as_ref()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Give the device back. Pending writes are lost unless the volume was unmounted.
    pub fn into_device(self) -> D {
        self.device
    }

    pub(crate) fn mounted_layout(&self) -> Result<Layout> {
        self.layout.ok_or(Error::NotMounted)
    }

    pub(crate) fn next_file_id(&mut self) -> FileId {
        let id = FileId(self.next_file_id);
        self.next_file_id = self.next_file_id.wrapping_add(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::FatType;
    use crate::testing::{self, MemDisk};

    #[test]
    fn mount_fat16_image() {
        let mut fs = FatFs::new(testing::fat16_disk());
        fs.mount(0).unwrap();
        let layout = fs.layout().unwrap();
        assert_eq!(layout.fat_type, FatType::Fat16);
        assert_eq!(layout.sectors_per_cluster(), 4);
        assert_eq!(layout.root_dir_sectors, 32);
        assert_eq!(fs.cwd, 0);
    }

    #[test]
    fn mount_fat32_image() {
        let mut fs = FatFs::new(testing::fat32_disk());
        fs.mount(0).unwrap();
        let layout = *fs.layout().unwrap();
        assert_eq!(layout.fat_type, FatType::Fat32);
        assert_eq!(layout.root_cluster, 2);
        assert_eq!(fs.cwd, 2);
    }

    #[test]
    fn mount_blank_disk_fails() {
        let mut fs = FatFs::new(MemDisk::zeroed(8192));
        assert_eq!(fs.mount(0), Err(Error::InvalidPartition));
        assert!(!fs.is_mounted());
    }

    #[test]
    fn mount_twice_is_rejected() {
        let mut fs = FatFs::new(testing::fat16_disk());
        fs.mount(0).unwrap();
        assert_eq!(fs.mount(0), Err(Error::AlreadyMounted));
    }

    #[test]
    fn unmount_requires_mount() {
        let mut fs = FatFs::new(testing::fat16_disk());
        assert_eq!(fs.unmount(), Err(Error::NotMounted));
        fs.mount(0).unwrap();
        fs.unmount().unwrap();
        assert!(!fs.is_mounted());
        fs.mount(0).unwrap();
    }

    #[test]
    fn bare_volume_has_no_partitions() {
        let mut fs = FatFs::new(testing::fat16_disk());
        assert_eq!(fs.mount(1), Err(Error::InvalidPartition));
    }

    #[test]
    fn mount_follows_partition_table() {
        let image = testing::with_files(testing::fat16_disk(), &[("HELLO.TXT", b"partitioned")]);
        let mut fs = FatFs::new(testing::partitioned(&image, 2048));
        assert_eq!(fs.mount(1), Err(Error::InvalidPartition));
        fs.mount(0).unwrap();
        let layout = *fs.layout().unwrap();
        assert_eq!(layout.boot_sector, 2048);
        assert!(layout.fat_start > 2048);
        assert_eq!(testing::read_all(&mut fs, "HELLO.TXT"), b"partitioned");
    }
}
