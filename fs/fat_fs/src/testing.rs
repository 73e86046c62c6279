//! In-memory disks and `fatfs`-built images for the unit tests.

use std::io::{Cursor, Read, Write};
use std::string::String;
use std::vec::Vec;

use storage_api_types::{BlockDevice, Error, Result, Sector, SECTOR_SIZE};

use crate::file::{FileSystem, OpenMode};
use crate::fs::FatFs;

/// Block device backed by a `Vec<u8>`, counting the sector transfers.
#[derive(Clone)]
pub struct MemDisk {
    pub data: Vec<u8>,
    pub reads: usize,
    pub writes: usize,
    /// Writes fail with a bus error once `writes` reaches this.
    pub write_limit: Option<usize>,
}

impl MemDisk {
    pub fn zeroed(sectors: usize) -> Self {
        Self::from_bytes(vec![0u8; sectors * SECTOR_SIZE])
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, reads: 0, writes: 0, write_limit: None }
    }

    fn range(&self, sector: u32) -> Result<core::ops::Range<usize>> {
        let start = sector as usize * SECTOR_SIZE;
        if start + SECTOR_SIZE > self.data.len() {
            return Err(Error::Bus);
        }
        Ok(start..start + SECTOR_SIZE)
    }
}

impl BlockDevice for MemDisk {
    fn read_sector(&mut self, sector: u32, buf: &mut Sector) -> Result<()> {
        let range = self.range(sector)?;
        buf.copy_from_slice(&self.data[range]);
        self.reads += 1;
        Ok(())
    }

    fn write_sector(&mut self, sector: u32, buf: &Sector) -> Result<()> {
        if self.write_limit.is_some_and(|limit| self.writes >= limit) {
            return Err(Error::Bus);
        }
        let range = self.range(sector)?;
        self.data[range].copy_from_slice(buf);
        self.writes += 1;
        Ok(())
    }
}

fn format(size: usize, options: fatfs::FormatVolumeOptions) -> MemDisk {
    let mut cursor = Cursor::new(vec![0u8; size]);
    fatfs::format_volume(&mut cursor, options).expect("format_volume failed");
    MemDisk::from_bytes(cursor.into_inner())
}

/// 16 MiB FAT16 volume with 2048-byte (4-sector) clusters.
pub fn fat16_disk() -> MemDisk {
    format(
        16 * 1024 * 1024,
        fatfs::FormatVolumeOptions::new()
            .fat_type(fatfs::FatType::Fat16)
            .bytes_per_cluster(2048),
    )
}

/// FAT32 needs at least 65 525 clusters. With 512-byte clusters 40 MiB is enough.
pub fn fat32_disk() -> MemDisk {
    format(
        40 * 1024 * 1024,
        fatfs::FormatVolumeOptions::new()
            .fat_type(fatfs::FatType::Fat32)
            .bytes_per_cluster(512),
    )
}

/// Write files through `fatfs`. A name of the form `DIR/FILE` creates `DIR` first.
pub fn with_files(mut disk: MemDisk, files: &[(&str, &[u8])]) -> MemDisk {
    {
        let mut cursor = Cursor::new(&mut disk.data);
        let fs = fatfs::FileSystem::new(&mut cursor, fatfs::FsOptions::new()).expect("FileSystem::new failed");
        let root = fs.root_dir();
        for (path, content) in files {
            let mut file = match path.split_once('/') {
                Some((dir, name)) => {
                    let dir = match root.open_dir(dir) {
                        Ok(dir) => dir,
                        Err(_) => root.create_dir(dir).expect("create_dir failed"),
                    };
                    dir.create_file(name).expect("create_file failed")
                }
                None => root.create_file(path).expect("create_file failed"),
            };
            file.truncate().unwrap();
            file.write_all(content).unwrap();
        }
    }
    disk
}

/// Read a file back through `fatfs`. Accepts `DIR/FILE` paths.
pub fn read_via_fatfs(disk: &mut MemDisk, path: &str) -> Vec<u8> {
    let mut cursor = Cursor::new(&mut disk.data);
    let fs = fatfs::FileSystem::new(&mut cursor, fatfs::FsOptions::new()).unwrap();
    let mut file = fs.root_dir().open_file(path).unwrap();
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).unwrap();
    buf
}

/// Names in directory `dir` as `fatfs` sees them, without `.` and `..`.
pub fn list_via_fatfs(disk: &mut MemDisk, dir: &str) -> Vec<String> {
    let mut cursor = Cursor::new(&mut disk.data);
    let fs = fatfs::FileSystem::new(&mut cursor, fatfs::FsOptions::new()).unwrap();
    let dir = fs.root_dir().open_dir(dir).unwrap();
    let names = dir
        .iter()
        .map(|entry| entry.unwrap().file_name())
        .filter(|name| name != "." && name != "..")
        .collect();
    names
}

/// Place `volume` behind an MBR whose first partition starts at `start`.
pub fn partitioned(volume: &MemDisk, start: u32) -> MemDisk {
    let offset = start as usize * SECTOR_SIZE;
    let mut data = vec![0u8; offset + volume.data.len()];
    data[0x1BE] = 0x00;
    data[0x1C2] = 0x06;
    data[0x1C6..0x1CA].copy_from_slice(&start.to_le_bytes());
    let sectors = (volume.data.len() / SECTOR_SIZE) as u32;
    data[0x1CA..0x1CE].copy_from_slice(&sectors.to_le_bytes());
    data[510] = 0x55;
    data[511] = 0xAA;
    data[offset..].copy_from_slice(&volume.data);
    MemDisk::from_bytes(data)
}

/// Read a whole file through the engine.
pub fn read_all<D: BlockDevice>(fs: &mut FatFs<D>, name: &str) -> Vec<u8> {
    let mut file = fs.open(name, OpenMode::Read).unwrap();
    let mut out = vec![0u8; file.len() as usize];
    let n = fs.read(&mut file, &mut out).unwrap();
    out.truncate(n);
    fs.close(file).unwrap();
    out
}
