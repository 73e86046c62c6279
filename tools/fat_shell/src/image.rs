//! Raw disk images as block devices.

use std::io::{self, Read, Seek, SeekFrom, Write};

use storage_api_types::{BlockDevice, Error, Result, Sector, SECTOR_SIZE};

/// A sector view of any seekable byte store, usually an image file.
pub struct Image<F> {
    inner: F,
    sectors: u32,
}

impl<F: Read + Write + Seek> Image<F> {
    pub fn new(mut inner: F) -> io::Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        let sectors = u32::try_from(len / SECTOR_SIZE as u64)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "image larger than 2 TiB"))?;
        log::debug!("image: {} sectors", sectors);
        Ok(Self { inner, sectors })
    }

    pub fn sectors(&self) -> u32 {
        self.sectors
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    fn seek_to(&mut self, sector: u32) -> Result<()> {
        if sector >= self.sectors {
            log::error!("image: sector {} past the end ({} sectors)", sector, self.sectors);
            return Err(Error::Bus);
        }
        self.inner
            .seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .map(|_| ())
            .map_err(io_error)
    }
}

fn io_error(e: io::Error) -> Error {
    log::error!("image: {e}");
    Error::Bus
}

impl<F: Read + Write + Seek> BlockDevice for Image<F> {
    fn read_sector(&mut self, sector: u32, buf: &mut Sector) -> Result<()> {
        self.seek_to(sector)?;
        self.inner.read_exact(buf).map_err(io_error)
    }

    fn write_sector(&mut self, sector: u32, buf: &Sector) -> Result<()> {
        self.seek_to(sector)?;
        self.inner.write_all(buf).map_err(io_error)
    }
}

/// Grow `inner` to `size_mib` MiB and format it.
pub fn create<F: Read + Write + Seek>(mut inner: F, size_mib: u32, fat_type: fatfs::FatType) -> io::Result<F> {
    let len = size_mib as u64 * 1024 * 1024;
    if len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "image size must be positive"));
    }
    inner.seek(SeekFrom::Start(len - 1))?;
    inner.write_all(&[0])?;
    inner.seek(SeekFrom::Start(0))?;
    fatfs::format_volume(
        &mut inner,
        fatfs::FormatVolumeOptions::new()
            .fat_type(fat_type)
            .volume_label(*b"FAT_SHELL  "),
    )?;
    log::info!("image: formatted {} MiB as {:?}", size_mib, fat_type);
    Ok(inner)
}
