//! The one sector-sized cache every part of the engine shares.
//!
//! A slot holds a single sector together with the role that loaded it. Binding
//! the slot to a different role writes back pending changes first, so no caller
//! ever sees bytes another owner left behind.

use storage_api_types::{BlockDevice, Result, Sector, SECTOR_SIZE};

/// Identifies one open file for buffer ownership.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId(pub(crate) u16);

/// Who currently owns the shared sector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Boot sector at mount time, then directory scans and entry updates.
    Directory,
    /// Data sectors of one open file.
    Content(FileId),
    /// FAT sectors during lookups, links and allocation.
    FatScan,
}

pub struct SectorBuffer {
    data: Sector,
    owner: Option<Role>,
    sector: Option<u32>,
    dirty: bool,
}

impl Default for SectorBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SectorBuffer {
    pub const fn new() -> Self {
        Self { data: [0; SECTOR_SIZE], owner: None, sector: None, dirty: false }
    }

    pub fn owner(&self) -> Option<Role> {
        self.owner
    }

    /// Sector currently held, if any.
    pub fn sector(&self) -> Option<u32> {
        self.sector
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Hand the slot to `role`. A change of owner writes back pending data and
    /// forgets the held sector so the next `ensure_loaded` reads it fresh.
    pub fn bind<D: BlockDevice>(&mut self, device: &mut D, role: Role) -> Result<()> {
        if self.owner == Some(role) {
            return Ok(());
        }
        self.flush(device)?;
        log::trace!("fat: buffer {:?} -> {:?}", self.owner, role);
        self.owner = Some(role);
        self.sector = None;
        Ok(())
    }

    /// Make sure `sector` is the one in the slot, reading it only on a miss.
    pub fn ensure_loaded<D: BlockDevice>(&mut self, device: &mut D, sector: u32) -> Result<()> {
        if self.sector == Some(sector) {
            return Ok(());
        }
        self.flush(device)?;
        // A failed read leaves the slot holding nothing.
        self.sector = None;
        device.read_sector(sector, &mut self.data)?;
        log::trace!("fat: read sector {}", sector);
        self.sector = Some(sector);
        Ok(())
    }

    /// Bind to `role` and load `sector`.
    pub fn load<D: BlockDevice>(&mut self, device: &mut D, role: Role, sector: u32) -> Result<()> {
        self.bind(device, role)?;
        self.ensure_loaded(device, sector)
    }

    /// Bind to `role` and take `sector` as all zeroes without reading it.
    /// The slot is dirty afterwards.
    pub fn claim_zeroed<D: BlockDevice>(&mut self, device: &mut D, role: Role, sector: u32) -> Result<()> {
        self.bind(device, role)?;
        self.flush(device)?;
        self.data = [0; SECTOR_SIZE];
        self.sector = Some(sector);
        self.dirty = true;
        Ok(())
    }

    /// Write the held sector back if it was modified.
    pub fn flush<D: BlockDevice>(&mut self, device: &mut D) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(sector) = self.sector {
            device.write_sector(sector, &self.data)?;
            log::trace!("fat: wrote sector {}", sector);
        }
        self.dirty = false;
        Ok(())
    }

    /// Flush and drop ownership entirely.
    pub fn release<D: BlockDevice>(&mut self, device: &mut D) -> Result<()> {
        self.flush(device)?;
        self.owner = None;
        self.sector = None;
        Ok(())
    }

    pub fn bytes(&self) -> &Sector {
        debug_assert!(self.sector.is_some(), "buffer read with no sector loaded");
        &self.data
    }

    /// Mutable view of the held sector. Marks the slot dirty.
    pub fn bytes_mut(&mut self) -> &mut Sector {
        debug_assert!(self.sector.is_some(), "buffer written with no sector loaded");
        self.dirty = true;
        &mut self.data
    }
}
