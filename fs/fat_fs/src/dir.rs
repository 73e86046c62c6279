//! Directory scanning, 8.3 names and entry creation.

use bitflags::bitflags;
use heapless::Vec;
use storage_api_types::{BlockDevice, Error, Result, SECTOR_SIZE};

use crate::buffer::Role;
use crate::chain::ChainCursor;
use crate::fs::FatFs;
use crate::layout::{FatType, Layout, DIR_ENTRY_SIZE};

// ─── Entry format ──────────────────────────────────────────────────────────────

const ENTRY_LEN: usize = DIR_ENTRY_SIZE as usize;
const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / ENTRY_LEN;

const NAME:       usize = 0x00;
const EXT:        usize = 0x08;
const ATTR:       usize = 0x0B;
const CLUSTER_HI: usize = 0x14;
const CLUSTER_LO: usize = 0x1A;
const SIZE:       usize = 0x1C;

/// First name byte of the entry that ends a directory.
const END_OF_DIR: u8 = 0x00;
const DELETED:    u8 = 0xE5;
/// Stored in place of a leading 0xE5, which would read as deleted.
const ESCAPED_E5: u8 = 0x05;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE   = 0x20;
        /// Marks a long-file-name fragment.
        const LONG_NAME = Self::READ_ONLY.bits() | Self::HIDDEN.bits() | Self::SYSTEM.bits() | Self::VOLUME_ID.bits();

        const _ = !0;
    }
}

/// A short name as displayed, e.g. `README.TXT`.
pub type ShortName = Vec<u8, 12>;

/// One listed entry of a directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: ShortName,
    pub attributes: Attributes,
    pub size: u32,
    /// Zero for empty files and for `..` pointing at the root.
    pub first_cluster: u32,
}

impl DirEntryInfo {
    pub fn is_dir(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }

    /// The name as text. Bytes outside ASCII come back as `?`.
    pub fn name_str(&self) -> &str {
        core::str::from_utf8(&self.name).unwrap_or("?")
    }
}

/// Where a directory entry lives on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryLocation {
    pub sector: u32,
    /// Byte offset of the entry inside the sector.
    pub offset: u16,
}

/// The fields of an on-disk entry the engine uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RawEntry {
    pub name: [u8; 11],
    pub attributes: Attributes,
    cluster_hi: u16,
    cluster_lo: u16,
    pub size: u32,
}

impl RawEntry {
    pub fn parse(raw: &[u8]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&raw[NAME..EXT + 3]);
        Self {
            name,
            attributes: Attributes::from_bits_retain(raw[ATTR]),
            cluster_hi: u16::from_le_bytes([raw[CLUSTER_HI], raw[CLUSTER_HI + 1]]),
            cluster_lo: u16::from_le_bytes([raw[CLUSTER_LO], raw[CLUSTER_LO + 1]]),
            size: u32::from_le_bytes([raw[SIZE], raw[SIZE + 1], raw[SIZE + 2], raw[SIZE + 3]]),
        }
    }

    /// FAT16 keeps the high half zero (it is the EA index there).
    pub fn first_cluster(&self, fat_type: FatType) -> u32 {
        let high = match fat_type {
            FatType::Fat16 => 0,
            FatType::Fat32 => (self.cluster_hi as u32) << 16,
        };
        (high | self.cluster_lo as u32) & fat_type.entry_mask()
    }

    pub fn is_dir(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }

    /// Long-name fragments and the volume label are not files.
    fn is_listable(&self) -> bool {
        !self.attributes.contains(Attributes::LONG_NAME) && !self.attributes.contains(Attributes::VOLUME_ID)
    }

    fn info(&self, fat_type: FatType) -> DirEntryInfo {
        DirEntryInfo {
            name: short_name(&self.name),
            attributes: self.attributes,
            size: self.size,
            first_cluster: self.first_cluster(fat_type),
        }
    }
}

// ─── Names ─────────────────────────────────────────────────────────────────────

/// Display form of an 11-byte padded name, e.g. `"HELLO   TXT"` → `"HELLO.TXT"`.
pub fn short_name(raw: &[u8; 11]) -> ShortName {
    let mut out = ShortName::new();
    let base = &raw[..8];
    let ext = &raw[8..];
    let base_end = base.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
    let ext_end = ext.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);

    // Capacity is 12: at most 8 + '.' + 3.
    for (i, &b) in base[..base_end].iter().enumerate() {
        let b = if i == 0 && b == ESCAPED_E5 { DELETED } else { b };
        let _ = out.push(b);
    }
    if ext_end > 0 {
        let _ = out.push(b'.');
        let _ = out.extend_from_slice(&ext[..ext_end]);
    }
    out
}

/// Case-insensitive comparison of a short name with a query.
pub fn names_match(short: &[u8], query: &[u8]) -> bool {
    short.eq_ignore_ascii_case(query)
}

fn is_short_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'()-@^_`{}~".contains(&b)
}

/// Pack `filename` into the padded, upper-cased 11-byte form.
pub fn encode_short_name(filename: &str) -> Result<[u8; 11]> {
    let (base, ext) = match filename.rfind('.') {
        Some(i) => (&filename[..i], &filename[i + 1..]),
        None => (filename, ""),
    };
    let valid = |part: &str, max: usize| part.len() <= max && part.bytes().all(is_short_name_char);
    if base.is_empty() || !valid(base, 8) || !valid(ext, 3) {
        return Err(Error::InvalidFileName);
    }

    let mut out = [b' '; 11];
    for (i, b) in base.bytes().enumerate() {
        out[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().enumerate() {
        out[8 + i] = b.to_ascii_uppercase();
    }
    Ok(out)
}

// ─── Scanning ──────────────────────────────────────────────────────────────────

pub(crate) enum Visit<T> {
    Continue,
    Stop(T),
}

impl<D: BlockDevice> FatFs<D> {
    /// Where scans of the current directory begin.
    fn dir_start(&mut self, layout: &Layout) -> Result<ChainCursor> {
        if self.cwd == 0 {
            Ok(ChainCursor { base: layout.root_dir_start, ..ChainCursor::default() })
        } else {
            self.start_chain(self.cwd)
        }
    }

    fn dir_at_start(&self, layout: &Layout) -> bool {
        let d = &self.dir;
        d.index == 0 && d.offset == 0 && d.cluster == self.cwd
            && (self.cwd != 0 || d.base == layout.root_dir_start)
    }

    /// Put the directory cursor back on the first sector of the current directory
    /// and load it into the shared buffer.
    pub(crate) fn rewind_dir(&mut self) -> Result<()> {
        let layout = self.mounted_layout()?;
        if !self.dir_at_start(&layout) {
            self.dir = self.dir_start(&layout)?;
        }
        self.buffer.load(&mut self.device, Role::Directory, self.dir.sector())
    }

    /// Step the directory cursor one sector. `false` at the end of the directory.
    fn next_dir_sector(&mut self) -> Result<bool> {
        let layout = self.mounted_layout()?;
        if self.cwd == 0 {
            if self.dir.offset + 1 >= layout.root_dir_sectors {
                return Ok(false);
            }
            self.dir.offset += 1;
            return Ok(true);
        }
        let mut cursor = self.dir;
        match self.next_sector(&mut cursor) {
            Ok(()) => {
                self.dir = cursor;
                Ok(true)
            }
            Err(Error::ReadingPastEndOfChain) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Walk the current directory from the top, handing each 32-byte record to
    /// `visit`. The scan ends after an end-of-directory record has been visited.
    pub(crate) fn scan_dir<T>(
        &mut self,
        mut visit: impl FnMut(&[u8], EntryLocation) -> Visit<T>,
    ) -> Result<Option<T>> {
        self.rewind_dir()?;
        loop {
            let sector = self.dir.sector();
            self.buffer.load(&mut self.device, Role::Directory, sector)?;
            for slot in 0..ENTRIES_PER_SECTOR {
                let offset = slot * ENTRY_LEN;
                let raw = &self.buffer.bytes()[offset..offset + ENTRY_LEN];
                let location = EntryLocation { sector, offset: offset as u16 };
                if let Visit::Stop(found) = visit(raw, location) {
                    return Ok(Some(found));
                }
                if raw[NAME] == END_OF_DIR {
                    return Ok(None);
                }
            }
            if !self.next_dir_sector()? {
                return Ok(None);
            }
        }
    }

    /// Locate `name` in the current directory.
    pub(crate) fn find(&mut self, name: &[u8]) -> Result<(EntryLocation, RawEntry)> {
        if name.is_empty() || name.len() > 12 {
            return Err(Error::FileNotFound);
        }
        let found = self.scan_dir(|raw, location| {
            if raw[NAME] == END_OF_DIR || raw[NAME] == DELETED {
                return Visit::Continue;
            }
            let entry = RawEntry::parse(raw);
            if entry.is_listable() && names_match(&short_name(&entry.name), name) {
                Visit::Stop((location, entry))
            } else {
                Visit::Continue
            }
        })?;
        found.ok_or(Error::FileNotFound)
    }

    /// Where `name`'s entry lives in the current directory, and what it says.
    pub fn lookup(&mut self, name: &str) -> Result<(EntryLocation, DirEntryInfo)> {
        let fat_type = self.mounted_layout()?.fat_type;
        let (location, entry) = self.find(name.as_bytes())?;
        Ok((location, entry.info(fat_type)))
    }

    /// Fill `out` with the visible entries of the current directory.
    /// Returns how many were written; extra entries are left out.
    pub fn read_dir(&mut self, out: &mut [DirEntryInfo]) -> Result<usize> {
        let fat_type = self.mounted_layout()?.fat_type;
        let mut count = 0;
        self.scan_dir(|raw, _| {
            if count == out.len() {
                return Visit::Stop(());
            }
            if raw[NAME] != END_OF_DIR && raw[NAME] != DELETED {
                let entry = RawEntry::parse(raw);
                if entry.is_listable() {
                    out[count] = entry.info(fat_type);
                    count += 1;
                }
            }
            Visit::Continue
        })?;
        Ok(count)
    }

    /// Make the subdirectory `name` current. `..` leading to the root and `/` both
    /// return to the root directory.
    pub fn change_dir(&mut self, name: &str) -> Result<()> {
        let layout = self.mounted_layout()?;
        if name == "/" {
            self.cwd = layout.root_dir_cluster();
            return self.rewind_dir();
        }
        let (_, entry) = self.find(name.as_bytes())?;
        if !entry.is_dir() {
            return Err(Error::EntryNotDirectory);
        }
        self.cwd = match entry.first_cluster(layout.fat_type) {
            0 => layout.root_dir_cluster(),
            cluster if layout.is_valid_cluster(cluster) => cluster,
            _ => return Err(Error::BadCluster),
        };
        log::debug!("fat: cwd is now cluster {}", self.cwd);
        self.rewind_dir()
    }

    /// Write a fresh entry for `name` into the first free slot, growing a
    /// cluster-chained directory by one cluster when it is full.
    pub(crate) fn create_entry(&mut self, name: [u8; 11], attributes: Attributes) -> Result<EntryLocation> {
        let layout = self.mounted_layout()?;
        let free = self.scan_dir(|raw, location| {
            if raw[NAME] == END_OF_DIR || raw[NAME] == DELETED {
                Visit::Stop(location)
            } else {
                Visit::Continue
            }
        })?;

        let location = match free {
            Some(location) => {
                self.buffer.load(&mut self.device, Role::Directory, location.sector)?;
                location
            }
            None if self.cwd == 0 => return Err(Error::DirectoryFull),
            None => self.grow_dir(&layout)?,
        };

        let at = location.offset as usize;
        let slot = &mut self.buffer.bytes_mut()[at..at + ENTRY_LEN];
        slot.fill(0);
        slot[NAME..NAME + 11].copy_from_slice(&name);
        slot[ATTR] = attributes.bits();
        log::debug!("fat: new entry at sector {} offset {}", location.sector, at);
        Ok(location)
    }

    /// Append a zeroed cluster to the current directory. The scan that found no
    /// free slot left the cursor on the last cluster.
    fn grow_dir(&mut self, layout: &Layout) -> Result<EntryLocation> {
        let last = self.dir.cluster;
        let new = self.allocate_cluster()?;
        self.set_fat_value(last, new)?;
        let first = layout.cluster_to_sector(new);
        for sector in first..first + layout.sectors_per_cluster() {
            self.buffer.claim_zeroed(&mut self.device, Role::Directory, sector)?;
            self.buffer.flush(&mut self.device)?;
        }
        self.buffer.ensure_loaded(&mut self.device, first)?;
        self.dir = ChainCursor::DETACHED;
        log::debug!("fat: directory grew into cluster {}", new);
        Ok(EntryLocation { sector: first, offset: 0 })
    }

    /// Rewrite the size, start cluster and archive bit of the entry at `location`.
    pub(crate) fn update_entry(&mut self, location: EntryLocation, first_cluster: u32, size: u32) -> Result<()> {
        let layout = self.mounted_layout()?;
        self.buffer.load(&mut self.device, Role::Directory, location.sector)?;
        let at = location.offset as usize;
        let slot = &mut self.buffer.bytes_mut()[at..at + ENTRY_LEN];
        let high = match layout.fat_type {
            FatType::Fat16 => 0,
            FatType::Fat32 => (first_cluster >> 16) as u16,
        };
        slot[CLUSTER_HI..CLUSTER_HI + 2].copy_from_slice(&high.to_le_bytes());
        slot[CLUSTER_LO..CLUSTER_LO + 2].copy_from_slice(&(first_cluster as u16).to_le_bytes());
        slot[SIZE..SIZE + 4].copy_from_slice(&size.to_le_bytes());
        slot[ATTR] |= Attributes::ARCHIVE.bits();
        self.buffer.flush(&mut self.device)
    }
}
