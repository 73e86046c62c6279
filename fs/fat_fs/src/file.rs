//! Open files and the operations every filesystem offers on them.

use storage_api_types::{BlockDevice, Error, Result, SECTOR_SHIFT, SECTOR_SIZE};

use crate::buffer::{FileId, Role};
use crate::chain::ChainCursor;
use crate::dir::{self, Attributes, EntryLocation, ShortName};
use crate::fs::FatFs;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing files only; writes fail.
    Read,
    /// Start at offset 0, creating the file if needed.
    Write,
    /// Start at the end, creating the file if needed.
    Append,
}

/// Capabilities shared by every filesystem the storage stack can mount.
pub trait FileSystem {
    type File;

    fn open(&mut self, name: &str, mode: OpenMode) -> Result<Self::File>;

    /// Copy up to `buf.len()` bytes from the current position. Returns 0 at end of file.
    fn read(&mut self, file: &mut Self::File, buf: &mut [u8]) -> Result<usize>;

    /// Write `data` at the current position, growing the file as needed.
    /// Returns fewer bytes than `data.len()` when the volume fills up part way;
    /// the next call then fails with [`Error::NoSpace`].
    fn write(&mut self, file: &mut Self::File, data: &[u8]) -> Result<usize>;

    /// Move to absolute `offset`, which may equal the file length but not exceed it.
    fn seek(&mut self, file: &mut Self::File, offset: u32) -> Result<()>;

    /// Write back pending data and the directory entry.
    fn close(&mut self, file: Self::File) -> Result<()>;

    /// Next byte, or `None` at end of file.
    fn read_byte(&mut self, file: &mut Self::File) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(file, &mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    fn write_byte(&mut self, file: &mut Self::File, byte: u8) -> Result<()> {
        self.write(file, &[byte]).map(|_| ())
    }
}

/// Handle to an open file on a [`FatFs`].
///
/// Dropping a handle without [`FileSystem::close`] leaves the directory entry
/// with its old length.
#[derive(Debug)]
pub struct FatFile {
    id: FileId,
    mode: OpenMode,
    name: ShortName,
    first_cluster: u32,
    content: ChainCursor,
    entry: EntryLocation,
    length: u32,
    position: u32,
    modified: bool,
}

impl FatFile {
    pub fn len(&self) -> u32 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn is_eof(&self) -> bool {
        self.position >= self.length
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name).unwrap_or("?")
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }
}

impl<D: BlockDevice> FatFs<D> {
    /// Bring the sector under `file.position` into the buffer. With `grow`, missing
    /// clusters are allocated on the way.
    fn load_position(&mut self, file: &mut FatFile, grow: bool) -> Result<()> {
        let layout = self.mounted_layout()?;
        if file.first_cluster == 0 {
            if !grow {
                return Err(Error::ReadingPastEndOfChain);
            }
            file.first_cluster = self.allocate_cluster()?;
            file.content = ChainCursor::DETACHED;
            file.modified = true;
        }

        let sector_index = file.position >> SECTOR_SHIFT;
        let cluster_index = sector_index >> layout.cluster_shift;
        self.seek_cluster(&mut file.content, file.first_cluster, cluster_index, grow)?;
        file.content.offset = sector_index & (layout.sectors_per_cluster() - 1);
        self.buffer.load(&mut self.device, Role::Content(file.id), file.content.sector())
    }
}

impl<D: BlockDevice> FileSystem for FatFs<D> {
    type File = FatFile;

    fn open(&mut self, name: &str, mode: OpenMode) -> Result<FatFile> {
        let layout = self.mounted_layout()?;
        let (entry, first_cluster, length, short) = match self.find(name.as_bytes()) {
            Ok((location, raw)) => {
                if raw.is_dir() {
                    return Err(Error::EntryNotFile);
                }
                let first = raw.first_cluster(layout.fat_type);
                if first != 0 && !layout.is_valid_cluster(first) {
                    return Err(Error::BadCluster);
                }
                (location, first, raw.size, raw.name)
            }
            Err(Error::FileNotFound) if mode != OpenMode::Read => {
                let short = dir::encode_short_name(name)?;
                let location = self.create_entry(short, Attributes::ARCHIVE)?;
                log::debug!("fat: created {}", name);
                (location, 0, 0, short)
            }
            Err(e) => return Err(e),
        };

        let mut file = FatFile {
            id: self.next_file_id(),
            mode,
            name: dir::short_name(&short),
            first_cluster,
            content: ChainCursor::DETACHED,
            entry,
            length,
            position: if mode == OpenMode::Append { length } else { 0 },
            modified: false,
        };

        if first_cluster != 0 {
            file.content = self.start_chain(first_cluster)?;
            if !file.is_eof() {
                self.load_position(&mut file, false)?;
            }
        }
        log::debug!("fat: opened {} ({} bytes, {:?})", file.name(), length, mode);
        Ok(file)
    }

    fn read(&mut self, file: &mut FatFile, buf: &mut [u8]) -> Result<usize> {
        self.mounted_layout()?;
        let mut done = 0;
        while done < buf.len() && !file.is_eof() {
            self.load_position(file, false)?;
            let at = file.position as usize & (SECTOR_SIZE - 1);
            let n = (SECTOR_SIZE - at)
                .min(buf.len() - done)
                .min((file.length - file.position) as usize);
            buf[done..done + n].copy_from_slice(&self.buffer.bytes()[at..at + n]);
            done += n;
            file.position += n as u32;
        }
        Ok(done)
    }

    fn write(&mut self, file: &mut FatFile, data: &[u8]) -> Result<usize> {
        self.mounted_layout()?;
        if file.mode == OpenMode::Read {
            return Err(Error::ReadOnlyHandle);
        }
        let mut done = 0;
        while done < data.len() {
            let at = file.position as usize & (SECTOR_SIZE - 1);
            let n = (SECTOR_SIZE - at).min(data.len() - done);
            let Some(end) = file.position.checked_add(n as u32) else {
                break;
            };
            match self.load_position(file, true) {
                Err(Error::NoSpace) if done > 0 => break,
                result => result?,
            }
            self.buffer.bytes_mut()[at..at + n].copy_from_slice(&data[done..done + n]);
            done += n;
            file.position = end;
            file.length = file.length.max(end);
            file.modified = true;
        }
        if done == 0 && !data.is_empty() {
            return Err(Error::NoSpace);
        }
        Ok(done)
    }

    fn seek(&mut self, file: &mut FatFile, offset: u32) -> Result<()> {
        self.mounted_layout()?;
        if offset > file.length {
            return Err(Error::InvalidOffset);
        }
        file.position = offset;
        if !file.is_eof() {
            self.load_position(file, false)?;
        }
        Ok(())
    }

    fn close(&mut self, file: FatFile) -> Result<()> {
        self.mounted_layout()?;
        if self.buffer.owner() == Some(Role::Content(file.id)) {
            self.buffer.flush(&mut self.device)?;
        }
        if file.modified {
            self.update_entry(file.entry, file.first_cluster, file.length)?;
        }
        log::debug!("fat: closed {} ({} bytes)", file.name(), file.length);
        Ok(())
    }
}
