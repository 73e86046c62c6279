#![no_std]

#[cfg(test)]
extern crate std;

use core::fmt;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Bytes per device sector. SD cards in SPI mode always transfer 512-byte blocks.
pub const SECTOR_SIZE: usize = 512;

/// log2(`SECTOR_SIZE`), used to turn byte positions into sector indices.
pub const SECTOR_SHIFT: u32 = 9;

pub type Sector = [u8; SECTOR_SIZE];

pub type Result<T> = core::result::Result<T, Error>;

/// Sector-addressed storage, the seam between the card driver and the filesystem.
///
/// Calls are blocking and must not overlap.
pub trait BlockDevice {
    fn read_sector(&mut self, sector: u32, buf: &mut Sector) -> Result<()>;
    fn write_sector(&mut self, sector: u32, buf: &Sector) -> Result<()>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn read_sector(&mut self, sector: u32, buf: &mut Sector) -> Result<()> {
        (**self).read_sector(sector, buf)
    }

    fn write_sector(&mut self, sector: u32, buf: &Sector) -> Result<()> {
        (**self).write_sector(sector, buf)
    }
}

/// Every failure the storage stack can report.
///
/// The numeric values are stable so firmware can report them over a status
/// channel as a single byte.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum Error {
    // Transport
    Bus = 1,
    ReadTimeout = 2,
    BusyTimeout = 3,

    // Protocol
    InitTimeout = 10,
    InvalidInit = 11,
    InvalidResponse = 12,
    InvalidDataStartToken = 13,
    WriteRejected = 14,
    NotInitialized = 15,

    // Layout
    UnsupportedFilesystem = 20,
    MalformedVolume = 21,
    InvalidPartition = 22,

    // Chain
    ReadingPastEndOfChain = 30,
    BadCluster = 31,

    // Lookup
    FileNotFound = 40,
    EntryNotFile = 41,
    EntryNotDirectory = 42,
    InvalidFileName = 43,

    // State
    AlreadyMounted = 50,
    NotMounted = 51,
    ReadOnlyHandle = 52,

    // Bounds
    InvalidOffset = 60,
    NoSpace = 61,
    DirectoryFull = 62,
}

/// Coarse grouping of [`Error`] by the layer that raised it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Framing or timeout during a device exchange.
    Transport,
    /// The device answered with an unexpected token or status.
    Protocol,
    /// The volume is unsupported or malformed.
    Layout,
    /// Cluster chain ended early or contains an impossible link.
    Chain,
    Lookup,
    /// Operation called out of order (mount/unmount, handle mode).
    State,
    Bounds,
}

impl Error {
    pub fn kind(self) -> ErrorKind {
        match u8::from(self) {
            0..10 => ErrorKind::Transport,
            10..20 => ErrorKind::Protocol,
            20..30 => ErrorKind::Layout,
            30..40 => ErrorKind::Chain,
            40..50 => ErrorKind::Lookup,
            50..60 => ErrorKind::State,
            _ => ErrorKind::Bounds,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            Error::Bus => "bus transfer failed",
            Error::ReadTimeout => "timed out waiting for the card",
            Error::BusyTimeout => "card stayed busy after a write",
            Error::InitTimeout => "card never entered the idle state",
            Error::InvalidInit => "invalid response during initialization",
            Error::InvalidResponse => "invalid first-byte response",
            Error::InvalidDataStartToken => "invalid data-start token",
            Error::WriteRejected => "card rejected the data block",
            Error::NotInitialized => "card is not initialized",
            Error::UnsupportedFilesystem => "unsupported filesystem",
            Error::MalformedVolume => "malformed boot sector",
            Error::InvalidPartition => "no such partition",
            Error::ReadingPastEndOfChain => "reading past end of cluster chain",
            Error::BadCluster => "cluster chain links to an invalid cluster",
            Error::FileNotFound => "file not found",
            Error::EntryNotFile => "entry is not a file",
            Error::EntryNotDirectory => "entry is not a directory",
            Error::InvalidFileName => "invalid 8.3 file name",
            Error::AlreadyMounted => "filesystem is already mounted",
            Error::NotMounted => "filesystem is not mounted",
            Error::ReadOnlyHandle => "file was opened read-only",
            Error::InvalidOffset => "offset is past the end of the file",
            Error::NoSpace => "no free clusters left",
            Error::DirectoryFull => "directory has no free entries",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for Error {}
