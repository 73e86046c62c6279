// FAT16/FAT32 engine for a single shared sector buffer.
// No_std when not testing; tests build real images with the `fatfs` crate.
#![cfg_attr(not(test), no_std)]

pub mod buffer;
pub mod chain;
pub mod dir;
pub mod file;
pub mod fs;
pub mod layout;

#[cfg(test)]
mod testing;

pub use buffer::{FileId, Role, SectorBuffer};
pub use chain::ChainCursor;
pub use dir::{Attributes, DirEntryInfo, EntryLocation, ShortName};
pub use file::{FatFile, FileSystem, OpenMode};
pub use fs::FatFs;
pub use layout::{FatType, Layout};
pub use storage_api_types::{BlockDevice, Error, ErrorKind, Result, SECTOR_SIZE};
