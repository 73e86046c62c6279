// SD card (SPI mode) block driver.
// No_std when not testing; the tests drive the protocol through a scripted bus.
#![cfg_attr(not(test), no_std)]

pub mod command;
pub mod sd;
pub mod spi;
pub mod timeout;

pub use sd::{SdCard, SdConfig};
pub use spi::{BitOrder, Clock, SpiBus};
