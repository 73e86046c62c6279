//! Transport seam: the byte-shifting primitive the card protocol runs on.
//!
//! Board support code implements these for its SPI peripheral (or a bit-banged
//! pin set) and its free-running cycle counter.

use storage_api_types::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

pub trait SpiBus {
    /// Clock out the low `bits` bits of `value`.
    fn shift_out(&mut self, bits: u8, value: u32, order: BitOrder) -> Result<()>;

    /// Clock in `bits` bits and return them right-aligned.
    fn shift_in(&mut self, bits: u8, order: BitOrder) -> Result<u32>;

    fn assert_select(&mut self);
    fn release_select(&mut self);

    /// Change the bus clock rate.
    fn set_clock(&mut self, hz: u32) -> Result<()>;
}

/// Monotonic, wrapping cycle counter.
pub trait Clock {
    fn now(&self) -> u32;
    fn ticks_per_second(&self) -> u32;

    fn ticks_from_millis(&self, millis: u32) -> u32 {
        ((self.ticks_per_second() as u64 * millis as u64) / 1000) as u32
    }
}

impl<T: SpiBus + ?Sized> SpiBus for &mut T {
    fn shift_out(&mut self, bits: u8, value: u32, order: BitOrder) -> Result<()> {
        (**self).shift_out(bits, value, order)
    }

    fn shift_in(&mut self, bits: u8, order: BitOrder) -> Result<u32> {
        (**self).shift_in(bits, order)
    }

    fn assert_select(&mut self) {
        (**self).assert_select()
    }

    fn release_select(&mut self) {
        (**self).release_select()
    }

    fn set_clock(&mut self, hz: u32) -> Result<()> {
        (**self).set_clock(hz)
    }
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now(&self) -> u32 {
        (**self).now()
    }

    fn ticks_per_second(&self) -> u32 {
        (**self).ticks_per_second()
    }
}
