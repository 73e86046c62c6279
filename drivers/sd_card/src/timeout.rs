//! Bounded busy-waits against a wrapping cycle counter.

use crate::spi::Clock;

/// A point in counter time after which a wait gives up.
///
/// The wiggle room is added on top of the requested window so the coarse
/// sampling between two bus transfers can never expire a wait early. Windows
/// must stay below 2^31 ticks for the signed comparison to hold across a
/// counter wrap.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    expires_at: u32,
}

impl Deadline {
    pub fn after(clock: &impl Clock, ticks: u32, wiggle_room: u32) -> Self {
        Self {
            expires_at: clock.now().wrapping_add(ticks).wrapping_add(wiggle_room),
        }
    }

    pub fn is_expired(&self, clock: &impl Clock) -> bool {
        clock.now().wrapping_sub(self.expires_at) as i32 >= 0
    }
}

/// Spin for `ticks` counter ticks.
pub fn delay(clock: &impl Clock, ticks: u32) {
    let deadline = Deadline::after(clock, ticks, 0);
    while !deadline.is_expired(clock) {
        core::hint::spin_loop();
    }
}
