//! SD card driver, SPI mode, single-block transfers.
//!
//! Every exchange is synchronous: one command frame, then a bounded wait for
//! the card's answer. Chip select is asserted for the duration of one command
//! (or of the whole initialization handshake) and always released on exit,
//! including error paths.

use storage_api_types::{BlockDevice, Error, Result, Sector, SECTOR_SIZE};

use crate::command::*;
use crate::spi::{BitOrder, Clock, SpiBus};
use crate::timeout::{delay, Deadline};

const ORDER: BitOrder = BitOrder::MsbFirst;

/// Board-tunable protocol parameters. Defaults match a Propeller-class MCU
/// talking to a generic SDHC card.
#[derive(Clone, Copy, Debug)]
pub struct SdConfig {
    /// Bus clock during the handshake. Cards require 100-400 kHz here.
    pub init_clock_hz: u32,
    /// Bus clock once the card reports ready.
    pub run_clock_hz: u32,
    pub response_timeout_ms: u32,
    pub write_busy_timeout_ms: u32,
    /// Extra ticks added to every deadline to absorb counter sampling granularity.
    pub wiggle_room: u32,
    pub idle_retries: u32,
    pub idle_retry_delay_ms: u32,
    pub activate_attempts: u32,
}

impl Default for SdConfig {
    fn default() -> Self {
        Self {
            init_clock_hz: 200_000,
            run_clock_hz: 1_900_000,
            response_timeout_ms: 100,
            write_busy_timeout_ms: 500,
            wiggle_room: 10_000,
            idle_retries: 10,
            idle_retry_delay_ms: 500,
            activate_attempts: 1_000,
        }
    }
}

/// How command arguments address the card.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Addressing {
    /// SDHC/SDXC: arguments are sector numbers.
    Block,
    /// Standard capacity: arguments are byte offsets.
    Byte,
}

impl Addressing {
    fn argument(self, sector: u32) -> u32 {
        match self {
            Addressing::Block => sector,
            Addressing::Byte => sector << storage_api_types::SECTOR_SHIFT,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CardInfo {
    pub addressing: Addressing,
    /// Capacity decoded from the CSD register, if its layout was recognized.
    pub sector_count: Option<u64>,
}

pub struct SdCard<S, C> {
    bus: S,
    clock: C,
    config: SdConfig,
    card: Option<CardInfo>,
}

impl<S: SpiBus, C: Clock> SdCard<S, C> {
    pub fn new(bus: S, clock: C, config: SdConfig) -> Self {
        Self { bus, clock, config, card: None }
    }

    pub fn info(&self) -> Option<CardInfo> {
        self.card
    }

    pub fn is_initialized(&self) -> bool {
        self.card.is_some()
    }

    pub fn into_parts(self) -> (S, C) {
        (self.bus, self.clock)
    }

    /// Run the power-up handshake: idle, interface condition, activation.
    ///
    /// The bus clock is raised to `run_clock_hz` only after the card reports
    /// ready.
    pub fn initialize(&mut self) -> Result<()> {
        self.card = None;
        self.bus.release_select();
        self.bus.set_clock(self.config.init_clock_hz)?;

        let result = self.handshake();
        self.bus.release_select();
        let info = result?;

        match info.sector_count {
            Some(n) => log::info!(
                "sd: card ready, {} sectors ({} MB), {:?} addressing",
                n,
                n / 2048,
                info.addressing
            ),
            None => log::info!("sd: card ready, unknown capacity, {:?} addressing", info.addressing),
        }
        self.card = Some(info);
        Ok(())
    }

    fn handshake(&mut self) -> Result<CardInfo> {
        self.enter_idle()?;

        // Voltage range check; the card echoes the pattern back in R7
        let mut r7 = [0u8; R7_LEN];
        self.send_command(Command::SendIfCond, IF_COND_ARG)?;
        self.get_response(&mut r7).map_err(init_error)?;
        if r7[0] != R1_IDLE || r7[3] != (IF_COND_ARG >> 8) as u8 || r7[4] != IF_COND_ARG as u8 {
            log::warn!("sd: CMD8 echo mismatch {:02x?}", r7);
            return Err(Error::InvalidInit);
        }

        let mut ocr = [0u8; R3_LEN];
        self.send_command(Command::ReadOcr, 0)?;
        self.get_response(&mut ocr).map_err(init_error)?;
        if ocr[0] != R1_IDLE {
            return Err(Error::InvalidInit);
        }

        self.activate()?;

        // CCS is only valid once the card has left the idle state
        self.send_command(Command::ReadOcr, 0)?;
        self.get_response(&mut ocr).map_err(init_error)?;
        let addressing = if ocr[1] & OCR_CCS != 0 { Addressing::Block } else { Addressing::Byte };

        self.bus.set_clock(self.config.run_clock_hz)?;

        let mut csd = [0u8; 16];
        self.send_command(Command::SendCsd, 0)?;
        self.read_data_block(&mut csd)?;
        log::debug!("sd: CSD {:02x?}", csd);

        let mut cid = [0u8; 16];
        self.send_command(Command::SendCid, 0)?;
        self.read_data_block(&mut cid)?;
        log::debug!("sd: CID {:02x?}", cid);

        Ok(CardInfo { addressing, sector_count: capacity_from_csd(&csd) })
    }

    fn enter_idle(&mut self) -> Result<()> {
        let mut r1 = [FILLER; R1_LEN];
        for attempt in 0..self.config.idle_retries {
            if attempt > 0 {
                delay(&self.clock, self.clock.ticks_from_millis(self.config.idle_retry_delay_ms));
            }

            // At least 74 clocks with select released so the card enters SPI mode
            self.bus.release_select();
            for _ in 0..5 {
                self.bus.shift_out(16, 0xFFFF, ORDER)?;
            }
            self.bus.assert_select();

            self.send_command(Command::GoIdleState, 0)?;
            match self.get_response(&mut r1) {
                Ok(()) if r1[0] == R1_IDLE => return Ok(()),
                Ok(()) | Err(Error::ReadTimeout) | Err(Error::InvalidResponse) => {
                    log::trace!("sd: CMD0 attempt {} got {:#04x}", attempt, r1[0]);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::InitTimeout)
    }

    fn activate(&mut self) -> Result<()> {
        let mut r1 = [FILLER; R1_LEN];
        for _ in 0..self.config.activate_attempts {
            self.send_command(Command::AppCmd, 0)?;
            self.get_response(&mut r1).map_err(init_error)?;
            self.send_command(Command::SdSendOpCond, HCS)?;
            self.get_response(&mut r1).map_err(init_error)?;
            if r1[0] == R1_READY {
                return Ok(());
            }
        }
        log::warn!("sd: card never left the idle state");
        Err(Error::InvalidInit)
    }

    // ─── Framing ──────────────────────────────────────────────────────────────

    /// Send a 6-byte command frame: command, 32-bit argument (big endian), CRC.
    fn send_command(&mut self, command: Command, arg: u32) -> Result<()> {
        self.bus.shift_out(8, command.frame_byte() as u32, ORDER)?;
        self.bus.shift_out(16, arg >> 16, ORDER)?;
        self.bus.shift_out(16, arg & 0xFFFF, ORDER)?;
        self.bus.shift_out(8, command.crc() as u32, ORDER)
    }

    fn read_byte(&mut self) -> Result<u8> {
        Ok(self.bus.shift_in(8, ORDER)? as u8)
    }

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.bus.shift_out(8, byte as u32, ORDER)
    }

    /// Skip idle-line bytes (`0xFF`) until the card drives something else.
    fn wait_for_byte(&mut self) -> Result<u8> {
        let ticks = self.clock.ticks_from_millis(self.config.response_timeout_ms);
        let deadline = Deadline::after(&self.clock, ticks, self.config.wiggle_room);
        loop {
            let byte = self.read_byte()?;
            if byte != FILLER {
                return Ok(byte);
            }
            if deadline.is_expired(&self.clock) {
                return Err(Error::ReadTimeout);
            }
        }
    }

    /// Receive an R1/R3/R7 response into `out`; `out.len()` selects the format.
    fn get_response(&mut self, out: &mut [u8]) -> Result<()> {
        let r1 = self.wait_for_byte()?;
        if r1 != R1_IDLE && r1 != R1_READY {
            log::warn!("sd: invalid response {:#04x} {:?}", r1, R1Status::from_bits_retain(r1));
            return Err(Error::InvalidResponse);
        }
        out[0] = r1;
        for byte in &mut out[1..] {
            *byte = self.read_byte()?;
        }
        self.write_byte(FILLER)
    }

    /// Receive the R1 and data block that follow a read-type command.
    fn read_data_block(&mut self, out: &mut [u8]) -> Result<()> {
        let r1 = self.wait_for_byte()?;
        if r1 != R1_READY {
            log::warn!("sd: invalid response {:#04x} {:?}", r1, R1Status::from_bits_retain(r1));
            return Err(Error::InvalidResponse);
        }

        let token = self.wait_for_byte()?;
        if token != DATA_START_TOKEN {
            log::warn!("sd: invalid data-start token {:#04x}", token);
            return Err(Error::InvalidDataStartToken);
        }

        for byte in out.iter_mut() {
            *byte = self.read_byte()?;
        }

        // CRC16 trailer, not verified
        self.read_byte()?;
        self.read_byte()?;

        self.write_byte(FILLER)
    }

    fn wait_while_busy(&mut self) -> Result<()> {
        let ticks = self.clock.ticks_from_millis(self.config.write_busy_timeout_ms);
        let deadline = Deadline::after(&self.clock, ticks, self.config.wiggle_room);
        while self.read_byte()? == 0x00 {
            if deadline.is_expired(&self.clock) {
                return Err(Error::BusyTimeout);
            }
        }
        Ok(())
    }

    /// Run `op` with chip select asserted, releasing it whatever the outcome.
    fn selected<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.bus.assert_select();
        let result = op(self);
        self.bus.release_select();
        result
    }
}

impl<S: SpiBus, C: Clock> BlockDevice for SdCard<S, C> {
    fn read_sector(&mut self, sector: u32, buf: &mut Sector) -> Result<()> {
        let card = self.card.ok_or(Error::NotInitialized)?;
        log::trace!("sd: read sector {}", sector);
        self.selected(|sd| {
            sd.send_command(Command::ReadSingleBlock, card.addressing.argument(sector))?;
            sd.read_data_block(buf)
        })
    }

    fn write_sector(&mut self, sector: u32, buf: &Sector) -> Result<()> {
        let card = self.card.ok_or(Error::NotInitialized)?;
        log::trace!("sd: write sector {}", sector);
        self.selected(|sd| {
            sd.send_command(Command::WriteBlock, card.addressing.argument(sector))?;
            let r1 = sd.wait_for_byte()?;
            if r1 != R1_READY {
                log::warn!("sd: invalid response {:#04x} {:?}", r1, R1Status::from_bits_retain(r1));
                return Err(Error::InvalidResponse);
            }

            sd.write_byte(FILLER)?;
            sd.write_byte(DATA_START_TOKEN)?;
            for &byte in buf.iter() {
                sd.write_byte(byte)?;
            }
            // Dummy CRC
            sd.write_byte(FILLER)?;
            sd.write_byte(FILLER)?;

            let response = sd.wait_for_byte()?;
            if response & DATA_RESPONSE_MASK != DATA_ACCEPTED {
                log::warn!("sd: data response {:#04x} for sector {}", response, sector);
                return Err(Error::WriteRejected);
            }
            sd.wait_while_busy()?;
            sd.write_byte(FILLER)
        })
    }
}

/// A response error in the handshake means the card is not speaking the
/// version 2 protocol we expect.
fn init_error(e: Error) -> Error {
    match e {
        Error::InvalidResponse => Error::InvalidInit,
        other => other,
    }
}

/// Decode the card capacity in sectors from a CSD register.
pub fn capacity_from_csd(csd: &[u8; 16]) -> Option<u64> {
    match csd[0] >> 6 {
        // CSD version 1.0 (standard capacity)
        0 => {
            let read_bl_len = (csd[5] & 0x0F) as u32;
            let c_size = (((csd[6] & 0x03) as u64) << 10) | ((csd[7] as u64) << 2) | (csd[8] >> 6) as u64;
            let c_size_mult = (((csd[9] & 0x03) << 1) | (csd[10] >> 7)) as u32;
            let bytes = (c_size + 1) << (c_size_mult + 2 + read_bl_len);
            Some(bytes / SECTOR_SIZE as u64)
        }
        // CSD version 2.0 (high/extended capacity): 512 KiB units
        1 => {
            let c_size = (((csd[7] & 0x3F) as u64) << 16) | ((csd[8] as u64) << 8) | csd[9] as u64;
            Some((c_size + 1) * 1024)
        }
        _ => None,
    }
}
