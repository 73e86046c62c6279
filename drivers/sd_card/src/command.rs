//! SPI-mode command vocabulary: command numbers, fixed CRC bytes and tokens.

use bitflags::bitflags;
use num_enum::IntoPrimitive;

/// Start bit (0) and transmission bit (1) that prefix every command byte.
pub const COMMAND_PREFIX: u8 = 0x40;

/// R1 value while the card is still initializing.
pub const R1_IDLE: u8 = 0x01;
/// R1 value of a ready card.
pub const R1_READY: u8 = 0x00;

/// Precedes every data block in either direction.
pub const DATA_START_TOKEN: u8 = 0xFE;

/// Low five bits of the data-response token for an accepted write.
pub const DATA_ACCEPTED: u8 = 0x05;
pub const DATA_RESPONSE_MASK: u8 = 0x1F;

/// Clocked out whenever the host only needs to generate clock edges.
pub const FILLER: u8 = 0xFF;

/// CMD8 argument: 2.7-3.6 V range and the `0xAA` check pattern.
pub const IF_COND_ARG: u32 = 0x0000_01AA;
/// ACMD41 argument: host supports high-capacity cards.
pub const HCS: u32 = 1 << 30;
/// OCR byte 1 bit 6: card capacity status (block addressing).
pub const OCR_CCS: u8 = 0x40;

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    GoIdleState = 0,
    SendIfCond = 8,
    SendCsd = 9,
    SendCid = 10,
    ReadSingleBlock = 17,
    WriteBlock = 24,
    SdSendOpCond = 41,
    AppCmd = 55,
    ReadOcr = 58,
}

impl Command {
    /// CRC7 byte for this command.
    ///
    /// Only CMD0 and CMD8 are checked by the card (CRC checking is off in SPI
    /// mode afterwards), so the values are fixed rather than computed.
    pub fn crc(self) -> u8 {
        match self {
            Command::GoIdleState => 0x95,
            Command::SendIfCond => 0x87,
            Command::SdSendOpCond => 0x77,
            _ => 0x01,
        }
    }

    /// First byte of the 6-byte command frame.
    pub fn frame_byte(self) -> u8 {
        COMMAND_PREFIX | u8::from(self)
    }
}

/// Response length in bytes, including the leading R1.
pub const R1_LEN: usize = 1;
pub const R3_LEN: usize = 5;
pub const R7_LEN: usize = 5;

bitflags! {
    /// Status bits of an R1 response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct R1Status: u8 {
        const IDLE = 1 << 0;
        const ERASE_RESET = 1 << 1;
        const ILLEGAL_COMMAND = 1 << 2;
        const CRC_ERROR = 1 << 3;
        const ERASE_SEQUENCE_ERROR = 1 << 4;
        const ADDRESS_ERROR = 1 << 5;
        const PARAMETER_ERROR = 1 << 6;

        // Bit 7 is always zero on a healthy bus, keep it visible when set
        const _ = !0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bytes() {
        assert_eq!(Command::GoIdleState.frame_byte(), 0x40);
        assert_eq!(Command::ReadSingleBlock.frame_byte(), 0x51);
        assert_eq!(Command::ReadOcr.frame_byte(), 0x7A);
    }

    #[test]
    fn fixed_crcs() {
        assert_eq!(Command::GoIdleState.crc(), 0x95);
        assert_eq!(Command::SendIfCond.crc(), 0x87);
        assert_eq!(Command::ReadSingleBlock.crc(), 0x01);
    }

    #[test]
    fn r1_bits() {
        let s = R1Status::from_bits_retain(0x05);
        assert!(s.contains(R1Status::IDLE | R1Status::ILLEGAL_COMMAND));
        assert!(!s.contains(R1Status::CRC_ERROR));
    }
}
