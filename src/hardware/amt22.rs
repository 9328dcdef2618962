//! CUI AMT22 Absolute Rotary Encoder Driver
//!
//! Protocol Overview:
//! - Transport: SPI mode 0, up to 2 MHz (run at 1 MHz here)
//! - Every exchange is two bytes, MSB first
//! - Response word: `[K1][K0][13..0 position]`
//!   - K1 (bit 15) = !(b13 ^ b11 ^ b9 ^ b7 ^ b5 ^ b3 ^ b1)
//!   - K0 (bit 14) = !(b12 ^ b10 ^ b8 ^ b6 ^ b4 ^ b2 ^ b0)
//! - 12-bit variants leave the two lowest position bits at zero
//! - Commands (second byte): `0x00` read, `0x60` reset, `0x70` set zero
//!
//! Reset and set-zero take about 200 µs on the device and must only be issued while
//! the shaft is stationary.
//!
//! # Example Usage
//!
//! ```
//! use focus_daq::adapters::SpiBus;
//! use focus_daq::hardware::amt22::{Amt22, EncoderResolution};
//! use focus_daq::hardware::mock::SimulatedFocuser;
//!
//! let sim = SimulatedFocuser::new(10, 8);
//! sim.set_encoder_position(1234);
//! let bus = SpiBus::new("sim", sim);
//!
//! let encoder = Amt22::new(&bus, 10, EncoderResolution::Bits14).unwrap();
//! assert_eq!(encoder.position().unwrap(), 1234);
//! ```

use crate::adapters::{ChannelConfig, SpiBus, SpiChannel};
use crate::error::{ChecksumError, FocusResult, ParityBit};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Second command byte: read position.
pub const CMD_READ_POSITION: u8 = 0x00;
/// Second command byte: reset the encoder.
pub const CMD_RESET: u8 = 0x60;
/// Second command byte: make the current position the new zero.
pub const CMD_SET_ZERO: u8 = 0x70;

/// Bits covered by K1 (13, 11, 9, 7, 5, 3, 1).
const ODD_MASK: u16 = 0x2AAA;
/// Bits covered by K0 (12, 10, 8, 6, 4, 2, 0).
const EVEN_MASK: u16 = 0x1555;
const POSITION_MASK: u16 = 0x3FFF;

/// Host-side wait after reset / set-zero. The device needs ~200 µs.
const SETTLE_TIME: Duration = Duration::from_millis(1);

/// Position resolution of the encoder variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncoderResolution {
    /// 4096 positions per turn
    Bits12,
    /// 16384 positions per turn
    Bits14,
}

impl EncoderResolution {
    /// Map a bit count from configuration to a resolution.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            12 => Some(Self::Bits12),
            14 => Some(Self::Bits14),
            _ => None,
        }
    }

    /// Largest position this variant reports.
    pub fn max_position(self) -> u16 {
        match self {
            Self::Bits12 => 0x0FFF,
            Self::Bits14 => 0x3FFF,
        }
    }
}

/// Check both parity bits of a response.
///
/// K1 is checked first, so a word failing both reports [`ParityBit::Odd`].
pub fn validate_checksum(high: u8, low: u8) -> Result<(), ChecksumError> {
    let word = u16::from_be_bytes([high, low]);
    let k1 = word & 0x8000 != 0;
    let k0 = word & 0x4000 != 0;

    if k1 != parity_bit(word, ODD_MASK) {
        return Err(ChecksumError {
            bit: ParityBit::Odd,
            high,
            low,
        });
    }
    if k0 != parity_bit(word, EVEN_MASK) {
        return Err(ChecksumError {
            bit: ParityBit::Even,
            high,
            low,
        });
    }
    Ok(())
}

/// Validate a response and extract the position for the given resolution.
pub fn decode_position(
    high: u8,
    low: u8,
    resolution: EncoderResolution,
) -> Result<u16, ChecksumError> {
    validate_checksum(high, low)?;
    let position = u16::from_be_bytes([high, low]) & POSITION_MASK;
    Ok(match resolution {
        EncoderResolution::Bits14 => position,
        EncoderResolution::Bits12 => position >> 2,
    })
}

/// Build the response word an encoder would send for a 14-bit `position`.
pub fn encode_response(position: u16) -> u16 {
    let data = position & POSITION_MASK;
    let k1 = u16::from(parity_bit(data, ODD_MASK));
    let k0 = u16::from(parity_bit(data, EVEN_MASK));
    data | (k1 << 15) | (k0 << 14)
}

/// Expected value of a parity bit: the inverted XOR of the covered bits.
fn parity_bit(word: u16, mask: u16) -> bool {
    (word & mask).count_ones() % 2 == 0
}

/// AMT22 encoder on one chip select of a shared bus.
#[derive(Debug)]
pub struct Amt22 {
    channel: SpiChannel,
    resolution: EncoderResolution,
}

impl Amt22 {
    /// Open the encoder with the standard AMT22 bus settings.
    ///
    /// # Arguments
    /// * `bus` - Shared bus the encoder is wired to
    /// * `chip_select` - Chip-select line of the encoder
    /// * `resolution` - 12- or 14-bit variant
    pub fn new(bus: &SpiBus, chip_select: u8, resolution: EncoderResolution) -> FocusResult<Self> {
        Self::with_config(bus, ChannelConfig::amt22(chip_select), resolution)
    }

    /// Open the encoder with custom bus settings.
    pub fn with_config(
        bus: &SpiBus,
        config: ChannelConfig,
        resolution: EncoderResolution,
    ) -> FocusResult<Self> {
        let channel = bus.open_channel(config)?;
        Ok(Self {
            channel,
            resolution,
        })
    }

    /// Read the current absolute position.
    ///
    /// # Errors
    /// - `FocusError::Checksum` if either parity bit is wrong (a retry may succeed)
    /// - `FocusError::Transport` if the transfer itself failed
    pub fn position(&self) -> FocusResult<u16> {
        let mut buffer = [0x00, CMD_READ_POSITION];
        self.channel.transfer(&mut buffer)?;
        Ok(decode_position(buffer[0], buffer[1], self.resolution)?)
    }

    /// Reset the encoder. The shaft must not be moving.
    pub fn reset(&self) -> FocusResult<()> {
        self.command(CMD_RESET)
    }

    /// Make the current shaft position read as zero. The shaft must not be moving.
    pub fn set_zero_position(&self) -> FocusResult<()> {
        self.command(CMD_SET_ZERO)
    }

    fn command(&self, command: u8) -> FocusResult<()> {
        let mut buffer = [0x00, command];
        self.channel.transfer(&mut buffer)?;
        std::thread::sleep(SETTLE_TIME);
        Ok(())
    }

    /// Resolution this encoder was opened with.
    pub fn resolution(&self) -> EncoderResolution {
        self.resolution
    }

    /// Release the chip select. Idempotent.
    pub fn close(&mut self) {
        self.channel.close();
    }

    /// Whether the underlying channel is still open.
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }
}
