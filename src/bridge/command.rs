//! Single-byte bridge commands.
//!
//! Every command the adapter understands is a variant here, and [`BridgeCommand::encode`]
//! is the only place that knows the opcode layout.

use serde::{Deserialize, Serialize};

use super::{BridgeError, Result};

/// Largest payload a single bulk transfer may carry.
pub const MAX_BULK_LEN: usize = 16;

/// Ok flag returned by configuration and framing commands.
pub const RESPONSE_OK: u8 = 0x01;
/// Per-byte echo of a bulk transfer when the target did not acknowledge.
pub const RESPONSE_NACK: u8 = 0x01;

pub const BINARY_MODE_ACK: &[u8; 5] = b"BBIO1";
pub const I2C_MODE_ACK: &[u8; 4] = b"I2C1";

/// Peripheral configuration flags sent with `0x40 | bits`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinConfig {
    pub power: bool,
    pub pullups: bool,
    pub aux: bool,
    pub chip_select: bool,
}

impl PinConfig {
    pub const POWER: u8 = 0x8;
    pub const PULLUPS: u8 = 0x4;
    pub const AUX: u8 = 0x2;
    pub const CS: u8 = 0x1;

    /// Power and pull-ups on, which is what an I2C target on the adapter needs.
    pub fn powered() -> Self {
        Self {
            power: true,
            pullups: true,
            ..Self::default()
        }
    }

    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.power {
            bits |= Self::POWER;
        }
        if self.pullups {
            bits |= Self::PULLUPS;
        }
        if self.aux {
            bits |= Self::AUX;
        }
        if self.chip_select {
            bits |= Self::CS;
        }
        bits
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            power: bits & Self::POWER != 0,
            pullups: bits & Self::PULLUPS != 0,
            aux: bits & Self::AUX != 0,
            chip_select: bits & Self::CS != 0,
        }
    }
}

/// Raw binary-mode pin bits for `0x80 | mask`.
pub struct BbioPins;

impl BbioPins {
    pub const MOSI: u8 = 0x01;
    pub const CLK: u8 = 0x02;
    pub const MISO: u8 = 0x04;
    pub const CS: u8 = 0x08;
    pub const AUX: u8 = 0x10;
    pub const PULLUP: u8 = 0x20;
    pub const POWER: u8 = 0x40;
    pub const MASK: u8 = 0x7F;
}

/// I2C clock selection sent with `0x60 | level`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum I2cSpeed {
    Khz5,
    Khz50,
    Khz100,
    #[default]
    Khz400,
}

impl I2cSpeed {
    pub fn level(self) -> u8 {
        match self {
            I2cSpeed::Khz5 => 0,
            I2cSpeed::Khz50 => 1,
            I2cSpeed::Khz100 => 2,
            I2cSpeed::Khz400 => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeCommand {
    /// Probe byte; also drops back to binary mode from any submode.
    ResetToBinary,
    /// Binary mode only.
    EnterI2c,
    /// Binary mode only: restart the adapter firmware.
    HardReset,
    StartBit,
    StopBit,
    ReadByte,
    Ack,
    Nack,
    /// Bulk write header for `len` payload bytes (1..=16).
    BulkWrite { len: usize },
    ConfigurePins(PinConfig),
    SetSpeed(I2cSpeed),
    SetPins(u8),
}

impl BridgeCommand {
    pub fn encode(&self) -> Result<u8> {
        let byte = match *self {
            BridgeCommand::ResetToBinary => 0x00,
            BridgeCommand::EnterI2c => 0x02,
            BridgeCommand::HardReset => 0x0F,
            BridgeCommand::StartBit => 0x02,
            BridgeCommand::StopBit => 0x03,
            BridgeCommand::ReadByte => 0x04,
            BridgeCommand::Ack => 0x06,
            BridgeCommand::Nack => 0x07,
            BridgeCommand::BulkWrite { len } => {
                if len == 0 || len > MAX_BULK_LEN {
                    return Err(BridgeError::ProtocolViolation(format!(
                        "bulk transfer of {} bytes (must be 1..={})",
                        len, MAX_BULK_LEN
                    )));
                }
                0x10 | (len as u8 - 1)
            }
            BridgeCommand::ConfigurePins(pins) => 0x40 | pins.bits(),
            BridgeCommand::SetSpeed(speed) => 0x60 | speed.level(),
            BridgeCommand::SetPins(mask) => 0x80 | (mask & BbioPins::MASK),
        };
        Ok(byte)
    }
}
