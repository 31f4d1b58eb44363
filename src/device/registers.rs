//! Register map of the flex peripheral firmware.
//!
//! The upper sixteen addresses (`0xF0..=0xFF`) always reach the control
//! block regardless of the selected page; everything below is routed to the
//! page chosen with the set-page command.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default bus address (8-bit write form).
pub const FLEX_PERIPHERAL_ADDRESS: u8 = 0x52;

pub const STATUS_REGISTER: u8 = 0xF0;
pub const TX_CMD_REGISTER: u8 = 0xF1;
pub const CMD_REGISTER: u8 = 0xF2;
pub const CMD_PARAM0_REGISTER: u8 = 0xF3;
pub const CMD_PARAM1_REGISTER: u8 = 0xF4;
pub const CMD_PARAM2_REGISTER: u8 = 0xF5;
pub const CMD_PARAM3_REGISTER: u8 = 0xF6;
pub const MAX_COMMAND_PARAMS: usize = 4;

/// Addresses at or above this go to the control block.
pub const CONTROL_BLOCK_BASE: u8 = 0xF0;

/// Commands the bus layer of the firmware handles itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BuiltinCommand {
    SetPage = 1,
    SetDeviceAddress = 2,
    Reset = 3,
}

impl BuiltinCommand {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// TX command the LED page runs after every write, pushing the frame to the strip.
pub const LED_UPDATE_TX_COMMAND: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Page {
    DeviceInfo,
    Led,
    Keypad,
}

impl Page {
    pub fn number(self) -> u8 {
        match self {
            Page::DeviceInfo => 1,
            Page::Led => 2,
            Page::Keypad => 3,
        }
    }
}

/// High-nibble outcome of the status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Success,
    Pending,
    /// Carries the masked status code (`0x20`, `0x30`, ...).
    Failed(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus(pub u8);

impl DeviceStatus {
    pub const CODE_MASK: u8 = 0xF0;
    pub const SUCCESS: u8 = 0x00;
    pub const PENDING: u8 = 0x10;
    pub const ERROR_BUSY: u8 = 0x20;
    pub const ERROR_ACCESS: u8 = 0x30;
    pub const ERROR_COMMAND: u8 = 0x40;
    pub const ERROR_ARGUMENT: u8 = 0x50;
    pub const FLAG_BUSY: u8 = 0x01;
    pub const FLAG_BUS_ERROR: u8 = 0x02;

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn code(self) -> u8 {
        self.0 & Self::CODE_MASK
    }

    pub fn outcome(self) -> CommandOutcome {
        match self.code() {
            Self::SUCCESS => CommandOutcome::Success,
            Self::PENDING => CommandOutcome::Pending,
            code => CommandOutcome::Failed(code),
        }
    }

    pub fn is_busy(self) -> bool {
        self.0 & Self::FLAG_BUSY != 0
    }

    /// Set when a command was issued while another one was still running.
    pub fn has_bus_error(self) -> bool {
        self.0 & Self::FLAG_BUS_ERROR != 0
    }

    pub fn describe(self) -> &'static str {
        match self.code() {
            Self::SUCCESS => "success",
            Self::PENDING => "in progress",
            Self::ERROR_BUSY => "busy",
            Self::ERROR_ACCESS => "access denied",
            Self::ERROR_COMMAND => "unknown command",
            Self::ERROR_ARGUMENT => "bad argument",
            _ => "unknown status",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.0, self.describe())
    }
}

/// Contents of the device info page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub manufacturer: u16,
    pub ident: u16,
    pub version: u8,
}

impl DeviceInfo {
    pub const SIZE: usize = 5;

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            manufacturer: u16::from_le_bytes([data[0], data[1]]),
            ident: u16::from_le_bytes([data[2], data[3]]),
            version: data[4],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_outcomes() {
        assert_eq!(DeviceStatus(0x00).outcome(), CommandOutcome::Success);
        assert_eq!(DeviceStatus(0x10).outcome(), CommandOutcome::Pending);
        // Low flag bits do not change the outcome.
        assert_eq!(DeviceStatus(0x11).outcome(), CommandOutcome::Pending);
        assert_eq!(DeviceStatus(0x52).outcome(), CommandOutcome::Failed(0x50));
        assert!(DeviceStatus(0x52).has_bus_error());
        assert!(DeviceStatus(0x01).is_busy());
        assert_eq!(DeviceStatus(0x40).describe(), "unknown command");
    }

    #[test]
    fn device_info_is_little_endian() {
        let info = DeviceInfo::parse(&[0x34, 0x12, 0x12, 0x28, 0x01, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(info.manufacturer, 0x1234);
        assert_eq!(info.ident, 0x2812);
        assert_eq!(info.version, 1);
        assert!(DeviceInfo::parse(&[0x00; 4]).is_none());
    }

    #[test]
    fn page_numbers() {
        assert_eq!(Page::DeviceInfo.number(), 1);
        assert_eq!(Page::Led.number(), 2);
        assert_eq!(Page::Keypad.number(), 3);
    }
}
