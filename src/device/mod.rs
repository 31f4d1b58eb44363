pub mod protocol;
pub mod registers;

pub use protocol::RegisterDevice;
pub use registers::{CommandOutcome, DeviceInfo, DeviceStatus, Page};

use crate::bridge::BridgeError;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device(0x{address:02X}) bus error: {source}")]
    Bus {
        address: u8,
        #[source]
        source: BridgeError,
    },

    #[error("Device(0x{address:02X}) invalid request: {reason}")]
    InvalidRequest { address: u8, reason: String },

    #[error("Device(0x{address:02X}) transfer failed: {reason}")]
    TransferFailed { address: u8, reason: String },

    #[error("Device(0x{address:02X}) command 0x{command:02X} finished with status 0x{status:02X}")]
    CommandFailed { address: u8, command: u8, status: u8 },

    #[error("Device(0x{address:02X}) command 0x{command:02X} timed out after {polls} polls")]
    CommandTimeout {
        address: u8,
        command: u8,
        polls: usize,
    },

    #[error("Device(0x{address:02X}) command 0x{command:02X} is still pending")]
    CommandPending { address: u8, command: u8 },
}

impl DeviceError {
    /// Bus address of the device that raised the error.
    pub fn address(&self) -> u8 {
        match self {
            DeviceError::Bus { address, .. }
            | DeviceError::InvalidRequest { address, .. }
            | DeviceError::TransferFailed { address, .. }
            | DeviceError::CommandFailed { address, .. }
            | DeviceError::CommandTimeout { address, .. }
            | DeviceError::CommandPending { address, .. } => *address,
        }
    }

    /// Caller mistakes that were caught before anything reached the link.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            DeviceError::InvalidRequest { .. }
                | DeviceError::Bus {
                    source: BridgeError::ProtocolViolation(_),
                    ..
                }
        )
    }

    pub fn is_link_error(&self) -> bool {
        matches!(
            self,
            DeviceError::Bus {
                source: BridgeError::Link(_),
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
