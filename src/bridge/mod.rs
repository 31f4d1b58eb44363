pub mod command;
pub mod i2c;
pub mod negotiator;
pub mod session;

pub use command::{BridgeCommand, I2cSpeed, PinConfig};
pub use i2c::{I2cBridge, I2cBridgeError};
pub use session::{BridgeSession, BulkResponse};

use std::fmt;

use crate::serial::SerialError;

/// Firmware mode as far as the host knows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    Unknown,
    Binary,
    I2c,
}

/// Which step of bringing the adapter up ran out of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    Reset,
    BinaryMode,
    I2cMode,
    PinConfig,
    Speed,
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationStage::Reset => "reset",
            NegotiationStage::BinaryMode => "binary mode",
            NegotiationStage::I2cMode => "i2c mode",
            NegotiationStage::PinConfig => "power/pull-up configuration",
            NegotiationStage::Speed => "i2c frequency configuration",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("BusPirate({port}) negotiation failed at {stage}")]
    Negotiation {
        port: String,
        stage: NegotiationStage,
        #[source]
        cause: Option<SerialError>,
    },

    #[error("BusPirate({port}) transfer failed: {reason}")]
    Transfer { port: String, reason: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Link error: {0}")]
    Link(#[from] SerialError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
