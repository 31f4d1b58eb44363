use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::command::MAX_BULK_LEN;
use crate::bridge::{I2cSpeed, PinConfig};
use crate::device::registers::FLEX_PERIPHERAL_ADDRESS;
use crate::logging::LogConfig;
use crate::serial::interface::{BAUD_RATE, DEFAULT_PORT, READ_TIMEOUT};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything needed to open a bridge session and talk to one peripheral.
///
/// Every field has a default, so a config file only lists what differs:
///
/// ```json
/// { "port": "/dev/ttyUSB1", "device_address": 80, "log": { "show_debug": true } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Deadline for every read from the adapter.
    pub read_timeout_ms: u64,
    /// Pause between writing a single-byte command and reading its answer.
    pub settle_ms: u64,
    pub pins: PinConfig,
    pub speed: I2cSpeed,
    /// Bulk transfer chunk size for register writes (1..=16).
    pub chunk_size: usize,
    /// 8-bit bus address of the peripheral (write form, read bit clear).
    pub device_address: u8,
    pub log: LogConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud_rate: BAUD_RATE,
            read_timeout_ms: READ_TIMEOUT.as_millis() as u64,
            settle_ms: 100,
            pins: PinConfig::powered(),
            speed: I2cSpeed::Khz400,
            chunk_size: MAX_BULK_LEN,
            device_address: FLEX_PERIPHERAL_ADDRESS,
            log: LogConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: BridgeConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        log::info!("Loaded bridge configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_BULK_LEN {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} outside 1..={}",
                self.chunk_size, MAX_BULK_LEN
            )));
        }
        if self.device_address == 0 || self.device_address & 1 != 0 {
            return Err(ConfigError::Invalid(format!(
                "device_address 0x{:02X} must be a non-zero write address",
                self.device_address
            )));
        }
        if self.port.is_empty() {
            return Err(ConfigError::Invalid("port must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}
