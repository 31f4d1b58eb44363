//! Host-side driver for flex peripherals reached through a Bus Pirate.
//!
//! The layers stack bottom-up: [`serial`] moves bytes, [`bridge`] negotiates
//! the adapter into binary I2C mode and frames bus primitives, [`device`]
//! speaks the peripheral's paged register protocol on top. [`runner`] and
//! [`programs`] are what the `flexbridge` binary runs.

pub mod bridge;
pub mod config;
pub mod device;
pub mod logging;
pub mod mock;
pub mod programs;
pub mod runner;
pub mod serial;

pub use bridge::{BridgeError, BridgeSession, I2cBridge};
pub use config::BridgeConfig;
pub use device::{DeviceError, RegisterDevice};
pub use logging::LogConfig;
pub use serial::{SerialError, SerialInterface};
