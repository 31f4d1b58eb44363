pub mod interface;

pub use interface::SerialInterface;

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Connection failed on {port}: {reason}")]
    ConnectionFailed { port: String, reason: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Communication timeout on {port}: expected {expected} bytes, got {received}")]
    Timeout {
        port: String,
        expected: usize,
        received: usize,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;

/// Byte-level access to the adapter.
///
/// Implemented for real ports (`Box<dyn serialport::SerialPort>`) and for the
/// firmware simulator in [`crate::mock`].
pub trait SerialPortIO: Send {
    /// Write every byte and flush.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever arrives before the port's read timeout.
    /// Returns `Ok(0)` when the timeout expires with nothing received.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Number of bytes waiting in the input buffer.
    fn bytes_to_read(&mut self) -> Result<u32>;

    /// Discard pending input.
    fn clear_input(&mut self) -> Result<()>;

    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
}

impl SerialPortIO for Box<dyn serialport::SerialPort> {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, data)?;
        std::io::Write::flush(self)?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match std::io::Read::read(self, buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(SerialError::IoError(e)),
        }
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        Ok((**self).bytes_to_read()?)
    }

    fn clear_input(&mut self) -> Result<()> {
        Ok((**self).clear(serialport::ClearBuffer::Input)?)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        Ok((**self).set_timeout(timeout)?)
    }
}
