use std::time::Duration;
use serialport::SerialPortType;

use super::{Result, SerialDeviceInfo, SerialError, SerialPortIO};
use crate::logging::LogConfig;

pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
pub const BAUD_RATE: u32 = 115200;
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Exclusive byte-stream connection to one adapter.
pub struct SerialInterface {
    io: Option<Box<dyn SerialPortIO>>,
    port_name: String,
    log: LogConfig,
}

impl SerialInterface {
    /// List USB serial ports that could host a bridge adapter.
    pub fn discover_ports() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let mut devices = Vec::new();

        for port in ports {
            if let SerialPortType::UsbPort(usb_info) = port.port_type {
                devices.push(SerialDeviceInfo {
                    port_name: port.port_name.clone(),
                    vid: usb_info.vid,
                    pid: usb_info.pid,
                    serial_number: usb_info.serial_number.clone(),
                    manufacturer: usb_info.manufacturer.clone(),
                    product: usb_info.product.clone(),
                });
            }
        }

        Ok(devices)
    }

    /// Open a real serial port.
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration, log: LogConfig) -> Result<Self> {
        log.debug(
            &format!("BusPirate({})", port_name),
            format_args!("open '{}' with baud {}", port_name, baud_rate),
        );

        let port = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|e| SerialError::ConnectionFailed {
                port: port_name.to_string(),
                reason: e.to_string(),
            })?;

        log::info!("Opened bridge adapter on {}", port_name);
        Ok(Self::from_io(port_name, Box::new(port), log))
    }

    /// Wrap an already open byte stream.
    pub fn from_io(port_name: &str, io: Box<dyn SerialPortIO>, log: LogConfig) -> Self {
        Self {
            io: Some(io),
            port_name: port_name.to_string(),
            log,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    pub fn log_config(&self) -> LogConfig {
        self.log
    }

    /// Release the port. Further I/O fails with [`SerialError::NotConnected`].
    pub fn close(&mut self) {
        if self.io.take().is_some() {
            log::info!("Closed bridge adapter on {}", self.port_name);
        }
    }

    fn io(&mut self) -> Result<&mut Box<dyn SerialPortIO>> {
        self.io.as_mut().ok_or(SerialError::NotConnected)
    }

    fn tag(&self) -> String {
        format!("BusPirate({})", self.port_name)
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.io()?.set_timeout(timeout)
    }

    /// Drop anything the firmware sent that nobody asked for.
    pub fn clear_input(&mut self) -> Result<()> {
        self.io()?.clear_input()
    }

    pub fn bytes_to_read(&mut self) -> Result<u32> {
        self.io()?.bytes_to_read()
    }

    pub fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let tag = self.tag();
        self.log.raw(&tag, data, true);
        self.io()?.write_all(data)
    }

    /// Read up to `count` bytes, stopping early when the port times out.
    pub fn read_available(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; count];
        let mut total_read = 0;

        {
            let io = self.io()?;
            while total_read < count {
                let bytes_read = io.read(&mut buffer[total_read..])?;
                if bytes_read == 0 {
                    break;
                }
                total_read += bytes_read;
            }
        }

        buffer.truncate(total_read);
        let tag = self.tag();
        self.log.raw(&tag, &buffer, false);
        Ok(buffer)
    }

    /// Read exactly `count` bytes or fail with [`SerialError::Timeout`].
    pub fn read_exact(&mut self, count: usize) -> Result<Vec<u8>> {
        let data = self.read_available(count)?;
        if data.len() < count {
            return Err(SerialError::Timeout {
                port: self.port_name.clone(),
                expected: count,
                received: data.len(),
            });
        }
        Ok(data)
    }
}
