use std::time::Duration;

use super::registers::{
    BuiltinCommand, CommandOutcome, DeviceInfo, DeviceStatus, Page, CMD_PARAM0_REGISTER, CMD_REGISTER,
    MAX_COMMAND_PARAMS, STATUS_REGISTER, TX_CMD_REGISTER,
};
use super::{DeviceError, Result};
use crate::bridge::command::MAX_BULK_LEN;
use crate::bridge::{BridgeError, BridgeSession};
use crate::logging::LogConfig;

/// Status reads before a command counts as timed out.
pub const COMMAND_POLL_ATTEMPTS: usize = 10;
pub const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Register access to one peripheral on the bridge's bus.
///
/// Nothing here retries: a failed read, write or command is reported to the
/// caller as is, and the bus is left idle (every start bit gets its stop bit).
pub struct RegisterDevice<'a> {
    session: &'a mut BridgeSession,
    address: u8,
    chunk_size: usize,
    log: LogConfig,
    tag: String,
}

impl<'a> RegisterDevice<'a> {
    pub fn new(session: &'a mut BridgeSession, address: u8) -> Self {
        let log = session.log_config();
        Self {
            session,
            address,
            chunk_size: MAX_BULK_LEN,
            log,
            tag: format!("Device(0x{:02X})", address),
        }
    }

    /// Split register writes into smaller bulk transfers, for firmware with
    /// tighter receive buffers.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 || chunk_size > MAX_BULK_LEN {
            return Err(self.invalid(format!(
                "chunk size {} outside 1..={}",
                chunk_size, MAX_BULK_LEN
            )));
        }
        self.chunk_size = chunk_size;
        Ok(self)
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn session(&mut self) -> &mut BridgeSession {
        self.session
    }

    fn invalid(&self, reason: impl Into<String>) -> DeviceError {
        DeviceError::InvalidRequest {
            address: self.address,
            reason: reason.into(),
        }
    }

    fn transfer_failed(&self, reason: impl Into<String>) -> DeviceError {
        DeviceError::TransferFailed {
            address: self.address,
            reason: reason.into(),
        }
    }

    fn bus(&self) -> impl Fn(BridgeError) -> DeviceError {
        let address = self.address;
        move |source| DeviceError::Bus { address, source }
    }

    fn encode_write_buffer(&self, index: u8, data: &[u8]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(data.len() + 2);
        buffer.push(self.address);
        buffer.push(index);
        buffer.extend_from_slice(data);
        self.log.raw(&self.tag, &buffer, true);
        buffer
    }

    /// Run `body` between a start and a stop bit. The stop bit is still sent
    /// when `body` fails; the body's error wins.
    fn transaction<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let bus = self.bus();
        self.session.send_start_bit().map_err(&bus)?;
        match body(self) {
            Ok(value) => {
                self.session.send_stop_bit().map_err(&bus)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(stop) = self.session.send_stop_bit() {
                    log::warn!("[{}] stop bit after failed transfer: {}", self.tag, stop);
                }
                Err(e)
            }
        }
    }

    fn write_chunks(&mut self, buffer: &[u8]) -> Result<()> {
        let bus = self.bus();
        for chunk in buffer.chunks(self.chunk_size) {
            let response = self.session.bulk_transfer(chunk).map_err(&bus)?;
            if !response.is_success() {
                return Err(self.transfer_failed(format!(
                    "Failed to write buffer. (Size: {}; Chunk Size: {})",
                    buffer.len(),
                    chunk.len()
                )));
            }
        }
        Ok(())
    }

    /// Write `data` to consecutive registers starting at `index`.
    pub fn write(&mut self, index: u8, data: &[u8]) -> Result<()> {
        self.log.debug(
            &self.tag,
            format_args!(
                "Writing 0x{:02X} .. 0x{:02X} (length {}).",
                index,
                (index as usize + data.len()).saturating_sub(1),
                data.len()
            ),
        );

        let buffer = self.encode_write_buffer(index, data);
        self.transaction(|dev| dev.write_chunks(&buffer))
    }

    /// Read `size` consecutive registers starting at `index`.
    pub fn read(&mut self, index: u8, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Err(self.invalid("Must read 1 or more bytes."));
        }

        self.log.debug(&self.tag, format_args!("Setup Address: 0x{:02X}.", index));
        let selector = self.encode_write_buffer(index, &[]);
        self.transaction(|dev| {
            let response = dev.session.bulk_transfer(&selector).map_err(dev.bus())?;
            if !response.is_success() {
                return Err(dev.transfer_failed("Failed to write Index."));
            }
            Ok(())
        })?;

        self.log.debug(
            &self.tag,
            format_args!(
                "Reading 0x{:02X} .. 0x{:02X} (length {}).",
                index,
                (index as usize + size).saturating_sub(1),
                size
            ),
        );

        let read_address = self.address | 1;
        let data = self.transaction(|dev| {
            let bus = dev.bus();
            let response = dev.session.bulk_transfer(&[read_address]).map_err(&bus)?;
            if !response.is_success() {
                return Err(dev.transfer_failed("Read address not acknowledged."));
            }

            let mut buffer = Vec::with_capacity(size);
            for offset in 0..size {
                buffer.push(dev.session.read_byte().map_err(&bus)?);
                if offset + 1 < size {
                    dev.session.send_ack().map_err(&bus)?;
                } else {
                    dev.session.send_nack().map_err(&bus)?;
                }
            }
            Ok(buffer)
        })?;

        self.log.raw(&self.tag, &data, false);
        Ok(data)
    }

    /// Single read of the status register, no polling.
    pub fn get_status(&mut self) -> Result<DeviceStatus> {
        let data = self.read(STATUS_REGISTER, 1)?;
        Ok(DeviceStatus(data[0]))
    }

    /// Command the firmware runs after each write to the current page.
    pub fn set_tx_command(&mut self, command: u8) -> Result<()> {
        self.write(TX_CMD_REGISTER, &[command])
    }

    pub fn set_page(&mut self, page: Page) -> Result<()> {
        self.run_command(BuiltinCommand::SetPage.code(), &[page.number()], 0)
            .map(|_| ())
    }

    /// Execute `command` with up to four parameter bytes and wait for it to finish.
    ///
    /// With `result_size > 0` the result is read back from the parameter
    /// registers once the command succeeds.
    pub fn run_command(&mut self, command: u8, params: &[u8], result_size: usize) -> Result<Vec<u8>> {
        if params.len() > MAX_COMMAND_PARAMS {
            return Err(self.invalid("Command can only have 4 parameters."));
        }
        if result_size > MAX_COMMAND_PARAMS {
            return Err(self.invalid(format!(
                "Command results are limited to {} bytes.",
                MAX_COMMAND_PARAMS
            )));
        }
        self.ensure_idle()?;

        let mut buffer = Vec::with_capacity(params.len() + 1);
        buffer.push(command);
        buffer.extend_from_slice(params);
        self.write(CMD_REGISTER, &buffer)?;

        self.session.set_pending_command(self.address, Some(command));
        for _ in 0..COMMAND_POLL_ATTEMPTS {
            let status = self.get_status()?;
            match status.outcome() {
                CommandOutcome::Pending => {
                    self.log
                        .debug(&self.tag, format_args!("Command {:02X} pending...", command));
                    self.session.delay(COMMAND_POLL_INTERVAL);
                }
                CommandOutcome::Failed(code) => {
                    self.session.set_pending_command(self.address, None);
                    return Err(DeviceError::CommandFailed {
                        address: self.address,
                        command,
                        status: code,
                    });
                }
                CommandOutcome::Success => {
                    self.session.set_pending_command(self.address, None);
                    if result_size == 0 {
                        return Ok(Vec::new());
                    }
                    return self.read(CMD_PARAM0_REGISTER, result_size);
                }
            }
        }

        Err(DeviceError::CommandTimeout {
            address: self.address,
            command,
            polls: COMMAND_POLL_ATTEMPTS,
        })
    }

    /// Refuse to start a command while one that timed out is still running.
    /// The session remembers timed-out commands, so this holds across handles.
    fn ensure_idle(&mut self) -> Result<()> {
        if let Some(command) = self.session.pending_command(self.address) {
            if self.get_status()?.outcome() == CommandOutcome::Pending {
                return Err(DeviceError::CommandPending {
                    address: self.address,
                    command,
                });
            }
            self.session.set_pending_command(self.address, None);
        }
        Ok(())
    }

    /// Store a new bus address in the peripheral's EEPROM.
    /// Takes effect after the peripheral restarts.
    pub fn set_device_address(&mut self, new_address: u8) -> Result<()> {
        if new_address == 0 || new_address & 1 != 0 {
            return Err(self.invalid(format!(
                "Device address 0x{:02X} must be non-zero and even.",
                new_address
            )));
        }
        self.run_command(BuiltinCommand::SetDeviceAddress.code(), &[new_address], 0)
            .map(|_| ())
    }

    /// Restart the peripheral. The firmware never reports a status for this
    /// command, so there is nothing to poll.
    pub fn reset_device(&mut self) -> Result<()> {
        self.write(CMD_REGISTER, &[BuiltinCommand::Reset.code()])?;
        self.session.set_pending_command(self.address, None);
        Ok(())
    }

    /// Select the device info page and decode it.
    pub fn device_info(&mut self) -> Result<DeviceInfo> {
        self.set_page(Page::DeviceInfo)?;
        let data = self.read(0, DeviceInfo::SIZE)?;
        DeviceInfo::parse(&data).ok_or_else(|| self.transfer_failed("Short device info page."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{simulated_session, SimulatedBusPirate};

    #[test]
    fn read_of_zero_bytes_never_touches_the_link() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();
        let before = sim.written().len();

        let mut device = RegisterDevice::new(&mut session, 0x52);
        let err = device.read(0, 0).unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(err.address(), 0x52);
        assert_eq!(sim.written().len(), before);
    }

    #[test]
    fn write_to_missing_device_fails_and_releases_bus() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();

        let mut device = RegisterDevice::new(&mut session, 0x60);
        let err = device.write(3, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, DeviceError::TransferFailed { address: 0x60, .. }));
        // Last byte on the wire is the stop bit.
        assert_eq!(*sim.written().last().unwrap(), 0x03);
        assert!(!sim.bus_active());
    }

    #[test]
    fn write_then_read_back() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();
        let mut device = RegisterDevice::new(&mut session, 0x52);

        device.set_page(Page::Led).unwrap();
        device.write(3, &[0x10, 0x20, 0x30, 0x40]).unwrap();
        assert_eq!(device.read(3, 4).unwrap(), vec![0x10, 0x20, 0x30, 0x40]);
    }

    #[test]
    fn small_chunks_split_the_frame() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();
        let mut device = RegisterDevice::new(&mut session, 0x52).with_chunk_size(8).unwrap();
        sim.clear_written();

        device.write(3, &[0u8; 14]).unwrap();
        assert_eq!(sim.bulk_headers(), vec![0x17, 0x17]);
    }

    #[test]
    fn invalid_chunk_size_is_rejected() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();
        assert!(RegisterDevice::new(&mut session, 0x52).with_chunk_size(17).is_err());
    }

    #[test]
    fn command_result_comes_from_param_registers() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();
        let mut device = RegisterDevice::new(&mut session, 0x52);

        // Set page leaves its parameters in the parameter registers.
        let result = device.run_command(1, &[2, 0xAB], 2).unwrap();
        assert_eq!(result, vec![2, 0xAB]);
    }

    #[test]
    fn bad_page_reports_argument_error() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();
        let mut device = RegisterDevice::new(&mut session, 0x52);

        let err = device.run_command(1, &[9], 0).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::CommandFailed {
                command: 1,
                status: 0x50,
                ..
            }
        ));
    }

    #[test]
    fn odd_device_address_is_rejected_locally() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();
        let before = sim.written().len();
        let mut device = RegisterDevice::new(&mut session, 0x52);

        assert!(device.set_device_address(0x51).unwrap_err().is_protocol_violation());
        assert!(device.set_device_address(0).unwrap_err().is_protocol_violation());
        assert_eq!(sim.written().len(), before);
        device.set_device_address(0x50).unwrap();
        assert_eq!(sim.stored_address(), Some(0x50));
    }

    #[test]
    fn timed_out_command_blocks_the_next_one() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();
        let mut device = RegisterDevice::new(&mut session, 0x52);

        sim.script_status(&[0x10; COMMAND_POLL_ATTEMPTS + 1]);
        assert!(matches!(
            device.run_command(0x20, &[], 0),
            Err(DeviceError::CommandTimeout { polls: COMMAND_POLL_ATTEMPTS, .. })
        ));
        assert!(matches!(
            device.run_command(0x21, &[], 0),
            Err(DeviceError::CommandPending { command: 0x20, .. })
        ));
        // Once the status settles, commands flow again.
        device.set_page(Page::Keypad).unwrap();
    }

    #[test]
    fn pending_command_outlives_the_device_handle() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();

        sim.script_status(&[0x10; COMMAND_POLL_ATTEMPTS + 1]);
        {
            let mut device = RegisterDevice::new(&mut session, 0x52);
            assert!(matches!(
                device.run_command(0x20, &[], 0),
                Err(DeviceError::CommandTimeout { command: 0x20, .. })
            ));
        }

        sim.clear_written();
        let mut device = RegisterDevice::new(&mut session, 0x52);
        assert!(matches!(
            device.run_command(0x21, &[], 0),
            Err(DeviceError::CommandPending { command: 0x20, .. })
        ));
        // Only the status read went out; the command register was left alone.
        assert!(!sim.written().windows(3).any(|w| w == [0x52, 0xF2, 0x21]));
    }

    #[test]
    fn device_info_decodes_page_one() {
        let sim = SimulatedBusPirate::new();
        sim.prime_page(1, &[0x01, 0x00, 0x12, 0x28, 0x03, 0, 0, 0]);
        let mut session = simulated_session(&sim).unwrap();
        let mut device = RegisterDevice::new(&mut session, 0x52);

        let info = device.device_info().unwrap();
        assert_eq!(info.manufacturer, 1);
        assert_eq!(info.ident, 0x2812);
        assert_eq!(info.version, 3);
    }

    #[test]
    fn reset_device_does_not_poll() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();
        let mut device = RegisterDevice::new(&mut session, 0x52);
        sim.clear_written();

        device.reset_device().unwrap();
        assert_eq!(sim.written(), vec![0x02, 0x12, 0x52, 0xF2, 0x03, 0x03]);
    }
}
