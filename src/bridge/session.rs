use std::collections::HashMap;
use std::time::Duration;

use embedded_hal::delay::DelayNs;

use super::command::{BridgeCommand, I2cSpeed, PinConfig, RESPONSE_NACK, RESPONSE_OK};
use super::negotiator::{delay_millis, link_cause, ModeNegotiator, I2C_MODE_ATTEMPTS};
use super::{BridgeError, BridgeMode, NegotiationStage, Result};
use crate::config::BridgeConfig;
use crate::logging::LogConfig;
use crate::serial::SerialInterface;

/// Sleeps the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(u64::from(ns)));
    }

    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

/// Answer to one bulk transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkResponse {
    /// Leading status byte was `0x01`.
    pub ok: bool,
    /// One byte per payload byte: `0x00` ACK, `0x01` NACK.
    pub acks: Vec<u8>,
}

impl BulkResponse {
    pub fn nacked(&self) -> bool {
        self.acks.iter().any(|b| *b == RESPONSE_NACK)
    }

    /// The firmware can report ok while the target NACKed a byte, so both count.
    pub fn is_success(&self) -> bool {
        self.ok && !self.nacked()
    }
}

/// One adapter, negotiated into I2C mode, owned by one caller.
pub struct BridgeSession {
    link: SerialInterface,
    delay: Box<dyn DelayNs + Send>,
    mode: BridgeMode,
    settle: Duration,
    pins: PinConfig,
    speed: I2cSpeed,
    /// Timed-out commands per device address, until the device reports idle.
    pending: HashMap<u8, u8>,
    log: LogConfig,
    tag: String,
    closed: bool,
}

impl BridgeSession {
    /// Open the configured port and negotiate I2C mode.
    pub fn open(config: &BridgeConfig) -> Result<Self> {
        let link = SerialInterface::open(&config.port, config.baud_rate, config.read_timeout(), config.log)?;
        Self::connect(link, Box::new(StdDelay), config)
    }

    /// Negotiate I2C mode over an already open link.
    pub fn connect(link: SerialInterface, delay: Box<dyn DelayNs + Send>, config: &BridgeConfig) -> Result<Self> {
        let tag = format!("BusPirate({})", link.port_name());
        let mut session = Self {
            log: link.log_config(),
            link,
            delay,
            mode: BridgeMode::Unknown,
            settle: config.settle(),
            pins: config.pins,
            speed: config.speed,
            pending: HashMap::new(),
            tag,
            closed: false,
        };

        if let Err(e) = session.bring_up() {
            session.abandon();
            return Err(e);
        }

        log::info!("Bridge on {} ready in I2C mode", session.port_name());
        Ok(session)
    }

    fn bring_up(&mut self) -> Result<()> {
        self.mode = ModeNegotiator::new(&mut self.link, &mut self.delay).negotiate()?;
        self.apply_bus_config()
    }

    fn apply_bus_config(&mut self) -> Result<()> {
        let (pins, speed) = (self.pins, self.speed);

        self.log.debug(&self.tag, format_args!("config pins & power"));
        self.configure_pins(pins)
            .map_err(|e| self.stage_failure(NegotiationStage::PinConfig, e))?;

        self.log.debug(&self.tag, format_args!("config i2c frequency"));
        self.set_speed(speed)
            .map_err(|e| self.stage_failure(NegotiationStage::Speed, e))?;
        Ok(())
    }

    fn stage_failure(&self, stage: NegotiationStage, error: BridgeError) -> BridgeError {
        BridgeError::Negotiation {
            port: self.port_name().to_string(),
            stage,
            cause: link_cause(error),
        }
    }

    pub fn mode(&self) -> BridgeMode {
        self.mode
    }

    pub fn port_name(&self) -> &str {
        self.link.port_name()
    }

    pub fn log_config(&self) -> LogConfig {
        self.log
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Sleep through the session's delay source.
    pub fn delay(&mut self, duration: Duration) {
        self.delay.delay_ms(delay_millis(duration));
    }

    /// Command that timed out on the device at `address` and may still be running.
    pub fn pending_command(&self, address: u8) -> Option<u8> {
        self.pending.get(&address).copied()
    }

    pub fn set_pending_command(&mut self, address: u8, command: Option<u8>) {
        match command {
            Some(command) => self.pending.insert(address, command),
            None => self.pending.remove(&address),
        };
    }

    fn settle(&mut self) {
        if !self.settle.is_zero() {
            let settle = self.settle;
            self.delay(settle);
        }
    }

    fn require_mode(&self, what: &str, allowed: &[BridgeMode]) -> Result<()> {
        if self.closed || !allowed.contains(&self.mode) {
            return Err(BridgeError::ProtocolViolation(format!(
                "{} not allowed while bridge is {:?}",
                what, self.mode
            )));
        }
        Ok(())
    }

    fn transfer_error(&self, reason: String) -> BridgeError {
        BridgeError::Transfer {
            port: self.port_name().to_string(),
            reason,
        }
    }

    /// Write one command byte, settle, and read its one-byte answer.
    fn exchange(&mut self, command: BridgeCommand) -> Result<u8> {
        let byte = command.encode()?;
        self.link.send_data(&[byte])?;
        self.settle();
        let response = self.link.read_exact(1)?;
        Ok(response[0])
    }

    fn simple_command(&mut self, command: BridgeCommand, what: &str) -> Result<()> {
        self.require_mode(what, &[BridgeMode::I2c])?;
        let response = self.exchange(command)?;
        if response != RESPONSE_OK {
            return Err(self.transfer_error(format!("{} answered 0x{:02X}", what, response)));
        }
        Ok(())
    }

    pub fn send_start_bit(&mut self) -> Result<()> {
        self.simple_command(BridgeCommand::StartBit, "start bit")
    }

    pub fn send_stop_bit(&mut self) -> Result<()> {
        self.simple_command(BridgeCommand::StopBit, "stop bit")
    }

    pub fn send_ack(&mut self) -> Result<()> {
        self.simple_command(BridgeCommand::Ack, "ack")
    }

    pub fn send_nack(&mut self) -> Result<()> {
        self.simple_command(BridgeCommand::Nack, "nack")
    }

    /// Clock in one byte from the bus. The caller decides ACK or NACK.
    pub fn read_byte(&mut self) -> Result<u8> {
        self.require_mode("read byte", &[BridgeMode::I2c])?;
        self.exchange(BridgeCommand::ReadByte)
    }

    pub fn configure_pins(&mut self, pins: PinConfig) -> Result<()> {
        self.simple_command(BridgeCommand::ConfigurePins(pins), "pin configuration")
    }

    pub fn set_speed(&mut self, speed: I2cSpeed) -> Result<()> {
        self.simple_command(BridgeCommand::SetSpeed(speed), "speed configuration")
    }

    /// Drop from the I2C submode to raw binary mode, e.g. for [`set_pins`](Self::set_pins).
    pub fn leave_i2c(&mut self) -> Result<()> {
        self.require_mode("leaving i2c mode", &[BridgeMode::I2c])?;
        let entered = ModeNegotiator::new(&mut self.link, &mut self.delay).enter_binary_mode()?;
        if !entered {
            return Err(self.transfer_error("no binary mode banner".to_string()));
        }
        self.mode = BridgeMode::Binary;
        Ok(())
    }

    /// Re-enter the I2C submode and restore the configured pins and speed.
    pub fn resume_i2c(&mut self) -> Result<()> {
        self.require_mode("resuming i2c mode", &[BridgeMode::Binary])?;
        for _ in 0..I2C_MODE_ATTEMPTS {
            if ModeNegotiator::new(&mut self.link, &mut self.delay).enter_i2c_mode()? {
                self.mode = BridgeMode::I2c;
                return self.apply_bus_config();
            }
        }
        Err(BridgeError::Negotiation {
            port: self.port_name().to_string(),
            stage: NegotiationStage::I2cMode,
            cause: None,
        })
    }

    /// Drive the raw pins to `mask`. Raw binary mode only; the I2C submode
    /// has no such opcode.
    pub fn set_pins(&mut self, mask: u8) -> Result<()> {
        self.require_mode("raw pin set", &[BridgeMode::Binary])?;
        let response = self.exchange(BridgeCommand::SetPins(mask))?;
        if response != RESPONSE_OK {
            return Err(self.transfer_error(format!("raw pin set answered 0x{:02X}", response)));
        }
        Ok(())
    }

    /// Write 1..=16 bytes in one firmware call.
    ///
    /// Returns the raw answer; callers must look at both the ok flag and the
    /// per-byte echo (see [`BulkResponse::is_success`]).
    pub fn bulk_transfer(&mut self, payload: &[u8]) -> Result<BulkResponse> {
        let header = BridgeCommand::BulkWrite { len: payload.len() }.encode()?;
        self.require_mode("bulk transfer", &[BridgeMode::I2c])?;

        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(header);
        frame.extend_from_slice(payload);
        self.link.send_data(&frame)?;

        let response = self.link.read_exact(payload.len() + 1)?;
        Ok(BulkResponse {
            ok: response[0] == RESPONSE_OK,
            acks: response[1..].to_vec(),
        })
    }

    /// Return the adapter to binary mode and reset it, then release the port.
    /// Failures are logged and otherwise ignored.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.log.debug(&self.tag, format_args!("Cleaning up bus pirate."));

        let result = {
            let mut negotiator = ModeNegotiator::new(&mut self.link, &mut self.delay);
            negotiator
                .enter_binary_mode()
                .and_then(|_| negotiator.hard_reset())
        };
        if let Err(e) = result {
            log::warn!("[{}] cleanup failed: {}", self.tag, e);
        }

        self.abandon();
    }

    /// Release the port without talking to the adapter.
    fn abandon(&mut self) {
        self.link.close();
        self.mode = BridgeMode::Unknown;
        self.closed = true;
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{simulated_session, simulated_session_with, RecordingDelay, SimulatedBusPirate};

    #[test]
    fn connect_configures_power_and_speed() {
        let sim = SimulatedBusPirate::new();
        let session = simulated_session(&sim).unwrap();
        assert_eq!(session.mode(), BridgeMode::I2c);

        let written = sim.written();
        // 0x40 | power | pullups, then 0x60 | 400kHz
        assert!(written.ends_with(&[0x4C, 0x63]));
    }

    #[test]
    fn oversized_bulk_is_rejected_before_writing() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();
        let before = sim.written().len();

        let err = session.bulk_transfer(&[0u8; 17]).unwrap_err();
        assert!(matches!(err, BridgeError::ProtocolViolation(_)));
        assert_eq!(sim.written().len(), before);
    }

    #[test]
    fn bulk_transfer_reports_nack_echo() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();

        session.send_start_bit().unwrap();
        // Nobody lives at 0x60.
        let response = session.bulk_transfer(&[0x60, 0x00]).unwrap();
        session.send_stop_bit().unwrap();

        assert!(response.ok);
        assert!(response.nacked());
        assert!(!response.is_success());
    }

    #[test]
    fn bulk_transfer_frames_header_and_payload() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();
        let before = sim.written().len();

        session.send_start_bit().unwrap();
        let response = session.bulk_transfer(&[0x52, 0x03, 0xAA]).unwrap();
        session.send_stop_bit().unwrap();

        assert!(response.is_success());
        assert_eq!(response.acks, vec![0x00, 0x00, 0x00]);
        assert_eq!(&sim.written()[before..], &[0x02, 0x12, 0x52, 0x03, 0xAA, 0x03]);
    }

    #[test]
    fn close_returns_adapter_to_reset_state() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();
        let before = sim.written().len();

        session.close();
        assert!(!session.is_open());
        assert_eq!(sim.mode_name(), "text");
        assert_eq!(sim.written()[before], 0x00);
        assert_eq!(*sim.written().last().unwrap(), 0x0F);

        // Closed sessions refuse bus traffic without touching the link.
        let after = sim.written().len();
        assert!(matches!(session.send_start_bit(), Err(BridgeError::ProtocolViolation(_))));
        assert_eq!(sim.written().len(), after);
    }

    #[test]
    fn dropping_an_open_session_closes_it() {
        let sim = SimulatedBusPirate::new();
        {
            let _session = simulated_session(&sim).unwrap();
            assert_eq!(sim.mode_name(), "i2c");
        }
        assert_eq!(sim.mode_name(), "text");
    }

    #[test]
    fn read_byte_returns_bus_data() {
        let sim = SimulatedBusPirate::new();
        sim.prime_page(1, &[0x5A]);
        let mut session = simulated_session(&sim).unwrap();

        session.send_start_bit().unwrap();
        assert!(session.bulk_transfer(&[0x53]).unwrap().is_success());
        assert_eq!(session.read_byte().unwrap(), 0x5A);
        session.send_nack().unwrap();
        session.send_stop_bit().unwrap();
    }

    #[test]
    fn raw_pins_need_binary_mode() {
        let sim = SimulatedBusPirate::new();
        let mut session = simulated_session(&sim).unwrap();
        let before = sim.written().len();

        assert!(matches!(session.set_pins(0x40), Err(BridgeError::ProtocolViolation(_))));
        assert_eq!(sim.written().len(), before);

        session.leave_i2c().unwrap();
        assert_eq!(session.mode(), BridgeMode::Binary);
        session.set_pins(0x40).unwrap();
        assert!(session.send_start_bit().is_err());

        session.resume_i2c().unwrap();
        assert_eq!(session.mode(), BridgeMode::I2c);
        assert!(sim.written().ends_with(&[0x02, 0x4C, 0x63]));
        session.send_start_bit().unwrap();
        session.send_stop_bit().unwrap();
    }

    #[test]
    fn long_delays_saturate() {
        let sim = SimulatedBusPirate::new();
        let delay = RecordingDelay::new();
        let config = BridgeConfig {
            port: "sim".to_string(),
            settle_ms: 0,
            ..BridgeConfig::default()
        };
        let mut session = simulated_session_with(&sim, delay.clone(), &config).unwrap();
        delay.clear();

        session.delay(Duration::from_secs(60 * 60 * 24 * 60));
        assert_eq!(delay.sleeps(), vec![Duration::from_millis(u64::from(u32::MAX))]);
    }
}
