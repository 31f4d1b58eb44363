//! Bringing the adapter from whatever state it is in to I2C mode.
//!
//! On first contact the firmware may be sitting in its text menu, in binary
//! mode, or in some submode left over from a previous run. The only reliable
//! way out is: hard reset, probe with zero bytes until the binary banner
//! shows up, then ask for the I2C submode. The adapter drops the first
//! attempt often enough that every step has a retry budget.

use std::time::Duration;

use embedded_hal::delay::DelayNs;

use super::command::{BridgeCommand, BINARY_MODE_ACK, I2C_MODE_ACK};
use super::{BridgeError, BridgeMode, NegotiationStage, Result};
use crate::logging::LogConfig;
use crate::serial::{SerialError, SerialInterface};

/// Full reset + binary mode attempts before giving up.
pub const BINARY_MODE_ATTEMPTS: usize = 5;
/// Probe bytes sent per binary mode attempt.
pub const PROBE_ATTEMPTS: usize = 20;
/// How long to wait for the banner after each probe.
pub const PROBE_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const I2C_MODE_ATTEMPTS: usize = 5;
pub const I2C_MODE_SETTLE: Duration = Duration::from_millis(200);
pub const RESET_SETTLE: Duration = Duration::from_millis(100);
pub const POST_RESET_SETTLE: Duration = Duration::from_millis(250);
pub const MODE_SWITCH_SETTLE: Duration = Duration::from_millis(100);

pub struct ModeNegotiator<'a> {
    link: &'a mut SerialInterface,
    delay: &'a mut Box<dyn DelayNs + Send>,
    log: LogConfig,
    tag: String,
}

impl<'a> ModeNegotiator<'a> {
    pub fn new(link: &'a mut SerialInterface, delay: &'a mut Box<dyn DelayNs + Send>) -> Self {
        let log = link.log_config();
        let tag = format!("BusPirate({})", link.port_name());
        Self {
            link,
            delay,
            log,
            tag,
        }
    }

    fn sleep(&mut self, duration: Duration) {
        self.delay.delay_ms(delay_millis(duration));
    }

    fn send(&mut self, command: BridgeCommand) -> Result<()> {
        let byte = command.encode()?;
        self.link.send_data(&[byte])?;
        Ok(())
    }

    fn stage_error(&self, stage: NegotiationStage, cause: Option<SerialError>) -> BridgeError {
        BridgeError::Negotiation {
            port: self.link.port_name().to_string(),
            stage,
            cause,
        }
    }

    /// Kick the firmware back towards binary mode and drop whatever it said.
    pub fn soft_reset(&mut self) -> Result<()> {
        self.send(BridgeCommand::ResetToBinary)?;
        self.sleep(RESET_SETTLE);
        self.link.clear_input()?;
        Ok(())
    }

    /// Soft reset followed by a firmware restart.
    pub fn hard_reset(&mut self) -> Result<()> {
        self.soft_reset()?;
        self.send(BridgeCommand::HardReset)?;
        self.sleep(RESET_SETTLE);
        self.link.clear_input()?;
        Ok(())
    }

    /// One binary mode attempt: probe until input shows up, then check the banner.
    pub fn enter_binary_mode(&mut self) -> Result<bool> {
        self.link.clear_input()?;
        for _ in 0..PROBE_ATTEMPTS {
            self.send(BridgeCommand::ResetToBinary)?;
            self.sleep(PROBE_POLL_INTERVAL);
            if self.link.bytes_to_read()? > 0 {
                break;
            }
        }
        let response = self.link.read_available(BINARY_MODE_ACK.len())?;
        Ok(response.as_slice() == BINARY_MODE_ACK)
    }

    /// One I2C submode attempt. Only valid from binary mode.
    pub fn enter_i2c_mode(&mut self) -> Result<bool> {
        self.send(BridgeCommand::EnterI2c)?;
        self.sleep(I2C_MODE_SETTLE);
        let response = self.link.read_available(I2C_MODE_ACK.len())?;
        Ok(response.as_slice() == I2C_MODE_ACK)
    }

    /// Run the whole handshake. Returns the mode reached, which is always
    /// [`BridgeMode::I2c`] on success.
    pub fn negotiate(&mut self) -> Result<BridgeMode> {
        for attempt in 1..=BINARY_MODE_ATTEMPTS {
            self.log.debug(&self.tag, format_args!("reset (attempt {})", attempt));
            if let Err(e) = self.hard_reset() {
                return Err(self.stage_error(NegotiationStage::Reset, link_cause(e)));
            }
            self.sleep(POST_RESET_SETTLE);

            self.log.debug(&self.tag, format_args!("enter binary mode"));
            match self.enter_binary_mode() {
                Ok(true) => break,
                Ok(false) if attempt == BINARY_MODE_ATTEMPTS => {
                    return Err(self.stage_error(NegotiationStage::BinaryMode, None));
                }
                Ok(false) => {
                    self.log.debug(&self.tag, format_args!("binary mode failed, try again"));
                    if let Err(e) = self.soft_reset() {
                        return Err(self.stage_error(NegotiationStage::BinaryMode, link_cause(e)));
                    }
                }
                Err(e) => return Err(self.stage_error(NegotiationStage::BinaryMode, link_cause(e))),
            }
        }

        self.sleep(MODE_SWITCH_SETTLE);

        for attempt in 1..=I2C_MODE_ATTEMPTS {
            self.log.debug(&self.tag, format_args!("i2c mode (attempt {})", attempt));
            match self.enter_i2c_mode() {
                Ok(true) => return Ok(BridgeMode::I2c),
                Ok(false) => {
                    self.log.debug(&self.tag, format_args!("i2c mode failed, try again"));
                }
                Err(e) => return Err(self.stage_error(NegotiationStage::I2cMode, link_cause(e))),
            }
        }

        Err(self.stage_error(NegotiationStage::I2cMode, None))
    }
}

/// Whole milliseconds for `DelayNs::delay_ms`, saturating at `u32::MAX`.
pub(super) fn delay_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

pub(super) fn link_cause(error: BridgeError) -> Option<SerialError> {
    match error {
        BridgeError::Link(e) => Some(e),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{simulated_link, RecordingDelay, SimulatedBusPirate};

    #[test]
    fn clean_adapter_negotiates_first_time() {
        let sim = SimulatedBusPirate::new();
        let mut link = simulated_link(&sim);
        let mut delay: Box<dyn DelayNs + Send> = Box::new(RecordingDelay::new());

        let mode = ModeNegotiator::new(&mut link, &mut delay).negotiate().unwrap();
        assert_eq!(mode, BridgeMode::I2c);
        assert_eq!(sim.mode_name(), "i2c");
    }

    #[test]
    fn i2c_entry_retries_until_acknowledged() {
        let sim = SimulatedBusPirate::new().fail_i2c_attempts(2);
        let mut link = simulated_link(&sim);
        let mut delay: Box<dyn DelayNs + Send> = Box::new(RecordingDelay::new());

        ModeNegotiator::new(&mut link, &mut delay).negotiate().unwrap();
        let enters = sim.written().iter().filter(|b| **b == 0x02).count();
        assert_eq!(enters, 3);
    }

    #[test]
    fn i2c_entry_gives_up_after_budget() {
        let sim = SimulatedBusPirate::new().fail_i2c_attempts(I2C_MODE_ATTEMPTS);
        let mut link = simulated_link(&sim);
        let mut delay: Box<dyn DelayNs + Send> = Box::new(RecordingDelay::new());

        let err = ModeNegotiator::new(&mut link, &mut delay).negotiate().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Negotiation {
                stage: NegotiationStage::I2cMode,
                cause: None,
                ..
            }
        ));
    }

    #[test]
    fn probe_stops_once_banner_arrives() {
        let sim = SimulatedBusPirate::new();
        let mut link = simulated_link(&sim);
        let recorder = RecordingDelay::new();
        let mut delay: Box<dyn DelayNs + Send> = Box::new(recorder.clone());

        let mut negotiator = ModeNegotiator::new(&mut link, &mut delay);
        negotiator.hard_reset().unwrap();
        recorder.clear();
        assert!(negotiator.enter_binary_mode().unwrap());
        assert_eq!(recorder.sleeps(), vec![PROBE_POLL_INTERVAL]);
    }
}
