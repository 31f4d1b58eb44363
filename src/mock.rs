//! In-process stand-ins for the adapter and the clock.
//!
//! [`SimulatedBusPirate`] speaks the adapter's binary protocol and has a flex
//! peripheral at `0x52` on its I2C bus, so the whole stack can run without
//! hardware (`flexbridge --simulate`, and the test suite). [`RecordingDelay`]
//! replaces real sleeps and remembers what was asked for.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use embedded_hal::delay::DelayNs;

use crate::bridge::{self, BridgeSession};
use crate::config::BridgeConfig;
use crate::device::registers::{BuiltinCommand, DeviceStatus, CONTROL_BLOCK_BASE, FLEX_PERIPHERAL_ADDRESS};
use crate::logging::LogConfig;
use crate::serial::{self, SerialInterface, SerialPortIO};

const ACK: u8 = 0x00;
const NACK: u8 = 0x01;
const OK: u8 = 0x01;

const CONTROL_STATUS: usize = 0;
const CONTROL_TX_COMMAND: usize = 1;
const CONTROL_COMMAND: usize = 2;
const CONTROL_PARAMS: usize = 3;
const CONTROL_LEN: usize = 7;

const PAGE_COUNT: usize = 4;
const PAGE_SIZES: [usize; PAGE_COUNT] = [0, 8, 128, 8];
const DEFAULT_DEVICE_INFO: [u8; 8] = [0x01, 0x00, 0x12, 0x28, 0x01, 0x00, 0x00, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdapterMode {
    Text,
    Binary,
    I2c,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusPhase {
    Idle,
    AwaitAddress,
    SelectRegister,
    Writing,
    Reading,
    Ignored,
}

/// Register-file peripheral as the flex firmware implements it.
struct SimulatedTarget {
    address: u8,
    phase: BusPhase,
    page: usize,
    pages: [Vec<u8>; PAGE_COUNT],
    control: [u8; CONTROL_LEN],
    in_control: bool,
    offset: usize,
    command_written: bool,
    page_written: bool,
    status_script: VecDeque<u8>,
    stored_address: Option<u8>,
    tx_runs: usize,
}

impl SimulatedTarget {
    fn new(address: u8) -> Self {
        let mut pages: [Vec<u8>; PAGE_COUNT] = Default::default();
        for (page, size) in PAGE_SIZES.iter().enumerate() {
            pages[page] = vec![0; *size];
        }
        pages[1].copy_from_slice(&DEFAULT_DEVICE_INFO);
        Self {
            address,
            phase: BusPhase::Idle,
            page: 1,
            pages,
            control: [0; CONTROL_LEN],
            in_control: false,
            offset: 0,
            command_written: false,
            page_written: false,
            status_script: VecDeque::new(),
            stored_address: None,
            tx_runs: 0,
        }
    }

    fn region_len(&self) -> usize {
        if self.in_control {
            CONTROL_LEN
        } else {
            self.pages[self.page].len()
        }
    }

    fn start(&mut self) {
        self.phase = BusPhase::AwaitAddress;
    }

    fn stop(&mut self) {
        if self.command_written {
            self.execute_command();
        } else if self.page_written && self.control[CONTROL_TX_COMMAND] != 0 {
            self.tx_runs += 1;
        }
        self.command_written = false;
        self.page_written = false;
        self.phase = BusPhase::Idle;
    }

    fn write_byte(&mut self, byte: u8) -> u8 {
        match self.phase {
            BusPhase::AwaitAddress => {
                if byte & 0xFE != self.address {
                    self.phase = BusPhase::Ignored;
                    return NACK;
                }
                self.phase = if byte & 1 == 1 {
                    BusPhase::Reading
                } else {
                    BusPhase::SelectRegister
                };
                ACK
            }
            BusPhase::SelectRegister => {
                self.in_control = byte >= CONTROL_BLOCK_BASE;
                let offset = if self.in_control {
                    (byte - CONTROL_BLOCK_BASE) as usize
                } else {
                    byte as usize
                };
                if offset >= self.region_len() {
                    self.offset = 0;
                    self.phase = BusPhase::Ignored;
                    return NACK;
                }
                self.offset = offset;
                self.phase = BusPhase::Writing;
                ACK
            }
            BusPhase::Writing => {
                if self.in_control {
                    self.control[self.offset] = byte;
                    if self.offset == CONTROL_COMMAND {
                        self.command_written = true;
                    }
                } else {
                    let page = self.page;
                    self.pages[page][self.offset] = byte;
                    self.page_written = true;
                }
                self.offset = (self.offset + 1) % self.region_len();
                ACK
            }
            BusPhase::Idle | BusPhase::Reading | BusPhase::Ignored => NACK,
        }
    }

    fn read_byte(&mut self) -> u8 {
        if self.phase != BusPhase::Reading {
            return 0xFF;
        }
        let value = if self.in_control {
            if self.offset == CONTROL_STATUS {
                self.status_script
                    .pop_front()
                    .unwrap_or(self.control[CONTROL_STATUS])
            } else {
                self.control[self.offset]
            }
        } else {
            self.pages[self.page][self.offset]
        };
        self.offset = (self.offset + 1) % self.region_len();
        value
    }

    fn execute_command(&mut self) {
        let command = self.control[CONTROL_COMMAND];
        let param = self.control[CONTROL_PARAMS];
        self.control[CONTROL_COMMAND] = 0;

        let status = match command {
            c if c == BuiltinCommand::SetPage.code() => {
                if param > 0 && (param as usize) < PAGE_COUNT {
                    self.page = param as usize;
                    DeviceStatus::SUCCESS
                } else {
                    DeviceStatus::ERROR_ARGUMENT
                }
            }
            c if c == BuiltinCommand::SetDeviceAddress.code() => {
                if param == 0 || param & 1 != 0 {
                    DeviceStatus::ERROR_ARGUMENT
                } else {
                    self.stored_address = Some(param);
                    DeviceStatus::SUCCESS
                }
            }
            c if c == BuiltinCommand::Reset.code() => {
                self.page = 1;
                self.control = [0; CONTROL_LEN];
                DeviceStatus::SUCCESS
            }
            _ => DeviceStatus::ERROR_COMMAND,
        };
        self.control[CONTROL_STATUS] = status;
    }
}

struct AdapterState {
    mode: AdapterMode,
    written: Vec<u8>,
    bulk_headers: Vec<u8>,
    output: VecDeque<u8>,
    resets_seen: usize,
    fail_binary_attempts: usize,
    fail_i2c_attempts: usize,
    bulk_remaining: usize,
    bulk_acks: Vec<u8>,
    /// Writes left before the link breaks; `None` never breaks.
    writes_before_failure: Option<usize>,
    target: SimulatedTarget,
}

impl AdapterState {
    fn feed(&mut self, byte: u8) {
        self.written.push(byte);

        if self.bulk_remaining > 0 {
            let ack = self.target.write_byte(byte);
            self.bulk_acks.push(ack);
            self.bulk_remaining -= 1;
            if self.bulk_remaining == 0 {
                self.output.push_back(OK);
                self.output.extend(self.bulk_acks.drain(..));
            }
            return;
        }

        match self.mode {
            AdapterMode::Text => match byte {
                // The banner only comes back once the adapter has been
                // restarted more often than it is scripted to ignore us.
                0x00 if self.resets_seen > self.fail_binary_attempts => {
                    self.mode = AdapterMode::Binary;
                    self.output.extend(b"BBIO1");
                }
                0x0F => self.resets_seen += 1,
                _ => {}
            },
            AdapterMode::Binary => match byte {
                0x00 => self.output.extend(b"BBIO1"),
                0x02 => {
                    if self.fail_i2c_attempts > 0 {
                        self.fail_i2c_attempts -= 1;
                    } else {
                        self.mode = AdapterMode::I2c;
                        self.output.extend(b"I2C1");
                    }
                }
                0x0F => {
                    self.resets_seen += 1;
                    self.mode = AdapterMode::Text;
                    self.output.push_back(OK);
                    self.output.extend(b"Bus Pirate v3b\r\n");
                }
                0x80..=0xFF => self.output.push_back(OK),
                _ => {}
            },
            AdapterMode::I2c => match byte {
                0x00 => {
                    self.mode = AdapterMode::Binary;
                    self.output.extend(b"BBIO1");
                }
                0x02 => {
                    self.target.start();
                    self.output.push_back(OK);
                }
                0x03 => {
                    self.target.stop();
                    self.output.push_back(OK);
                }
                0x04 => {
                    let value = self.target.read_byte();
                    self.output.push_back(value);
                }
                0x06 | 0x07 => self.output.push_back(OK),
                0x10..=0x1F => {
                    self.bulk_headers.push(byte);
                    self.bulk_remaining = (byte & 0x0F) as usize + 1;
                    self.bulk_acks.clear();
                }
                0x40..=0x4F | 0x60..=0x63 => self.output.push_back(OK),
                _ => {}
            },
        }
    }
}

/// Simulated adapter plus peripheral. Clones share state, so a test can keep
/// a handle while the session owns another.
#[derive(Clone)]
pub struct SimulatedBusPirate {
    state: Arc<Mutex<AdapterState>>,
}

impl SimulatedBusPirate {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AdapterState {
                mode: AdapterMode::Text,
                written: Vec::new(),
                bulk_headers: Vec::new(),
                output: VecDeque::new(),
                resets_seen: 0,
                fail_binary_attempts: 0,
                fail_i2c_attempts: 0,
                bulk_remaining: 0,
                bulk_acks: Vec::new(),
                writes_before_failure: None,
                target: SimulatedTarget::new(FLEX_PERIPHERAL_ADDRESS),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ignore binary mode probes until the adapter has been reset more than `attempts` times.
    pub fn fail_binary_attempts(self, attempts: usize) -> Self {
        self.state().fail_binary_attempts = attempts;
        self
    }

    /// Ignore the next `attempts` I2C mode requests.
    pub fn fail_i2c_attempts(self, attempts: usize) -> Self {
        self.state().fail_i2c_attempts = attempts;
        self
    }

    /// Let `writes` more writes through, then fail every write with a broken
    /// pipe, as an unplugged adapter would.
    pub fn fail_writes_after(&self, writes: usize) {
        self.state().writes_before_failure = Some(writes);
    }

    /// Every byte the host has written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    pub fn clear_written(&self) {
        let mut state = self.state();
        state.written.clear();
        state.bulk_headers.clear();
    }

    /// Bulk transfer command bytes seen since the last [`clear_written`](Self::clear_written).
    pub fn bulk_headers(&self) -> Vec<u8> {
        self.state().bulk_headers.clone()
    }

    pub fn mode_name(&self) -> &'static str {
        match self.state().mode {
            AdapterMode::Text => "text",
            AdapterMode::Binary => "binary",
            AdapterMode::I2c => "i2c",
        }
    }

    /// Overwrite the start of a page.
    pub fn prime_page(&self, page: usize, data: &[u8]) {
        let mut state = self.state();
        let memory = &mut state.target.pages[page];
        let len = data.len().min(memory.len());
        memory[..len].copy_from_slice(&data[..len]);
    }

    pub fn page_contents(&self, page: usize) -> Vec<u8> {
        self.state().target.pages[page].clone()
    }

    /// Values returned by the next status register reads, before falling back
    /// to the real status.
    pub fn script_status(&self, statuses: &[u8]) {
        self.state().target.status_script.extend(statuses.iter().copied());
    }

    pub fn stored_address(&self) -> Option<u8> {
        self.state().target.stored_address
    }

    /// A start bit is outstanding.
    pub fn bus_active(&self) -> bool {
        self.state().target.phase != BusPhase::Idle
    }

    /// Writes that triggered the page's TX command.
    pub fn tx_runs(&self) -> usize {
        self.state().target.tx_runs
    }
}

impl Default for SimulatedBusPirate {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialPortIO for SimulatedBusPirate {
    fn write_all(&mut self, data: &[u8]) -> serial::Result<()> {
        let mut state = self.state();
        match state.writes_before_failure {
            Some(0) => {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "adapter unplugged").into());
            }
            Some(left) => state.writes_before_failure = Some(left - 1),
            None => {}
        }
        for byte in data {
            state.feed(*byte);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> serial::Result<usize> {
        let mut state = self.state();
        let count = buf.len().min(state.output.len());
        for (slot, byte) in buf.iter_mut().zip(state.output.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn bytes_to_read(&mut self) -> serial::Result<u32> {
        Ok(self.state().output.len() as u32)
    }

    fn clear_input(&mut self) -> serial::Result<()> {
        self.state().output.clear();
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> serial::Result<()> {
        Ok(())
    }
}

/// Remembers requested sleeps instead of sleeping. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingDelay {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingDelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.sleeps.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl DelayNs for RecordingDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.record(Duration::from_nanos(u64::from(ns)));
    }

    fn delay_ms(&mut self, ms: u32) {
        self.record(Duration::from_millis(u64::from(ms)));
    }
}

/// Session over `sim` with no settle delay and a throwaway delay recorder.
pub fn simulated_session(sim: &SimulatedBusPirate) -> bridge::Result<BridgeSession> {
    let config = BridgeConfig {
        port: "sim".to_string(),
        settle_ms: 0,
        ..BridgeConfig::default()
    };
    simulated_session_with(sim, RecordingDelay::new(), &config)
}

pub fn simulated_session_with(
    sim: &SimulatedBusPirate,
    delay: RecordingDelay,
    config: &BridgeConfig,
) -> bridge::Result<BridgeSession> {
    let link = SerialInterface::from_io(&config.port, Box::new(sim.clone()), config.log);
    BridgeSession::connect(link, Box::new(delay), config)
}

/// Simulated link for callers that only want the default, log-quiet setup.
pub fn simulated_link(sim: &SimulatedBusPirate) -> SerialInterface {
    SerialInterface::from_io("sim", Box::new(sim.clone()), LogConfig::default())
}
