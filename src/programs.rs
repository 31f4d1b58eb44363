//! Exercise loops for the flex peripheral's pages.
//!
//! Each program runs until `stop` is raised or `limit` iterations have been
//! done, and returns how many iterations completed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::device::registers::LED_UPDATE_TX_COMMAND;
use crate::device::{Page, RegisterDevice, Result};
use crate::logging::hex_dump;

/// First keypad register the poller reads.
pub const KEYPAD_REGISTER: u8 = 2;
/// First LED data register; below it sits the strip's info block.
pub const LED_DATA_REGISTER: u8 = 3;
pub const LED_INFO_SIZE: usize = 16;
pub const LED_COUNT: usize = 32;
/// Brightness steps per ramp.
pub const SWEEP_LEVELS: u8 = 16;
/// Bytes per traffic write, all zero (24 dark LEDs).
pub const TRAFFIC_FRAME_LEN: usize = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Program {
    Keypad,
    LedSweep,
    Traffic,
}

impl Program {
    pub fn run(self, device: &mut RegisterDevice<'_>, stop: &AtomicBool, limit: Option<usize>) -> Result<usize> {
        match self {
            Program::Keypad => poll_keypad(device, stop, limit),
            Program::LedSweep => led_sweep(device, stop, limit),
            Program::Traffic => traffic(device, stop, limit),
        }
    }
}

fn repeat(stop: &AtomicBool, limit: Option<usize>, mut step: impl FnMut() -> Result<()>) -> Result<usize> {
    let mut done = 0;
    while !stop.load(Ordering::Relaxed) && limit.map_or(true, |max| done < max) {
        step()?;
        done += 1;
    }
    Ok(done)
}

/// One reading of the keypad's analog ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeypadSample {
    pub raw: u8,
    pub key: u8,
    pub state: u8,
    pub candidate: u8,
}

impl KeypadSample {
    pub const SIZE: usize = 4;

    pub fn parse(data: &[u8]) -> Option<Self> {
        match data {
            [raw, key, state, candidate, ..] => Some(Self {
                raw: *raw,
                key: *key,
                state: *state,
                candidate: *candidate,
            }),
            _ => None,
        }
    }

    /// ADC reading scaled to a 5 V reference.
    pub fn voltage(&self) -> f32 {
        f32::from(self.raw) / 255.0 * 5.0
    }
}

impl fmt::Display for KeypadSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Raw: {:02x} Voltage: {:.2} Key: {} State: {} Candidate: {}",
            self.raw,
            self.voltage(),
            self.key,
            self.state,
            self.candidate
        )
    }
}

pub fn poll_keypad(device: &mut RegisterDevice<'_>, stop: &AtomicBool, limit: Option<usize>) -> Result<usize> {
    device.set_page(Page::Keypad)?;
    repeat(stop, limit, || {
        let data = device.read(KEYPAD_REGISTER, KeypadSample::SIZE)?;
        if let Some(sample) = KeypadSample::parse(&data) {
            log::info!("{}", sample);
        }
        Ok(())
    })
}

/// Endless sequence of colors ramping up and down through the channel
/// combinations, as `[g, r, b]`.
///
/// Bit 0 of the pattern index picks the direction, bits 1..=3 enable red,
/// green and blue. Patterns with no channel enabled get red.
#[derive(Debug, Clone, Default)]
pub struct LedSweep {
    pattern: u32,
    step: u8,
}

impl LedSweep {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Iterator for LedSweep {
    type Item = [u8; 3];

    fn next(&mut self) -> Option<[u8; 3]> {
        if self.step == 0 && self.pattern & 0xE == 0 {
            self.pattern |= 0x2;
        }

        let level = if self.pattern & 1 != 0 {
            SWEEP_LEVELS - 1 - self.step
        } else {
            self.step
        };
        let channel = |bit: u32| if self.pattern & bit != 0 { level } else { 0 };
        let color = [channel(0x4), channel(0x2), channel(0x8)];

        self.step += 1;
        if self.step == SWEEP_LEVELS {
            self.step = 0;
            self.pattern = self.pattern.wrapping_add(1);
        }
        Some(color)
    }
}

/// Whole-strip frame with every LED set to `color`.
pub fn led_frame(color: [u8; 3]) -> Vec<u8> {
    color.repeat(LED_COUNT)
}

pub fn led_sweep(device: &mut RegisterDevice<'_>, stop: &AtomicBool, limit: Option<usize>) -> Result<usize> {
    device.set_page(Page::Led)?;
    let info = device.read(0, LED_INFO_SIZE)?;
    log::info!("Led info: {}", hex_dump(&info));

    device.set_tx_command(LED_UPDATE_TX_COMMAND)?;
    let mut colors = LedSweep::new();
    repeat(stop, limit, || {
        let color = colors.next().unwrap_or_default();
        device.write(LED_DATA_REGISTER, &led_frame(color))
    })
}

/// Keep the bus busy with LED writes, for checking the firmware under load.
pub fn traffic(device: &mut RegisterDevice<'_>, stop: &AtomicBool, limit: Option<usize>) -> Result<usize> {
    device.set_page(Page::Led)?;
    let frame = [0u8; TRAFFIC_FRAME_LEN];
    repeat(stop, limit, || device.write(LED_DATA_REGISTER, &frame))
}
