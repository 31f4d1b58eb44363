//! Protocol log switches.
//!
//! Library code only talks to the `log` facade; installing a logger is the
//! binary's job. `LogConfig` decides which of the chatty protocol messages are
//! emitted at all, so a session can be traced without turning on debug output
//! for every other crate in the process.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Negotiation attempts, register accesses and command polling.
    pub show_debug: bool,
    /// Every byte written to and read from the adapter.
    pub show_raw: bool,
}

impl LogConfig {
    pub fn verbose() -> Self {
        Self {
            show_debug: true,
            show_raw: false,
        }
    }

    pub fn debug(&self, tag: &str, args: fmt::Arguments<'_>) {
        if self.show_debug {
            log::debug!("[{}] {}", tag, args);
        }
    }

    pub fn raw(&self, tag: &str, data: &[u8], is_write: bool) {
        if self.show_raw {
            let direction = if is_write { ">>>> WR >>>>" } else { "<<<< RD <<<<" };
            log::debug!("[{}] {} {}", tag, direction, hex_dump(data));
        }
    }
}

/// Formats bytes as `Hex{0A 1B}`.
pub fn hex_dump(data: &[u8]) -> String {
    let bytes: Vec<String> = data.iter().map(|b| hex::encode_upper([*b])).collect();
    format!("Hex{{{}}}", bytes.join(" "))
}
