//! Digital trigger lines and burst programming
//!
//! Lines are addressed by short names of the form `P<port><line>` (e.g. `P03`
//! for port 0, line 3) on a digital-output card with three 8-line ports. The
//! external trigger generator that gates lasers and camera during a SIM burst is
//! programmed with a [`SequenceProgram`] before the burst starts.

use crate::error::{DaqError, DaqResult};
use crate::hardware::laser::LaserBank;
use std::fmt;
use std::str::FromStr;

/// Number of digital ports on the output card
pub const PORT_COUNT: u8 = 3;
/// Lines per port
pub const LINES_PER_PORT: u8 = 8;

/// One digital output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DigitalLine {
    port: u8,
    line: u8,
}

impl DigitalLine {
    /// Create a line, rejecting addresses the card does not have.
    pub fn new(port: u8, line: u8) -> DaqResult<Self> {
        if port >= PORT_COUNT || line >= LINES_PER_PORT {
            return Err(DaqError::Configuration(format!(
                "digital line port {port} line {line} does not exist"
            )));
        }
        Ok(Self { port, line })
    }

    /// Parse a short line name such as `P12`.
    pub fn parse(name: &str) -> DaqResult<Self> {
        let bytes = name.as_bytes();
        let invalid = || DaqError::Configuration(format!("invalid digital line name '{name}'"));

        if bytes.len() != 3 || !bytes[0].eq_ignore_ascii_case(&b'P') {
            return Err(invalid());
        }
        let digit = |b: u8| (b as char).to_digit(10).map(|d| d as u8).ok_or_else(invalid);
        Self::new(digit(bytes[1])?, digit(bytes[2])?)
    }

    /// Port index
    pub fn port(&self) -> u8 {
        self.port
    }

    /// Line index within the port
    pub fn line(&self) -> u8 {
        self.line
    }

    /// Physical channel path on the given device, e.g. `Dev1/port0/line3`.
    pub fn channel_path(&self, device: &str) -> String {
        format!("{}/port{}/line{}", device, self.port, self.line)
    }
}

impl fmt::Display for DigitalLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}{}", self.port, self.line)
    }
}

impl FromStr for DigitalLine {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Per-channel exposure table loaded into the trigger generator before a burst.
///
/// Entries follow laser bank order. Channels outside the volume carry an exposure
/// of zero so the generator skips them.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceProgram {
    exposures_us: Vec<f64>,
}

impl SequenceProgram {
    /// Build a program from explicit exposures in microseconds.
    pub fn new(exposures_us: Vec<f64>) -> Self {
        Self { exposures_us }
    }

    /// Program for every volume-enabled channel of the bank.
    pub fn from_bank(bank: &LaserBank) -> Self {
        Self::new(
            bank.channels()
                .iter()
                .map(|ch| if ch.volume_enabled() { ch.exposure_us() } else { 0.0 })
                .collect(),
        )
    }

    /// Exposure table in microseconds
    pub fn exposures_us(&self) -> &[f64] {
        &self.exposures_us
    }

    /// Wire form understood by the generator firmware: `E` followed by each
    /// exposure in whole milliseconds and a trailing space.
    pub fn encode(&self) -> String {
        let mut out = String::from("E");
        for exposure in &self.exposures_us {
            out.push_str(&format!("{} ", (exposure / 1e3) as u64));
        }
        out
    }
}
