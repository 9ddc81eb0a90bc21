//! SmarAct objective lens stage driver
//!
//! Reference: SmarAct MCS ASCII programming interface
//!
//! Protocol Overview:
//! - Format: `:<command><channel>[,<arg>...]\n` (ASCII encoded)
//! - Channel: always `0` (single axial positioner)
//! - Units: nanometers
//! - Timing: half-duplex request-response over TCP
//!
//! | Command | Meaning | Reply |
//! |---------|---------|-------|
//! | `GP0` | get position | `:P0,<nm>` |
//! | `MPR0,<nm>,<hold>` | relative move | `:E0,0` |
//! | `MPA0,<nm>,<hold>` | absolute move | `:E0,0` |
//! | `SARP0,<0/1>` | relative accumulation | `:E0,0` |
//! | `FRM0,<mark>,<hold>,1` | find reference mark | `:E0,0` |
//! | `SP0,<nm>` | set position of reference | `:E0,0` |
//!
//! A reply of `:E0,<code>` with a non-zero code reports a controller error.
//!
//! # Example Usage
//!
//! ```no_run
//! use fluor_daq::hardware::stage::SmaractStage;
//! use fluor_daq::hardware::ObjectiveStage;
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut stage = SmaractStage::connect("169.254.111.111", 139, Duration::from_secs(5))?;
//!     stage.initialise(false, 0, 1000, 0)?;
//!     stage.move_relative(-500)?;
//!     println!("Position: {} nm", stage.current_position()?);
//!     Ok(())
//! }
//! ```

use crate::config::StageConfig;
use crate::error::{DaqError, DaqResult};
use crate::hardware::capabilities::ObjectiveStage;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, info};

const DEVICE: &str = "objective stage";

/// Driver for the SmarAct axial objective positioner
///
/// Generic over the byte stream so it can run over TCP in production and over
/// an in-memory stream in tests.
pub struct SmaractStage<T: Read + Write> {
    stream: T,
    /// Delay before every position query
    settle: Duration,
    /// Time in ms to keep power high after a move
    hold_ms: u64,
    /// Bytes read past the end of the last reply
    received: Vec<u8>,
}

impl SmaractStage<TcpStream> {
    /// Connect to the controller over TCP.
    ///
    /// # Errors
    /// Returns `DeviceCommunication` if the address does not resolve or the
    /// socket cannot be opened within `timeout`.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> DaqResult<Self> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| DaqError::device(DEVICE, format!("cannot resolve {host}:{port}: {e}")))?
            .next()
            .ok_or_else(|| DaqError::device(DEVICE, format!("no address for {host}:{port}")))?;

        let stream = TcpStream::connect_timeout(&addr, timeout)
            .and_then(|s| {
                s.set_read_timeout(Some(timeout))?;
                s.set_write_timeout(Some(timeout))?;
                Ok(s)
            })
            .map_err(|e| DaqError::device(DEVICE, format!("cannot connect to {addr}: {e}")))?;

        info!("Connected to SmarAct objective stage controller at {}", addr);
        Ok(Self::new(stream))
    }

    /// Connect using the `[stage]` configuration section.
    pub fn from_config(config: &StageConfig) -> DaqResult<Self> {
        Ok(Self::connect(
            &config.host,
            config.port,
            Duration::from_millis(config.timeout_ms),
        )?
        .with_settle(Duration::from_millis(config.settle_ms))
        .with_hold(config.hold_ms))
    }
}

impl<T: Read + Write> SmaractStage<T> {
    /// Wrap an open stream with the default 50 ms settle delay.
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            settle: Duration::from_millis(50),
            hold_ms: 0,
            received: Vec::new(),
        }
    }

    /// Override the settle delay applied before position queries
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Override the post-move hold time
    pub fn with_hold(mut self, hold_ms: u64) -> Self {
        self.hold_ms = hold_ms;
        self
    }

    /// Recover the underlying stream
    pub fn into_inner(self) -> T {
        self.stream
    }

    /// Run the controller setup sequence: relative accumulation, reference mark
    /// search, then assignment of the reference position.
    pub fn initialise(
        &mut self,
        relative_accumulation: bool,
        reference_mark: i64,
        reference_hold_ms: u64,
        start_position: i64,
    ) -> DaqResult<()> {
        debug!("Initialising objective stage parameters");
        self.command(&format!("SARP0,{}", u8::from(relative_accumulation)))?;
        self.command(&format!("FRM0,{reference_mark},{reference_hold_ms},1"))?;
        self.command(&format!("SP0,{start_position}"))?;
        debug!("Objective stage initialised");
        Ok(())
    }

    /// Send a command and return the raw reply without the leading `:`.
    fn transaction(&mut self, command: &str) -> DaqResult<String> {
        let packet = format!(":{command}\n");
        self.stream
            .write_all(packet.as_bytes())
            .and_then(|_| self.stream.flush())
            .map_err(|e| DaqError::device(DEVICE, format!("write of '{command}' failed: {e}")))?;

        let mut buf = [0u8; 64];
        let end = loop {
            if let Some(end) = self.received.iter().position(|&b| b == b'\n') {
                break end;
            }
            let n = self.stream.read(&mut buf).map_err(|e| {
                DaqError::device(DEVICE, format!("read after '{command}' failed: {e}"))
            })?;
            if n == 0 {
                return Err(DaqError::device(
                    DEVICE,
                    format!("connection closed while waiting for reply to '{command}'"),
                ));
            }
            self.received.extend_from_slice(&buf[..n]);
        };

        let line: Vec<u8> = self.received.drain(..=end).collect();
        let reply = String::from_utf8_lossy(&line).trim().to_string();
        debug!("[{}] {} -> {}", DEVICE, command, reply);
        Ok(reply.trim_start_matches(':').to_string())
    }

    /// Send a command that is acknowledged with `E0,0`.
    fn command(&mut self, command: &str) -> DaqResult<()> {
        let reply = self.transaction(command)?;
        match reply.strip_prefix("E0,") {
            Some("0") => Ok(()),
            Some(code) => Err(DaqError::device(
                DEVICE,
                format!("'{command}' rejected with error code {code}"),
            )),
            None => Err(DaqError::device(
                DEVICE,
                format!("unexpected reply '{reply}' to '{command}'"),
            )),
        }
    }
}

/// Parse the position field out of a `P0,<nm>` reply.
fn parse_position(reply: &str) -> DaqResult<i64> {
    let field = reply
        .strip_prefix("P0,")
        .ok_or_else(|| DaqError::device(DEVICE, format!("unexpected position reply '{reply}'")))?;
    field
        .trim()
        .parse()
        .map_err(|_| DaqError::device(DEVICE, format!("unparseable position '{field}'")))
}

impl<T: Read + Write> ObjectiveStage for SmaractStage<T> {
    fn current_position(&mut self) -> DaqResult<i64> {
        sleep(self.settle);
        let reply = self.transaction("GP0")?;
        if reply.starts_with("E0,") {
            // Position queries only answer with E0 when the controller refuses them
            return Err(DaqError::device(DEVICE, format!("position query failed: {reply}")));
        }
        parse_position(&reply)
    }

    fn move_relative(&mut self, delta_nm: i64) -> DaqResult<()> {
        self.command(&format!("MPR0,{},{}", delta_nm, self.hold_ms))
    }

    fn move_absolute(&mut self, position_nm: i64) -> DaqResult<()> {
        self.command(&format!("MPA0,{},{}", position_nm, self.hold_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// In-memory stream that answers each request with the next scripted reply.
    struct ScriptedStream {
        replies: VecDeque<&'static str>,
        pending: Vec<u8>,
        written: Vec<u8>,
    }

    impl ScriptedStream {
        fn new(replies: &[&'static str]) -> Self {
            Self {
                replies: replies.iter().copied().collect(),
                pending: Vec::new(),
                written: Vec::new(),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            if buf.ends_with(b"\n") {
                if let Some(reply) = self.replies.pop_front() {
                    self.pending.extend_from_slice(reply.as_bytes());
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    fn stage(replies: &[&'static str]) -> SmaractStage<ScriptedStream> {
        SmaractStage::new(ScriptedStream::new(replies)).with_settle(Duration::ZERO)
    }

    fn written(stage: SmaractStage<ScriptedStream>) -> String {
        String::from_utf8(stage.into_inner().written).unwrap()
    }

    #[test]
    fn test_current_position() {
        let mut stage = stage(&[":P0,-12345\n"]);
        assert_eq!(stage.current_position().unwrap(), -12345);
        assert_eq!(written(stage), ":GP0\n");
    }

    #[test]
    fn test_moves_include_hold() {
        let mut stage = stage(&[":E0,0\n", ":E0,0\n"]).with_hold(10);
        stage.move_relative(-1000).unwrap();
        stage.move_absolute(250).unwrap();
        assert_eq!(written(stage), ":MPR0,-1000,10\n:MPA0,250,10\n");
    }

    #[test]
    fn test_controller_error_code() {
        let mut stage = stage(&[":E0,141\n"]);
        let err = stage.move_relative(5).unwrap_err();
        assert!(matches!(err, DaqError::DeviceCommunication { .. }));
        assert!(err.to_string().contains("141"));
    }

    #[test]
    fn test_closed_connection_is_fatal() {
        let mut stage = stage(&[]);
        assert!(stage.current_position().is_err());
    }

    #[test]
    fn test_garbled_position() {
        let mut stage = stage(&[":P0,abc\n"]);
        assert!(stage.current_position().is_err());
    }

    #[test]
    fn test_initialise_sequence() {
        let mut stage = stage(&[":E0,0\n", ":E0,0\n", ":E0,0\n"]);
        stage.initialise(false, 0, 1000, 0).unwrap();
        assert_eq!(written(stage), ":SARP0,0\n:FRM0,0,1000,1\n:SP0,0\n");
    }

    #[test]
    fn test_coalesced_replies_are_split_per_command() {
        let mut stage = stage(&[":E0,0\n:P0,-77\n", ""]);
        stage.move_relative(-77).unwrap();
        assert_eq!(stage.current_position().unwrap(), -77);
        assert_eq!(written(stage), ":MPR0,-77,0\n:GP0\n");
    }

    #[test]
    fn test_parse_position() {
        assert_eq!(parse_position("P0,42").unwrap(), 42);
        assert!(parse_position("X0,42").is_err());
    }
}
