//! Laser bank over a shared serial command link
//!
//! All excitation lasers sit behind one controller that accepts Scheme-style
//! parameter commands terminated by a carriage return:
//!
//! ```text
//! (param-set! 'laser4:level 5.5)\r
//! (param-set! 'laser4:enable #t)\r
//! (param-set! 'laser4:cw #f)\r
//! ```
//!
//! The bank keeps channels in configuration order; that order defines the
//! channel index `c` of every volume acquisition.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut bank = LaserBank::from_settings(&settings, Box::new(SerialLaserLink::new(port)))?;
//! bank.channel_mut("laser488")?.set_power(12.5)?;
//! ```

use crate::config::{LaserConfig, Settings};
use crate::error::{DaqError, DaqResult};
use crate::hardware::trigger::DigitalLine;
use std::io::Write;
use tracing::debug;

/// Byte sink the laser controller listens on.
pub trait LaserLink {
    /// Send one complete command (terminator included).
    fn send(&mut self, command: &str) -> DaqResult<()>;
}

/// [`LaserLink`] over any writer, typically a serial port.
pub struct SerialLaserLink<W: Write> {
    port: W,
}

impl<W: Write> SerialLaserLink<W> {
    /// Wrap an open port
    pub fn new(port: W) -> Self {
        Self { port }
    }

    /// Recover the underlying writer
    pub fn into_inner(self) -> W {
        self.port
    }
}

impl<W: Write> LaserLink for SerialLaserLink<W> {
    fn send(&mut self, command: &str) -> DaqResult<()> {
        self.port
            .write_all(command.as_bytes())
            .and_then(|_| self.port.flush())
            .map_err(|e| DaqError::device("laser bank", e.to_string()))?;
        debug!("[laser bank] Sent command: {}", command.trim_end());
        Ok(())
    }
}

/// Open the physical laser serial port.
#[cfg(feature = "instrument_serial")]
pub fn open_serial_port(
    config: &crate::config::LaserPortConfig,
) -> DaqResult<SerialLaserLink<Box<dyn serialport::SerialPort>>> {
    let port = serialport::new(&config.path, config.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(std::time::Duration::from_millis(config.timeout_ms))
        .open()
        .map_err(|e| {
            DaqError::device(
                "laser bank",
                format!("failed to open serial port {}: {}", config.path, e),
            )
        })?;
    Ok(SerialLaserLink::new(port))
}

/// Open the physical laser serial port.
#[cfg(not(feature = "instrument_serial"))]
pub fn open_serial_port(
    _config: &crate::config::LaserPortConfig,
) -> DaqResult<SerialLaserLink<std::io::Sink>> {
    Err(DaqError::Configuration(
        "Serial support not enabled. Rebuild with --features instrument_serial".to_string(),
    ))
}

/// State of one excitation laser.
#[derive(Debug, Clone, PartialEq)]
pub struct LaserChannel {
    name: String,
    wavelength_nm: u32,
    serial_id: String,
    trigger_line: DigitalLine,
    power: f64,
    exposure_us: f64,
    max_exposure_us: f64,
    enabled: bool,
    volume_enabled: bool,
}

impl LaserChannel {
    /// Build a channel from its configuration entry.
    pub fn from_config(config: &LaserConfig) -> DaqResult<Self> {
        Ok(Self {
            name: config.name.clone(),
            wavelength_nm: config.wavelength_nm,
            serial_id: config.serial_id.clone(),
            trigger_line: DigitalLine::parse(&config.trigger_line)?,
            power: config.power,
            exposure_us: config.exposure_us,
            max_exposure_us: config.max_exposure_us,
            enabled: config.enabled,
            volume_enabled: config.volume_enabled,
        })
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Excitation wavelength in nm
    pub fn wavelength_nm(&self) -> u32 {
        self.wavelength_nm
    }

    /// Identifier used in serial commands
    pub fn serial_id(&self) -> &str {
        &self.serial_id
    }

    /// Line gating this laser in hardware-trigger mode
    pub fn trigger_line(&self) -> &DigitalLine {
        &self.trigger_line
    }

    /// Power percentage
    pub fn power(&self) -> f64 {
        self.power
    }

    /// Exposure in microseconds
    pub fn exposure_us(&self) -> f64 {
        self.exposure_us
    }

    /// Largest accepted exposure in microseconds
    pub fn max_exposure_us(&self) -> f64 {
        self.max_exposure_us
    }

    /// Enabled for emission
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Takes part in volume acquisitions
    pub fn volume_enabled(&self) -> bool {
        self.volume_enabled
    }

    fn command(&self, parameter: &str, value: &str) -> String {
        format!("(param-set! '{}:{} {})\r", self.serial_id, parameter, value)
    }
}

/// A channel borrowed together with the command link.
pub struct LaserHandle<'a> {
    channel: &'a mut LaserChannel,
    link: &'a mut dyn LaserLink,
}

impl LaserHandle<'_> {
    /// Current channel state
    pub fn channel(&self) -> &LaserChannel {
        self.channel
    }

    /// Set the power percentage.
    ///
    /// # Errors
    /// `Range` if `pct` is not a finite value within `[0, 100]`; nothing is sent.
    pub fn set_power(&mut self, pct: f64) -> DaqResult<()> {
        if !pct.is_finite() || !(0.0..=100.0).contains(&pct) {
            return Err(DaqError::range("laser power", pct, 0.0, 100.0));
        }
        let value = format!("{}", (pct * 100.0).round() / 100.0);
        self.link.send(&self.channel.command("level", &value))?;
        self.channel.power = pct;
        Ok(())
    }

    /// Set the exposure time in microseconds.
    ///
    /// Out-of-range requests are rejected rather than clamped.
    pub fn set_exposure(&mut self, exposure_us: f64) -> DaqResult<()> {
        let max = self.channel.max_exposure_us;
        if !exposure_us.is_finite() || !(0.0..=max).contains(&exposure_us) {
            return Err(DaqError::range("laser exposure (us)", exposure_us, 0.0, max));
        }
        self.channel.exposure_us = exposure_us;
        Ok(())
    }

    /// Make the laser available for emission.
    pub fn enable(&mut self) -> DaqResult<()> {
        self.link.send(&self.channel.command("enable", "#t"))?;
        self.channel.enabled = true;
        Ok(())
    }

    /// Withdraw the laser from emission.
    pub fn disable(&mut self) -> DaqResult<()> {
        self.link.send(&self.channel.command("enable", "#f"))?;
        self.channel.enabled = false;
        Ok(())
    }

    /// Start continuous-wave output.
    pub fn emission_on(&mut self) -> DaqResult<()> {
        self.link.send(&self.channel.command("cw", "#t"))
    }

    /// Stop continuous-wave output.
    pub fn emission_off(&mut self) -> DaqResult<()> {
        self.link.send(&self.channel.command("cw", "#f"))
    }

    /// Include or exclude the channel from volume acquisitions.
    pub fn set_volume_enabled(&mut self, volume_enabled: bool) {
        self.channel.volume_enabled = volume_enabled;
    }
}

/// Ordered collection of laser channels sharing one command link.
pub struct LaserBank {
    link: Box<dyn LaserLink>,
    channels: Vec<LaserChannel>,
    current: usize,
}

impl LaserBank {
    /// Build a bank from explicit channels. The first channel is the active one.
    pub fn new(link: Box<dyn LaserLink>, channels: Vec<LaserChannel>) -> DaqResult<Self> {
        if channels.is_empty() {
            return Err(DaqError::Configuration(
                "laser bank needs at least one channel".to_string(),
            ));
        }
        Ok(Self {
            link,
            channels,
            current: 0,
        })
    }

    /// Build the configured bank.
    pub fn from_settings(settings: &Settings, link: Box<dyn LaserLink>) -> DaqResult<Self> {
        let channels = settings
            .lasers
            .iter()
            .map(LaserChannel::from_config)
            .collect::<DaqResult<Vec<_>>>()?;
        Self::new(link, channels)
    }

    /// Push the configured power and enable state of every channel to the hardware.
    pub fn initialize(&mut self) -> DaqResult<()> {
        for index in 0..self.channels.len() {
            let mut handle = self.handle(index);
            let power = handle.channel().power();
            handle.set_power(power)?;
            if handle.channel().enabled() {
                handle.enable()?;
            } else {
                handle.disable()?;
            }
        }
        Ok(())
    }

    /// All channels in stable order
    pub fn channels(&self) -> &[LaserChannel] {
        &self.channels
    }

    /// Indices of volume-enabled channels, in bank order. Position in this list
    /// is the channel index `c` of the volume tensor.
    pub fn volume_channels(&self) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, ch)| ch.volume_enabled)
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of volume-enabled channels
    pub fn volume_channel_count(&self) -> usize {
        self.channels.iter().filter(|ch| ch.volume_enabled).count()
    }

    /// Index of the channel with the given name.
    pub fn index_of(&self, name: &str) -> DaqResult<usize> {
        self.channels
            .iter()
            .position(|ch| ch.name == name)
            .ok_or_else(|| DaqError::Configuration(format!("unknown laser '{name}'")))
    }

    /// Borrow a channel by name together with the command link.
    pub fn channel_mut(&mut self, name: &str) -> DaqResult<LaserHandle<'_>> {
        let index = self.index_of(name)?;
        Ok(self.handle(index))
    }

    /// Borrow a channel by index together with the command link.
    ///
    /// # Panics
    /// If `index` is out of bounds.
    pub fn handle(&mut self, index: usize) -> LaserHandle<'_> {
        LaserHandle {
            channel: &mut self.channels[index],
            link: self.link.as_mut(),
        }
    }

    /// Index of the active channel
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// The active channel
    pub fn current(&self) -> &LaserChannel {
        &self.channels[self.current]
    }

    /// Make the named channel the active one.
    pub fn select(&mut self, name: &str) -> DaqResult<()> {
        self.current = self.index_of(name)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockLaserLink;

    fn bank() -> (LaserBank, MockLaserLink) {
        let link = MockLaserLink::new();
        let bank = LaserBank::from_settings(&Settings::default(), Box::new(link.clone())).unwrap();
        (bank, link)
    }

    #[test]
    fn test_bank_keeps_configuration_order() {
        let (bank, _) = bank();
        let names: Vec<_> = bank.channels().iter().map(|c| c.name()).collect();
        assert_eq!(names, ["laser640", "laser561", "laser488", "laser405"]);
        assert_eq!(bank.channels()[3].wavelength_nm(), 405);
        assert_eq!(bank.current().name(), "laser640");
    }

    #[test]
    fn test_power_command() {
        let (mut bank, link) = bank();
        bank.channel_mut("laser640").unwrap().set_power(3.333).unwrap();
        assert_eq!(link.commands(), ["(param-set! 'laser4:level 3.33)\r"]);
        assert_eq!(bank.channels()[0].power(), 3.333);
    }

    #[test]
    fn test_power_range_is_inclusive() {
        let (mut bank, _) = bank();
        let mut laser = bank.channel_mut("laser405").unwrap();
        assert!(laser.set_power(0.0).is_ok());
        assert!(laser.set_power(100.0).is_ok());
    }

    #[test]
    fn test_invalid_power_rejected_before_sending() {
        let (mut bank, link) = bank();
        for pct in [-1.0, 150.0, f64::NAN, f64::INFINITY] {
            let err = bank.channel_mut("laser405").unwrap().set_power(pct).unwrap_err();
            assert!(matches!(err, DaqError::Range { .. }));
        }
        assert!(link.commands().is_empty());
        assert_eq!(bank.channels()[3].power(), 1.0);
    }

    #[test]
    fn test_exposure_rejected_not_clamped() {
        let (mut bank, _) = bank();
        let mut laser = bank.channel_mut("laser561").unwrap();
        assert!(laser.set_exposure(2_000_000.0).is_err());
        assert!(laser.set_exposure(-5.0).is_err());
        laser.set_exposure(5000.0).unwrap();
        assert_eq!(laser.channel().exposure_us(), 5000.0);
    }

    #[test]
    fn test_enable_disable_and_emission() {
        let (mut bank, link) = bank();
        let mut laser = bank.channel_mut("laser405").unwrap();
        laser.disable().unwrap();
        assert!(!laser.channel().enabled());
        laser.enable().unwrap();
        laser.emission_on().unwrap();
        laser.emission_off().unwrap();
        assert_eq!(
            link.commands(),
            [
                "(param-set! 'laser1:enable #f)\r",
                "(param-set! 'laser1:enable #t)\r",
                "(param-set! 'laser1:cw #t)\r",
                "(param-set! 'laser1:cw #f)\r",
            ]
        );
    }

    #[test]
    fn test_volume_channels_skip_disabled() {
        let (mut bank, _) = bank();
        bank.channel_mut("laser561").unwrap().set_volume_enabled(false);
        assert_eq!(bank.volume_channels(), vec![0, 2, 3]);
        assert_eq!(bank.volume_channel_count(), 3);
    }

    #[test]
    fn test_select_unknown_laser() {
        let (mut bank, _) = bank();
        assert!(bank.select("laser999").is_err());
        bank.select("laser488").unwrap();
        assert_eq!(bank.current_index(), 2);
    }

    #[test]
    fn test_serial_link_writes_bytes() {
        let mut link = SerialLaserLink::new(Vec::new());
        link.send("(param-set! 'laser2:cw #t)\r").unwrap();
        assert_eq!(link.into_inner(), b"(param-set! 'laser2:cw #t)\r");
    }

    #[test]
    fn test_initialize_pushes_state() {
        let (mut bank, link) = bank();
        bank.initialize().unwrap();
        let commands = link.commands();
        assert_eq!(commands.len(), 8);
        assert_eq!(commands[0], "(param-set! 'laser4:level 1)\r");
        assert_eq!(commands[1], "(param-set! 'laser4:enable #t)\r");
    }
}
