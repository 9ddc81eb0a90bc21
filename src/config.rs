//! Layered configuration using Figment
//!
//! Configuration is assembled from, in increasing order of precedence:
//! 1. Built-in defaults describing the four-laser rig ([`Settings::default`])
//! 2. A TOML file (by default `config/fluor_daq.toml`)
//! 3. Environment variables prefixed with `FLUOR_DAQ_`, using `__` as the
//!    nesting separator
//!
//! # Environment Variable Overrides
//!
//! ```text
//! FLUOR_DAQ_APPLICATION__LOG_LEVEL=debug
//! FLUOR_DAQ_IMAGING__VOLUME__COUNT_MAX=10
//! FLUOR_DAQ_STAGE__BACKEND=smaract
//! ```
//!
//! # Example
//!
//! ```no_run
//! use fluor_daq::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load_from("config/fluor_daq.toml")?;
//!     println!("Lasers: {}", settings.lasers.len());
//!     Ok(())
//! }
//! ```

use crate::hardware::detector::TriggerMode;
use crate::hardware::trigger::DigitalLine;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::LoadError(Box::new(err))
    }
}

/// Top-level rig configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Laser channels, in the order that defines channel index `c`
    pub lasers: Vec<LaserConfig>,
    /// Serial link shared by all laser channels
    #[serde(default)]
    pub laser_port: LaserPortConfig,
    /// Volume and SIM imaging parameters
    pub imaging: ImagingConfig,
    /// Camera settings
    #[serde(default)]
    pub detector: DetectorConfig,
    /// Objective stage settings
    #[serde(default)]
    pub stage: StageConfig,
    /// Pattern mirror settings
    #[serde(default)]
    pub mirror: MirrorConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// One excitation laser
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaserConfig {
    /// Unique channel name (e.g. "laser640")
    pub name: String,
    /// Excitation wavelength in nanometers
    pub wavelength_nm: u32,
    /// Identifier used in serial commands (e.g. "laser4")
    pub serial_id: String,
    /// Digital line that gates this laser in hardware-trigger mode (e.g. "P03")
    pub trigger_line: String,
    /// Initial power percentage (0-100)
    #[serde(default = "default_laser_power")]
    pub power: f64,
    /// Initial exposure time in microseconds
    #[serde(default = "default_exposure_us")]
    pub exposure_us: f64,
    /// Largest exposure the channel accepts, in microseconds
    #[serde(default = "default_max_exposure_us")]
    pub max_exposure_us: f64,
    /// Whether the channel takes part in volume acquisitions
    #[serde(default = "default_true")]
    pub volume_enabled: bool,
    /// Whether the channel is enabled for emission at startup
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Laser serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaserPortConfig {
    /// Serial port (e.g. "/dev/ttyUSB0" or "COM6")
    pub path: String,
    /// Baud rate
    #[serde(default = "default_laser_baud_rate")]
    pub baud_rate: u32,
    /// Write timeout in milliseconds
    #[serde(default = "default_serial_timeout")]
    pub timeout_ms: u64,
}

/// Imaging parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagingConfig {
    /// Z-stack settings
    pub volume: VolumeConfig,
    /// Structured illumination settings
    pub sim: SimConfig,
}

/// Z-stack acquisition and stage correction parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Settle time after every stage move, in seconds
    #[serde(default = "default_time_delay")]
    pub time_delay_s: f64,
    /// Upper bound on correction moves per slice
    #[serde(default = "default_count_max")]
    pub count_max: u32,
    /// Accepted residual stage error, in nanometers
    #[serde(default = "default_threshold")]
    pub threshold_nm: f64,
    /// Line pulsed after every slice (e.g. to notify an external recorder)
    #[serde(default)]
    pub slice_interrupt_line: Option<String>,
    /// Duration of the slice interrupt pulse, in microseconds
    #[serde(default = "default_slice_interrupt_us")]
    pub slice_interrupt_us: u64,
}

/// Structured illumination parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Number of pattern angles
    #[serde(default = "default_angles")]
    pub angles: usize,
    /// Number of pattern phases
    #[serde(default = "default_phases")]
    pub phases: usize,
    /// Mirror macro that cycles the pattern during a burst
    #[serde(default = "default_sim_macro")]
    pub macro_name: String,
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Software (direct command) or hardware (external pulse) triggering
    #[serde(default)]
    pub trigger_mode: TriggerMode,
    /// Frame buffers available for one hardware-triggered burst
    #[serde(default = "default_max_num_buffer")]
    pub max_num_buffer: usize,
    /// Per-frame retrieve timeout in milliseconds
    #[serde(default = "default_detector_timeout")]
    pub timeout_ms: u64,
    /// Flip frames vertically to correct for the mount
    #[serde(default = "default_true")]
    pub flip_rows: bool,
    /// Flip frames horizontally to correct for the mount
    #[serde(default = "default_true")]
    pub flip_cols: bool,
    /// Sensor width in pixels (used by the simulated detector)
    #[serde(default = "default_frame_width")]
    pub width: usize,
    /// Sensor height in pixels (used by the simulated detector)
    #[serde(default = "default_frame_height")]
    pub height: usize,
}

/// Objective stage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageBackend {
    /// In-process simulated stage
    #[default]
    Simulated,
    /// SmarAct controller reached over TCP
    Smaract,
}

/// Objective stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Which stage implementation to construct
    #[serde(default)]
    pub backend: StageBackend,
    /// Controller IP address
    #[serde(default = "default_stage_host")]
    pub host: String,
    /// Controller TCP port
    #[serde(default = "default_stage_port")]
    pub port: u16,
    /// Socket timeout in milliseconds
    #[serde(default = "default_stage_timeout")]
    pub timeout_ms: u64,
    /// Delay before every position query, in milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Time to keep power high after a move, in milliseconds
    #[serde(default)]
    pub hold_ms: u64,
}

/// Pattern mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Position used for widefield imaging
    #[serde(default = "default_widefield_position")]
    pub widefield_position: String,
    /// Named positions and their axis coordinates
    #[serde(default = "default_mirror_positions")]
    pub positions: BTreeMap<String, Vec<f64>>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_laser_power() -> f64 {
    1.0
}

fn default_exposure_us() -> f64 {
    200.0
}

fn default_max_exposure_us() -> f64 {
    1_000_000.0
}

fn default_laser_baud_rate() -> u32 {
    115200
}

fn default_serial_timeout() -> u64 {
    1000
}

fn default_time_delay() -> f64 {
    0.1
}

fn default_count_max() -> u32 {
    5
}

fn default_threshold() -> f64 {
    100.0
}

fn default_slice_interrupt_us() -> u64 {
    100_000
}

fn default_angles() -> usize {
    3
}

fn default_phases() -> usize {
    3
}

fn default_sim_macro() -> String {
    "MAIN".to_string()
}

fn default_max_num_buffer() -> usize {
    64
}

fn default_detector_timeout() -> u64 {
    10_000
}

fn default_frame_width() -> usize {
    1920
}

fn default_frame_height() -> usize {
    1200
}

fn default_stage_host() -> String {
    "169.254.111.111".to_string()
}

fn default_stage_port() -> u16 {
    139
}

fn default_stage_timeout() -> u64 {
    5000
}

fn default_settle_ms() -> u64 {
    50
}

fn default_widefield_position() -> String {
    "WIDEFIELD".to_string()
}

fn default_mirror_positions() -> BTreeMap<String, Vec<f64>> {
    BTreeMap::from([("WIDEFIELD".to_string(), vec![0.0, 0.0])])
}

impl Default for LaserPortConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: default_laser_baud_rate(),
            timeout_ms: default_serial_timeout(),
        }
    }
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            time_delay_s: default_time_delay(),
            count_max: default_count_max(),
            threshold_nm: default_threshold(),
            slice_interrupt_line: None,
            slice_interrupt_us: default_slice_interrupt_us(),
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            angles: default_angles(),
            phases: default_phases(),
            macro_name: default_sim_macro(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            trigger_mode: TriggerMode::default(),
            max_num_buffer: default_max_num_buffer(),
            timeout_ms: default_detector_timeout(),
            flip_rows: true,
            flip_cols: true,
            width: default_frame_width(),
            height: default_frame_height(),
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            backend: StageBackend::default(),
            host: default_stage_host(),
            port: default_stage_port(),
            timeout_ms: default_stage_timeout(),
            settle_ms: default_settle_ms(),
            hold_ms: 0,
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            widefield_position: default_widefield_position(),
            positions: default_mirror_positions(),
        }
    }
}

impl LaserConfig {
    fn new(name: &str, wavelength_nm: u32, serial_id: &str, trigger_line: &str) -> Self {
        Self {
            name: name.to_string(),
            wavelength_nm,
            serial_id: serial_id.to_string(),
            trigger_line: trigger_line.to_string(),
            power: default_laser_power(),
            exposure_us: default_exposure_us(),
            max_exposure_us: default_max_exposure_us(),
            volume_enabled: true,
            enabled: true,
        }
    }
}

impl Default for Settings {
    /// The four-line rig: far-red, RFP, GFP and DAPI excitation.
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                name: "fluor_daq".to_string(),
                log_level: "info".to_string(),
            },
            lasers: vec![
                LaserConfig::new("laser640", 640, "laser4", "P03"),
                LaserConfig::new("laser561", 561, "laser3", "P02"),
                LaserConfig::new("laser488", 488, "laser2", "P01"),
                LaserConfig::new("laser405", 405, "laser1", "P00"),
            ],
            laser_port: LaserPortConfig::default(),
            imaging: ImagingConfig {
                volume: VolumeConfig::default(),
                sim: SimConfig::default(),
            },
            detector: DetectorConfig::default(),
            stage: StageConfig::default(),
            mirror: MirrorConfig::default(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Environment variable prefix for overrides
    pub const ENV_PREFIX: &'static str = "FLUOR_DAQ_";

    /// Load configuration from `config/fluor_daq.toml` and the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/fluor_daq.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error: defaults and environment overrides still
    /// apply. The merged result is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::extract(Self::figment().merge(Toml::file(path.as_ref())))
    }

    /// Load configuration from an in-memory TOML document
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::extract(Self::figment().merge(Toml::string(toml)))
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Self = figment
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Render the configuration back to TOML (used by `check-config`)
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid
    /// - At least one laser, with unique names and parseable trigger lines
    /// - Laser power within 0-100 and exposure within the channel maximum
    /// - SIM angles and phases are non-zero and one full burst fits the detector buffer
    /// - The widefield mirror position exists
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.lasers.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one laser must be configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for laser in &self.lasers {
            if !names.insert(&laser.name) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate laser name: '{}'",
                    laser.name
                )));
            }
            self.validate_laser(laser)?;
        }

        let sim = &self.imaging.sim;
        if sim.angles == 0 || sim.phases == 0 {
            return Err(ConfigError::ValidationError(format!(
                "SIM angles ({}) and phases ({}) must be > 0",
                sim.angles, sim.phases
            )));
        }

        let burst = self.volume_laser_count() * sim.angles * sim.phases;
        if burst > self.detector.max_num_buffer {
            return Err(ConfigError::ValidationError(format!(
                "SIM burst of {} frames exceeds detector max_num_buffer {}",
                burst, self.detector.max_num_buffer
            )));
        }

        let volume = &self.imaging.volume;
        if !volume.time_delay_s.is_finite() || volume.time_delay_s < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "time_delay_s must be a non-negative number, got {}",
                volume.time_delay_s
            )));
        }
        if volume.threshold_nm.is_nan() || volume.threshold_nm < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "threshold_nm must be >= 0, got {}",
                volume.threshold_nm
            )));
        }
        if let Some(line) = &volume.slice_interrupt_line {
            DigitalLine::parse(line)
                .map_err(|e| ConfigError::ValidationError(format!("slice_interrupt_line: {e}")))?;
        }

        if !self.mirror.positions.contains_key(&self.mirror.widefield_position) {
            return Err(ConfigError::ValidationError(format!(
                "Mirror position '{}' is not defined",
                self.mirror.widefield_position
            )));
        }

        Ok(())
    }

    fn validate_laser(&self, laser: &LaserConfig) -> Result<(), ConfigError> {
        if laser.serial_id.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Laser '{}': 'serial_id' cannot be empty",
                laser.name
            )));
        }
        if !(0.0..=100.0).contains(&laser.power) {
            return Err(ConfigError::ValidationError(format!(
                "Laser '{}': power {} must be within 0-100",
                laser.name, laser.power
            )));
        }
        if !(0.0..=laser.max_exposure_us).contains(&laser.exposure_us) {
            return Err(ConfigError::ValidationError(format!(
                "Laser '{}': exposure {} us exceeds maximum {} us",
                laser.name, laser.exposure_us, laser.max_exposure_us
            )));
        }
        DigitalLine::parse(&laser.trigger_line)
            .map_err(|e| ConfigError::ValidationError(format!("Laser '{}': {e}", laser.name)))?;
        Ok(())
    }

    /// Number of lasers taking part in volume acquisitions
    pub fn volume_laser_count(&self) -> usize {
        self.lasers.iter().filter(|l| l.volume_enabled).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.lasers.len(), 4);
        assert_eq!(settings.lasers[0].name, "laser640");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();

        let result = settings.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_duplicate_laser_names() {
        let mut settings = Settings::default();
        settings.lasers[1].name = "laser640".to_string();

        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate laser name"));
    }

    #[test]
    fn test_burst_must_fit_buffer() {
        let mut settings = Settings::default();
        settings.detector.max_num_buffer = 8;

        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("max_num_buffer"));
    }

    #[test]
    fn test_bad_trigger_line() {
        let mut settings = Settings::default();
        settings.lasers[2].trigger_line = "P9".to_string();

        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("laser488"));
    }

    #[test]
    fn test_power_out_of_range() {
        let mut settings = Settings::default();
        settings.lasers[0].power = 120.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_toml_overrides_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [imaging.volume]
            count_max = 9
            threshold_nm = 25.0

            [imaging.sim]
            angles = 2
            phases = 5

            [stage]
            backend = "smaract"
            "#,
        )
        .unwrap();

        assert_eq!(settings.imaging.volume.count_max, 9);
        assert_eq!(settings.imaging.sim.angles, 2);
        assert_eq!(settings.imaging.sim.phases, 5);
        assert_eq!(settings.stage.backend, StageBackend::Smaract);
        // Untouched sections keep their defaults
        assert_eq!(settings.lasers.len(), 4);
        assert_eq!(settings.detector.trigger_mode, TriggerMode::Hardware);
    }

    #[test]
    #[serial]
    fn test_toml_lasers_replace_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [[lasers]]
            name = "laser488"
            wavelength_nm = 488
            serial_id = "laser2"
            trigger_line = "P01"
            exposure_us = 5000.0
            "#,
        )
        .unwrap();

        assert_eq!(settings.lasers.len(), 1);
        assert_eq!(settings.lasers[0].exposure_us, 5000.0);
        assert!(settings.lasers[0].volume_enabled);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        std::fs::write(
            &path,
            r#"
            [application]
            name = "bench rig"
            log_level = "debug"
            "#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.application.name, "bench rig");
        assert_eq!(settings.application.log_level, "debug");
    }

    #[test]
    #[serial]
    fn test_round_trip_through_toml() {
        let rendered = Settings::default().to_toml_string().unwrap();
        let parsed = Settings::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.lasers.len(), 4);
        assert_eq!(parsed.mirror.widefield_position, "WIDEFIELD");
    }

    #[test]
    #[serial]
    fn test_env_overrides_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        std::fs::write(
            &path,
            r#"
            [imaging.volume]
            count_max = 9

            [stage]
            settle_ms = 20
            "#,
        )
        .unwrap();

        std::env::set_var("FLUOR_DAQ_IMAGING__VOLUME__COUNT_MAX", "11");
        std::env::set_var("FLUOR_DAQ_STAGE__BACKEND", "smaract");
        let loaded = Settings::load_from(&path);
        std::env::remove_var("FLUOR_DAQ_IMAGING__VOLUME__COUNT_MAX");
        std::env::remove_var("FLUOR_DAQ_STAGE__BACKEND");

        let settings = loaded.unwrap();
        assert_eq!(settings.imaging.volume.count_max, 11);
        assert_eq!(settings.stage.backend, StageBackend::Smaract);
        // Keys without an override still come from the file
        assert_eq!(settings.stage.settle_ms, 20);
    }

    #[test]
    #[serial]
    fn test_env_override_is_validated() {
        std::env::set_var("FLUOR_DAQ_APPLICATION__LOG_LEVEL", "loud");
        let loaded = Settings::from_toml_str("");
        std::env::remove_var("FLUOR_DAQ_APPLICATION__LOG_LEVEL");

        let err = loaded.unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }
}
