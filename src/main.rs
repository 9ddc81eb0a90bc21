//! # fluor_daq
//!
//! Command-line front end for volume acquisitions.
//!
//! # Usage
//!
//! ```bash
//! # Five widefield slices 1 um apart on the simulated rig
//! fluor_daq acquire --slices 5 --distance 1000
//!
//! # SIM stack with a specific configuration file
//! fluor_daq --config rig.toml acquire --slices 3 --distance 500 --mode sim
//!
//! # Validate configuration and print the merged result
//! fluor_daq check-config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fluor_daq::acquisition::{AcquisitionPlan, ImagingMode, VolumeAcquisition};
use fluor_daq::config::{Settings, StageBackend};
use fluor_daq::hardware::laser::{open_serial_port, LaserBank, LaserLink};
use fluor_daq::hardware::mock::{
    MockDetector, MockLaserLink, MockMirror, MockStage, MockTriggerSequencer,
};
use fluor_daq::hardware::{ObjectiveStage, SmaractStage};
use fluor_daq::logging;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Fluorescence volume acquisition
#[derive(Parser, Debug)]
#[command(name = "fluor_daq")]
#[command(version)]
#[command(about = "Synchronized widefield and SIM volume acquisition")]
struct Cli {
    /// Configuration file (TOML); FLUOR_DAQ_* variables override it
    #[arg(short, long, value_name = "PATH", default_value = "config/fluor_daq.toml")]
    config: PathBuf,

    /// Log at debug level regardless of configuration
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Acquire one volume
    Acquire {
        /// Number of z-slices
        #[arg(long, default_value_t = 1)]
        slices: usize,

        /// Slice spacing in nanometers
        #[arg(long, default_value_t = 0)]
        distance: i64,

        /// Imaging mode
        #[arg(long, value_enum, default_value_t = Mode::Widefield)]
        mode: Mode,

        /// Drive the real laser controller over the configured serial port
        #[arg(long)]
        serial_lasers: bool,
    },
    /// Load and validate configuration, then print it
    CheckConfig,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Widefield,
    Sim,
}

impl From<Mode> for ImagingMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Widefield => ImagingMode::Widefield,
            Mode::Sim => ImagingMode::Sim,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    let level = if cli.verbose {
        "debug"
    } else {
        settings.application.log_level.as_str()
    };
    logging::init(level, cli.json)?;

    match cli.command {
        Command::Acquire {
            slices,
            distance,
            mode,
            serial_lasers,
        } => acquire(&settings, slices, distance, mode.into(), serial_lasers),
        Command::CheckConfig => check_config(&settings),
    }
}

fn acquire(
    settings: &Settings,
    slices: usize,
    distance: i64,
    mode: ImagingMode,
    serial_lasers: bool,
) -> Result<()> {
    let plan = AcquisitionPlan::from_settings(settings, slices, distance, mode)?;
    plan.validate()?;

    let link: Box<dyn LaserLink> = if serial_lasers {
        Box::new(open_serial_port(&settings.laser_port)?)
    } else {
        Box::new(MockLaserLink::new())
    };
    let mut lasers = LaserBank::from_settings(settings, link)?;
    lasers.initialize().context("initialising laser bank")?;

    let mut stage: Box<dyn ObjectiveStage> = match settings.stage.backend {
        StageBackend::Simulated => Box::new(
            MockStage::new().with_settle(Duration::from_millis(settings.stage.settle_ms)),
        ),
        StageBackend::Smaract => Box::new(
            SmaractStage::from_config(&settings.stage).context("connecting to objective stage")?,
        ),
    };
    let mut detector = MockDetector::from_config(&settings.detector);
    let mut mirror = MockMirror::new();
    let mut trigger = MockTriggerSequencer::new();

    info!("{} run, {} slices of {} nm", mode, slices, distance);
    let report = VolumeAcquisition::new(
        plan,
        &mut lasers,
        &mut mirror,
        stage.as_mut(),
        &mut detector,
        &mut trigger,
    )
    .run()
    .context("volume acquisition failed")?;

    println!("Volume shape (C, A, Z, P, Y, X): {:?}", report.volume.shape());
    let unconverged = report.unconverged_slices();
    println!(
        "Stage correction: {} moves total, {} of {} slices outside threshold",
        report.corrections.iter().map(|c| c.iterations).sum::<u32>(),
        unconverged.len(),
        report.corrections.len()
    );
    for z in unconverged {
        println!("  slice {}: residual {} nm", z, report.corrections[z].residual_nm);
    }

    let mip = report.volume.max_intensity_projection();
    let names = lasers.volume_channels();
    for (c, projection) in mip.outer_iter().enumerate() {
        let name = names
            .get(c)
            .map(|&i| lasers.channels()[i].name())
            .unwrap_or("?");
        let peak = projection.iter().copied().max().unwrap_or(0);
        println!("  channel {} ({}): MIP peak {}", c, name, peak);
    }
    Ok(())
}

fn check_config(settings: &Settings) -> Result<()> {
    println!("{}", settings.to_toml_string()?);
    println!(
        "Configuration OK: {} lasers ({} in volume), stage backend {:?}",
        settings.lasers.len(),
        settings.volume_laser_count(),
        settings.stage.backend
    );
    Ok(())
}
