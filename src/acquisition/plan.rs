//! Acquisition plans
//!
//! An [`AcquisitionPlan`] fully describes one volume acquisition: z geometry,
//! imaging mode, pattern counts, settling and correction parameters, and the
//! mirror/trigger settings the orchestrator needs. Plans are validated before
//! any hardware is touched.

use crate::config::Settings;
use crate::error::{DaqError, DaqResult};
use crate::hardware::detector::TriggerMode;
use crate::hardware::mirror::{MirrorMacro, MirrorPosition, PositionTable};
use crate::hardware::trigger::DigitalLine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How each z-slice is illuminated and captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImagingMode {
    /// One frame per channel with the mirror parked
    #[default]
    Widefield,
    /// One hardware-triggered burst of channel x angle x phase frames
    Sim,
}

impl fmt::Display for ImagingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImagingMode::Widefield => f.write_str("widefield"),
            ImagingMode::Sim => f.write_str("sim"),
        }
    }
}

/// Pulse emitted after every slice has been positioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceInterrupt {
    /// Output line
    pub line: DigitalLine,
    /// Pulse width
    pub duration: Duration,
}

/// Parameters of one volume acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionPlan {
    /// Number of z-slices (>= 1)
    pub num_z_slices: usize,
    /// Spacing between slices in nm (>= 0)
    pub z_slice_distance: i64,
    /// Widefield or structured illumination
    pub imaging_mode: ImagingMode,
    /// Pattern angles; always 1 in widefield
    pub angles: usize,
    /// Pattern phases; always 1 in widefield
    pub phases: usize,
    /// Settle time after every stage move
    pub time_delay: Duration,
    /// Maximum correction moves per slice
    pub count_max: u32,
    /// Accepted residual in nm
    pub threshold: f64,
    /// Camera trigger mode for widefield grabs
    pub trigger_mode: TriggerMode,
    /// Mirror position for widefield imaging
    pub widefield_position: MirrorPosition,
    /// Mirror macro cycling the SIM pattern
    pub sim_macro: MirrorMacro,
    /// Optional per-slice notification pulse
    pub slice_interrupt: Option<SliceInterrupt>,
}

impl AcquisitionPlan {
    /// Widefield plan with rig defaults for everything but the z geometry.
    pub fn widefield(num_z_slices: usize, z_slice_distance: i64) -> Self {
        Self {
            num_z_slices,
            z_slice_distance,
            imaging_mode: ImagingMode::Widefield,
            angles: 1,
            phases: 1,
            time_delay: Duration::from_millis(100),
            count_max: 5,
            threshold: 100.0,
            trigger_mode: TriggerMode::default(),
            widefield_position: MirrorPosition::new("WIDEFIELD", vec![0.0, 0.0]),
            sim_macro: MirrorMacro::new("MAIN"),
            slice_interrupt: None,
        }
    }

    /// Structured illumination plan.
    pub fn sim(num_z_slices: usize, z_slice_distance: i64, angles: usize, phases: usize) -> Self {
        Self {
            imaging_mode: ImagingMode::Sim,
            angles,
            phases,
            ..Self::widefield(num_z_slices, z_slice_distance)
        }
    }

    /// Build a plan from the configured imaging, detector and mirror sections.
    pub fn from_settings(
        settings: &Settings,
        num_z_slices: usize,
        z_slice_distance: i64,
        imaging_mode: ImagingMode,
    ) -> DaqResult<Self> {
        let volume = &settings.imaging.volume;
        let sim = &settings.imaging.sim;

        let mut plan = match imaging_mode {
            ImagingMode::Widefield => Self::widefield(num_z_slices, z_slice_distance),
            ImagingMode::Sim => Self::sim(num_z_slices, z_slice_distance, sim.angles, sim.phases),
        };
        plan.time_delay = Duration::try_from_secs_f64(volume.time_delay_s)
            .map_err(|_| DaqError::range("time_delay_s", volume.time_delay_s, 0.0, f64::MAX))?;
        plan.count_max = volume.count_max;
        plan.threshold = volume.threshold_nm;
        plan.trigger_mode = settings.detector.trigger_mode;
        plan.widefield_position =
            PositionTable::from_config(&settings.mirror).get(&settings.mirror.widefield_position)?;
        plan.sim_macro = MirrorMacro::new(sim.macro_name.clone());
        plan.slice_interrupt = volume
            .slice_interrupt_line
            .as_deref()
            .map(|line| {
                DigitalLine::parse(line).map(|line| SliceInterrupt {
                    line,
                    duration: Duration::from_micros(volume.slice_interrupt_us),
                })
            })
            .transpose()?;
        Ok(plan)
    }

    /// Override the settle delay.
    pub fn with_time_delay(mut self, time_delay: Duration) -> Self {
        self.time_delay = time_delay;
        self
    }

    /// Override the correction bound and threshold.
    pub fn with_correction(mut self, count_max: u32, threshold: f64) -> Self {
        self.count_max = count_max;
        self.threshold = threshold;
        self
    }

    /// Override the widefield trigger mode.
    pub fn with_trigger_mode(mut self, trigger_mode: TriggerMode) -> Self {
        self.trigger_mode = trigger_mode;
        self
    }

    /// Pulse `line` for `duration` after every slice.
    pub fn with_slice_interrupt(mut self, line: DigitalLine, duration: Duration) -> Self {
        self.slice_interrupt = Some(SliceInterrupt { line, duration });
        self
    }

    /// Check parameter ranges.
    ///
    /// # Errors
    /// `Range` for the first parameter outside its domain.
    pub fn validate(&self) -> DaqResult<()> {
        if self.num_z_slices < 1 {
            return Err(DaqError::range(
                "num_z_slices",
                self.num_z_slices as f64,
                1.0,
                f64::INFINITY,
            ));
        }
        if self.z_slice_distance < 0 {
            return Err(DaqError::range(
                "z_slice_distance",
                self.z_slice_distance as f64,
                0.0,
                f64::INFINITY,
            ));
        }
        if self.angles < 1 {
            return Err(DaqError::range("angles", self.angles as f64, 1.0, f64::INFINITY));
        }
        if self.phases < 1 {
            return Err(DaqError::range("phases", self.phases as f64, 1.0, f64::INFINITY));
        }
        if self.imaging_mode == ImagingMode::Widefield {
            if self.angles != 1 {
                return Err(DaqError::range("angles", self.angles as f64, 1.0, 1.0));
            }
            if self.phases != 1 {
                return Err(DaqError::range("phases", self.phases as f64, 1.0, 1.0));
            }
        }
        if self.threshold.is_nan() || self.threshold < 0.0 {
            return Err(DaqError::range("threshold", self.threshold, 0.0, f64::INFINITY));
        }
        Ok(())
    }

    /// Frames captured per slice for `channels` volume-enabled lasers.
    pub fn frames_per_slice(&self, channels: usize) -> usize {
        channels * self.angles * self.phases
    }

    /// Distance between the first and last slice, in nm.
    pub fn total_height(&self) -> i64 {
        (self.num_z_slices as i64 - 1) * self.z_slice_distance
    }

    /// Position expected after stepping down from slice `z`.
    pub fn target_position(&self, original_position: i64, z: usize) -> i64 {
        original_position + self.total_height() / 2 - z as i64 * self.z_slice_distance
    }
}
