//! Volume acquisition orchestrator
//!
//! Drives the laser bank, pattern mirror, objective stage, camera and trigger
//! outputs through one z-stack:
//!
//! ```text
//! Init -> MoveToTop -> { Capture -> CorrectPosition -> StepDown } x Z -> ReturnToOrigin -> Done
//!                                  any fatal device error -> Aborted
//! ```
//!
//! Every call blocks. Devices are borrowed for the duration of the run and the
//! stage is left wherever it was when an error aborts the acquisition.
//!
//! # Example
//!
//! ```rust,ignore
//! let plan = AcquisitionPlan::widefield(5, 1000);
//! let volume = acquire_volume(
//!     plan,
//!     &mut lasers,
//!     &mut mirror,
//!     &mut stage,
//!     &mut camera,
//!     &mut trigger,
//! )?;
//! assert_eq!(volume.shape()[2], 5);
//! ```

use crate::acquisition::demux::FrameDemultiplexer;
use crate::acquisition::plan::{AcquisitionPlan, ImagingMode};
use crate::acquisition::volume::VolumeTensor;
use crate::error::{DaqError, DaqResult};
use crate::hardware::capabilities::{Detector, MirrorController, ObjectiveStage, TriggerSequencer};
use crate::hardware::detector::{Frame, TriggerMode};
use crate::hardware::laser::LaserBank;
use crate::hardware::trigger::SequenceProgram;
use std::fmt;
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// Plan accepted, nothing moved yet
    Init,
    /// Raising the stage to the top of the volume
    MoveToTop,
    /// Capturing the frames of one slice
    Capture,
    /// Stepping down and correcting stage drift
    CorrectPosition,
    /// Slice finished, advancing to the next
    StepDown,
    /// Moving the stage back to where it started
    ReturnToOrigin,
    /// Volume complete
    Done,
    /// A fatal device error ended the run
    Aborted,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcquisitionState::Init => "INIT",
            AcquisitionState::MoveToTop => "MOVE_TO_TOP",
            AcquisitionState::Capture => "CAPTURE",
            AcquisitionState::CorrectPosition => "CORRECT_POSITION",
            AcquisitionState::StepDown => "STEP_DOWN",
            AcquisitionState::ReturnToOrigin => "RETURN_TO_ORIGIN",
            AcquisitionState::Done => "DONE",
            AcquisitionState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Bounds of the closed-loop stage correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionPolicy {
    /// Settle time after each correction move
    pub time_delay: Duration,
    /// Maximum number of correction moves
    pub count_max: u32,
    /// Accepted residual in nm
    pub threshold: f64,
}

impl CorrectionPolicy {
    /// Policy taken from a plan
    pub fn from_plan(plan: &AcquisitionPlan) -> Self {
        Self {
            time_delay: plan.time_delay,
            count_max: plan.count_max,
            threshold: plan.threshold,
        }
    }
}

/// Result of one slice's position correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrectionOutcome {
    /// Correction moves issued
    pub iterations: u32,
    /// Whether the final residual is within threshold
    pub converged: bool,
    /// `current - target` after the last readback, in nm
    pub residual_nm: i64,
}

/// Everything a finished acquisition produced.
#[derive(Debug, Clone)]
pub struct AcquisitionReport {
    /// Populated volume
    pub volume: VolumeTensor,
    /// One entry per slice, in slice order
    pub corrections: Vec<CorrectionOutcome>,
    /// Final state (always `Done` for a returned report)
    pub state: AcquisitionState,
}

impl AcquisitionReport {
    /// Slices whose correction gave up outside the threshold
    pub fn unconverged_slices(&self) -> Vec<usize> {
        self.corrections
            .iter()
            .enumerate()
            .filter(|(_, outcome)| !outcome.converged)
            .map(|(z, _)| z)
            .collect()
    }
}

/// Pull the stage onto `target` with at most `policy.count_max` relative moves.
///
/// Reads the position once, then while moves remain and `|current - target|`
/// exceeds the threshold, moves by `-(current - target)`, waits and re-reads.
/// Running out of moves is reported through the outcome and a warning, never as
/// an error.
pub fn correct_position(
    stage: &mut dyn ObjectiveStage,
    target: i64,
    policy: &CorrectionPolicy,
) -> DaqResult<CorrectionOutcome> {
    let mut difference = stage.current_position()? - target;
    let mut count = 0;

    while count < policy.count_max && difference.abs() as f64 > policy.threshold {
        stage.move_relative(-difference)?;
        sleep(policy.time_delay);
        difference = stage.current_position()? - target;
        debug!("Difference is: {} nm", difference);
        count += 1;
    }

    let converged = difference.abs() as f64 <= policy.threshold;
    if !converged {
        warn!(
            "Stage correction gave up after {} moves, {} nm from target {} nm (threshold {} nm)",
            count, difference, target, policy.threshold
        );
    }
    Ok(CorrectionOutcome {
        iterations: count,
        converged,
        residual_nm: difference,
    })
}

/// One volume acquisition over borrowed devices.
pub struct VolumeAcquisition<'a> {
    plan: AcquisitionPlan,
    lasers: &'a mut LaserBank,
    mirror: &'a mut dyn MirrorController,
    stage: &'a mut dyn ObjectiveStage,
    detector: &'a mut dyn Detector,
    trigger: &'a mut dyn TriggerSequencer,
    state: AcquisitionState,
}

impl<'a> VolumeAcquisition<'a> {
    /// Assemble an acquisition; nothing is sent to the hardware yet.
    pub fn new(
        plan: AcquisitionPlan,
        lasers: &'a mut LaserBank,
        mirror: &'a mut dyn MirrorController,
        stage: &'a mut dyn ObjectiveStage,
        detector: &'a mut dyn Detector,
        trigger: &'a mut dyn TriggerSequencer,
    ) -> Self {
        Self {
            plan,
            lasers,
            mirror,
            stage,
            detector,
            trigger,
            state: AcquisitionState::Init,
        }
    }

    /// Current state; `Aborted` after a failed [`run`](Self::run).
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// The plan being executed
    pub fn plan(&self) -> &AcquisitionPlan {
        &self.plan
    }

    /// Acquire the volume.
    ///
    /// # Errors
    /// - `Range` or `Configuration` before any device is touched
    /// - `DeviceCommunication` / `FrameAcquisition` from any device call; the
    ///   state becomes `Aborted` and the stage is not restored
    pub fn run(&mut self) -> DaqResult<AcquisitionReport> {
        self.plan.validate()?;
        let channels = self.lasers.volume_channels();
        if channels.is_empty() {
            return Err(DaqError::Configuration(
                "no laser channel is enabled for volume acquisition".to_string(),
            ));
        }
        if self.state != AcquisitionState::Init {
            return Err(DaqError::Configuration(format!(
                "acquisition already ran (state {})",
                self.state
            )));
        }

        info!(
            "Starting {} volume acquisition: {} slices, {} nm apart, {} channels",
            self.plan.imaging_mode,
            self.plan.num_z_slices,
            self.plan.z_slice_distance,
            channels.len()
        );

        match self.execute(&channels) {
            Ok(report) => {
                info!("Fluorescence volume acquisition finished");
                Ok(report)
            }
            Err(err) => {
                error!("Volume acquisition aborted during {}: {}", self.state, err);
                self.transition(AcquisitionState::Aborted);
                Err(err)
            }
        }
    }

    fn transition(&mut self, next: AcquisitionState) {
        debug!("Acquisition state {} -> {}", self.state, next);
        self.state = next;
    }

    fn execute(&mut self, channels: &[usize]) -> DaqResult<AcquisitionReport> {
        let original_position = self.stage.current_position()?;
        debug!("Objective stage original position: {} nm", original_position);

        self.transition(AcquisitionState::MoveToTop);
        self.stage.move_relative(self.plan.total_height() / 2)?;
        sleep(self.plan.time_delay);

        let (rows, cols) = self.probe_frame_shape()?;
        let mut volume = VolumeTensor::zeros(
            channels.len(),
            self.plan.angles,
            self.plan.num_z_slices,
            self.plan.phases,
            rows,
            cols,
        );
        let policy = CorrectionPolicy::from_plan(&self.plan);
        let mut corrections = Vec::with_capacity(self.plan.num_z_slices);

        for z in 0..self.plan.num_z_slices {
            self.transition(AcquisitionState::Capture);
            match self.plan.imaging_mode {
                ImagingMode::Widefield => self.capture_widefield(channels, &mut volume, z)?,
                ImagingMode::Sim => self.capture_sim(channels.len(), &mut volume, z)?,
            }

            self.transition(AcquisitionState::CorrectPosition);
            let target = self.plan.target_position(original_position, z);
            self.stage.move_relative(-self.plan.z_slice_distance)?;
            sleep(self.plan.time_delay);
            corrections.push(correct_position(&mut *self.stage, target, &policy)?);

            self.transition(AcquisitionState::StepDown);
            if let Some(interrupt) = self.plan.slice_interrupt {
                self.trigger.pulse(&interrupt.line, interrupt.duration)?;
            }
        }

        self.transition(AcquisitionState::ReturnToOrigin);
        self.stage.move_absolute(original_position)?;
        debug!("Volume acquired, stage returned to its original position");

        self.transition(AcquisitionState::Done);
        Ok(AcquisitionReport {
            volume,
            corrections,
            state: self.state,
        })
    }

    /// Grab one dummy frame with the active laser silenced to learn the frame shape.
    fn probe_frame_shape(&mut self) -> DaqResult<(usize, usize)> {
        let index = self.lasers.current_index();
        let mut laser = self.lasers.handle(index);
        let power = laser.channel().power();
        let exposure = laser.channel().exposure_us();
        laser.set_power(0.0)?;

        let grabbed = self
            .detector
            .set_exposure(exposure)
            .and_then(|_| self.detector.grab());
        let restored = self.lasers.handle(index).set_power(power);

        match (grabbed, restored) {
            (Ok(frame), Ok(())) => Ok(frame.dim()),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), restored) => {
                if let Err(restore_err) = restored {
                    warn!("Could not restore laser power after failed grab: {}", restore_err);
                }
                Err(err)
            }
        }
    }

    fn capture_widefield(
        &mut self,
        channels: &[usize],
        volume: &mut VolumeTensor,
        z: usize,
    ) -> DaqResult<()> {
        self.mirror.move_to(&self.plan.widefield_position)?;

        for (c, &index) in channels.iter().enumerate() {
            let exposure_us = self.lasers.channels()[index].exposure_us();
            self.detector.set_exposure(exposure_us)?;

            let frame = match self.plan.trigger_mode {
                TriggerMode::Software => self.grab_software(index)?,
                TriggerMode::Hardware => self.grab_hardware(index, exposure_us)?,
            };
            volume.write_frame(c, 0, z, 0, &frame)?;
            debug!(
                "Captured slice {} channel {} ({})",
                z,
                c,
                self.lasers.channels()[index].name()
            );
        }
        Ok(())
    }

    fn grab_software(&mut self, index: usize) -> DaqResult<Frame> {
        self.lasers.handle(index).emission_on()?;
        let frame = self.detector.grab();
        let off = self.lasers.handle(index).emission_off();
        let frame = frame?;
        off?;
        Ok(frame)
    }

    fn grab_hardware(&mut self, index: usize, exposure_us: f64) -> DaqResult<Frame> {
        let line = *self.lasers.channels()[index].trigger_line();
        if !exposure_us.is_finite() || exposure_us < 0.0 {
            return Err(DaqError::range("laser exposure (us)", exposure_us, 0.0, f64::INFINITY));
        }
        let duration = Duration::from_nanos((exposure_us * 1e3).round() as u64);

        let trigger = &mut *self.trigger;
        let frames = self
            .detector
            .grab_burst(1, &mut || trigger.pulse(&line, duration))?;
        frames
            .into_iter()
            .next()
            .ok_or_else(|| DaqError::FrameAcquisition("hardware trigger produced no frame".into()))
    }

    fn capture_sim(
        &mut self,
        channels: usize,
        volume: &mut VolumeTensor,
        z: usize,
    ) -> DaqResult<()> {
        let demux = FrameDemultiplexer::new(channels, self.plan.angles, self.plan.phases);
        let program = SequenceProgram::from_bank(&*self.lasers);

        let trigger = &mut *self.trigger;
        let mirror = &mut *self.mirror;
        let sim_macro = &self.plan.sim_macro;
        let burst = self.detector.grab_burst(demux.burst_len(), &mut || {
            trigger.load_program(&program)?;
            mirror.stop_all();
            mirror.start_macro(sim_macro)
        })?;

        demux.demultiplex(&burst, volume, z)?;
        debug!("Captured SIM slice {} ({} frames)", z, burst.len());
        Ok(())
    }
}

/// Acquire one volume with the given devices.
///
/// Convenience wrapper around [`VolumeAcquisition::run`] returning only the
/// tensor.
pub fn acquire_volume(
    plan: AcquisitionPlan,
    lasers: &mut LaserBank,
    mirror: &mut dyn MirrorController,
    stage: &mut dyn ObjectiveStage,
    detector: &mut dyn Detector,
    trigger: &mut dyn TriggerSequencer,
) -> DaqResult<VolumeTensor> {
    VolumeAcquisition::new(plan, lasers, mirror, stage, detector, trigger)
        .run()
        .map(|report| report.volume)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockStage, MoveModel};
    use tracing_test::traced_test;

    fn policy(count_max: u32, threshold: f64) -> CorrectionPolicy {
        CorrectionPolicy {
            time_delay: Duration::ZERO,
            count_max,
            threshold,
        }
    }

    #[test]
    fn test_correction_not_needed() {
        let mut stage = MockStage::at(-1000);
        let outcome = correct_position(&mut stage, -1050, &policy(5, 100.0)).unwrap();
        assert_eq!(outcome.iterations, 0);
        assert!(outcome.converged);
        assert_eq!(outcome.residual_nm, 50);
        assert!(stage.relative_moves().is_empty());
    }

    #[test]
    fn test_correction_single_exact_move() {
        let mut stage = MockStage::at(-700);
        let outcome = correct_position(&mut stage, -1000, &policy(5, 100.0)).unwrap();
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.converged);
        assert_eq!(outcome.residual_nm, 0);
        assert_eq!(stage.relative_moves(), &[-300]);
    }

    #[test]
    fn test_correction_retries_until_within_threshold() {
        let mut stage = MockStage::at(500).with_offsets([200, -150]);
        let outcome = correct_position(&mut stage, 0, &policy(5, 100.0)).unwrap();
        // 500 -> 200 -> -150 -> 0
        assert_eq!(outcome.iterations, 3);
        assert_eq!(stage.relative_moves(), &[-500, -200, 150]);
        assert!(outcome.converged);
    }

    #[test]
    #[traced_test]
    fn test_correction_bounded_when_stuck() {
        let mut stage = MockStage::at(400).with_model(MoveModel::Stuck);
        let outcome = correct_position(&mut stage, 0, &policy(5, 100.0)).unwrap();
        assert_eq!(outcome.iterations, 5);
        assert!(!outcome.converged);
        assert_eq!(outcome.residual_nm, 400);
        assert_eq!(stage.relative_moves().len(), 5);
        assert!(logs_contain("Stage correction gave up after 5 moves"));
    }

    #[test]
    fn test_correction_count_max_zero() {
        let mut stage = MockStage::at(400);
        let outcome = correct_position(&mut stage, 0, &policy(0, 100.0)).unwrap();
        assert_eq!(outcome.iterations, 0);
        assert!(!outcome.converged);
        assert!(stage.relative_moves().is_empty());
    }

    #[test]
    fn test_correction_propagates_stage_failure() {
        let mut stage = MockStage::at(400).fail_after(1);
        assert!(correct_position(&mut stage, 0, &policy(5, 100.0)).is_err());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(AcquisitionState::CorrectPosition.to_string(), "CORRECT_POSITION");
        assert_eq!(AcquisitionState::Aborted.to_string(), "ABORTED");
    }
}
