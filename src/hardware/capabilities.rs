//! Hardware Capabilities
//!
//! Fine-grained capability traits that the acquisition core drives. Each device
//! on the rig implements exactly the capability it provides:
//!
//! - the digital-output card and trigger generator implement [`TriggerSequencer`]
//! - the camera implements [`Detector`]
//! - the objective lens positioner implements [`ObjectiveStage`]
//! - the pattern mirror implements [`MirrorController`]
//!
//! Lasers are not a trait: they share one command link and are modelled by
//! [`LaserBank`](crate::hardware::laser::LaserBank).
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is synchronous: every call blocks until the device returns or times out
//! - Takes `&mut self`, since one acquisition owns its devices exclusively
//! - Uses [`DaqResult`] so failures map onto the fatal error taxonomy
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! fn snap<D: Detector + ?Sized>(camera: &mut D, exposure_us: f64) -> DaqResult<Frame> {
//!     camera.set_exposure(exposure_us)?;
//!     camera.grab()
//! }
//! ```

use crate::error::DaqResult;
use crate::hardware::detector::Frame;
use crate::hardware::mirror::{MirrorMacro, MirrorPosition};
use crate::hardware::trigger::{DigitalLine, SequenceProgram};
use std::time::Duration;

/// Callback that fires the external trigger sources of a hardware-triggered burst.
pub type BurstTrigger<'a> = dyn FnMut() -> DaqResult<()> + 'a;

/// Capability: Timed digital outputs
///
/// # Contract
/// - Every call blocks until complete; there is no queuing
/// - `pulse` drives the line high, waits, drives it low and releases the line
/// - Failures (device or line unavailable) are fatal
pub trait TriggerSequencer {
    /// Drive `line` high for `duration`, then low.
    fn pulse(&mut self, line: &DigitalLine, duration: Duration) -> DaqResult<()>;

    /// Pulse several lines together for the same duration.
    fn multi_pulse(&mut self, lines: &[DigitalLine], duration: Duration) -> DaqResult<()>;

    /// Set a persistent level on `line`.
    fn set_level(&mut self, line: &DigitalLine, on: bool) -> DaqResult<()>;

    /// Load the per-channel exposure table the generator plays during a burst.
    fn load_program(&mut self, program: &SequenceProgram) -> DaqResult<()>;
}

/// Capability: Frame acquisition
///
/// # Contract
/// - Frames are returned already corrected for the physical mount
/// - `grab` is software triggered and uses the configured exposure
/// - `grab_burst` arms hardware-trigger mode with room for `expected` frames,
///   invokes `trigger` exactly once to start the external pulse sources, then
///   collects frames in arrival order
/// - A failed or missing frame aborts the whole burst; no partial results
pub trait Detector {
    /// Frame shape `(rows, cols)` after orientation.
    fn frame_shape(&self) -> (usize, usize);

    /// Set the exposure used by subsequent software-triggered grabs.
    fn set_exposure(&mut self, exposure_us: f64) -> DaqResult<()>;

    /// Software-triggered single exposure.
    fn grab(&mut self) -> DaqResult<Frame>;

    /// Hardware-triggered burst of exactly `expected` frames.
    fn grab_burst(&mut self, expected: usize, trigger: &mut BurstTrigger<'_>)
        -> DaqResult<Vec<Frame>>;
}

/// Capability: Axial positioning
///
/// Positions are signed integers in nanometers.
///
/// # Contract
/// - `current_position` waits a fixed settle delay before querying
/// - moves return once the controller acknowledges, not once settled
pub trait ObjectiveStage {
    /// Settled position readback in nm.
    fn current_position(&mut self) -> DaqResult<i64>;

    /// Move by `delta_nm` relative to the current position.
    fn move_relative(&mut self, delta_nm: i64) -> DaqResult<()>;

    /// Move to `position_nm`.
    fn move_absolute(&mut self, position_nm: i64) -> DaqResult<()>;
}

/// Capability: Illumination pattern mirror
pub trait MirrorController {
    /// Cancel any running macro, command the axes to `position` and start the
    /// confirmation macro.
    fn move_to(&mut self, position: &MirrorPosition) -> DaqResult<()>;

    /// Launch a device-resident sequence.
    fn start_macro(&mut self, name: &MirrorMacro) -> DaqResult<()>;

    /// Halt motion and running macros. Best effort: never fails.
    fn stop_all(&mut self);
}
