//! Rig Hardware
//!
//! Capability traits driven by the acquisition core, device drivers for the
//! laser controller and objective stage, and simulated devices for tests and
//! dry runs.

pub mod capabilities;
pub mod detector;
pub mod laser;
pub mod mirror;
pub mod mock;
pub mod stage;
pub mod trigger;

pub use capabilities::{BurstTrigger, Detector, MirrorController, ObjectiveStage, TriggerSequencer};
pub use detector::{Frame, MountOrientation, TriggerMode};
pub use laser::{LaserBank, LaserChannel, LaserHandle, LaserLink, SerialLaserLink};
pub use mirror::{MirrorMacro, MirrorPosition, PositionTable};
pub use stage::SmaractStage;
pub use trigger::{DigitalLine, SequenceProgram};
