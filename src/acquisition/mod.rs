//! Volume Acquisition
//!
//! The acquisition core: plans, the burst demultiplexer, the volume tensor and
//! the orchestrator that ties the rig together.
//!
//! - **Plans** describe one z-stack and are validated before hardware is touched
//! - **FrameDemultiplexer** maps a flat SIM burst onto `(channel, angle, phase)`
//! - **VolumeTensor** holds the `(C, A, Z, P, rows, cols)` result
//! - **VolumeAcquisition** runs the state machine with closed-loop stage correction

pub mod demux;
pub mod orchestrator;
pub mod plan;
pub mod volume;

pub use demux::{frame_index, FrameDemultiplexer};
pub use orchestrator::{
    acquire_volume, correct_position, AcquisitionReport, AcquisitionState, CorrectionOutcome,
    CorrectionPolicy, VolumeAcquisition,
};
pub use plan::{AcquisitionPlan, ImagingMode, SliceInterrupt};
pub use volume::VolumeTensor;
