//! Core library for the fluor_daq application.
//!
//! This library drives a fluorescence imaging rig (laser bank, camera, objective
//! stage, pattern mirror and trigger outputs) through synchronized widefield and
//! structured-illumination volume acquisitions. It is used by the `fluor_daq`
//! binary and by integration tests running against simulated devices.
//!
//! # Modules
//!
//! - [`hardware`]: capability traits, device drivers and mocks
//! - [`acquisition`]: plans, burst demultiplexing, volume tensor, orchestrator
//! - [`config`]: layered Figment configuration
//! - [`error`]: the crate error taxonomy
//! - [`logging`]: tracing subscriber setup

pub mod acquisition;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;

pub use acquisition::{
    acquire_volume, AcquisitionPlan, ImagingMode, VolumeAcquisition, VolumeTensor,
};
pub use error::{DaqError, DaqResult};
