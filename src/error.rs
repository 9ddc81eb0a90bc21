//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `DaqError`. Using the `thiserror`
//! crate, it provides a centralized and consistent way to handle the failures that
//! can occur while driving the imaging rig.
//!
//! ## Error Hierarchy
//!
//! - **`DeviceCommunication`**: a serial, socket or SDK failure on a named device.
//!   Fatal: the acquisition aborts immediately and the stage is left wherever it was.
//! - **`FrameAcquisition`**: a grab failed, timed out, or a hardware-triggered burst
//!   delivered the wrong number of frames. Fatal, same as above.
//! - **`Range`**: an invalid power, exposure or plan parameter. Raised before any
//!   hardware is touched.
//! - **`Configuration`**: semantic configuration problems found at runtime, such as
//!   an unknown laser name or an unparseable trigger line.
//! - **`Config`**: wraps [`ConfigError`] from loading the layered settings.
//! - **`Io`**: wraps `std::io::Error` for transports not yet bound to a device.
//!
//! Stage drift that the bounded correction loop could not remove is *not* an error;
//! it is reported through
//! [`CorrectionOutcome`](crate::acquisition::orchestrator::CorrectionOutcome).

use crate::config::ConfigError;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Every fatal condition the acquisition core can surface.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Transport or protocol failure on a specific device.
    #[error("Device communication error ({device}): {message}")]
    DeviceCommunication {
        /// Device that failed (e.g. "objective stage").
        device: String,
        /// Description of the failure.
        message: String,
    },

    /// Grab failure, timeout or burst length mismatch.
    #[error("Frame acquisition error: {0}")]
    FrameAcquisition(String),

    /// Parameter outside its permitted range.
    #[error("{parameter} = {value} is out of range [{min}, {max}]")]
    Range {
        /// Parameter name.
        parameter: &'static str,
        /// Rejected value.
        value: f64,
        /// Inclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
    },

    /// Semantic configuration error found at runtime.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Layered configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Unattributed I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// Shorthand for a [`DaqError::DeviceCommunication`].
    pub fn device(device: impl Into<String>, message: impl Into<String>) -> Self {
        DaqError::DeviceCommunication {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`DaqError::Range`].
    pub fn range(parameter: &'static str, value: f64, min: f64, max: f64) -> Self {
        DaqError::Range {
            parameter,
            value,
            min,
            max,
        }
    }

    /// Whether the error aborts a running acquisition.
    ///
    /// Range and configuration errors are raised before hardware is touched, so an
    /// acquisition never starts with them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DaqError::DeviceCommunication { .. } | DaqError::FrameAcquisition(_) | DaqError::Io(_)
        )
    }
}
