//! Camera frame types and mount orientation
//!
//! Frames are 8-bit monochrome images indexed `(row, col)`. Detectors return them
//! already corrected for the physical camera mount, so consumers never re-flip.

use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

/// Single 8-bit monochrome frame, indexed `(row, col)`.
pub type Frame = Array2<u8>;

/// How a camera exposure is initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Exposure started by a direct command to the camera
    Software,
    /// Exposure gated by an external digital pulse
    #[default]
    Hardware,
}

/// Flips applied to every raw frame to undo the camera mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountOrientation {
    /// Reverse row order (upside down)
    pub flip_rows: bool,
    /// Reverse column order (left/right)
    pub flip_cols: bool,
}

impl MountOrientation {
    /// Orientation for a camera mounted upside down and mirrored.
    pub fn half_turn() -> Self {
        Self {
            flip_rows: true,
            flip_cols: true,
        }
    }

    /// Apply the mount correction to a raw sensor frame.
    pub fn apply(&self, raw: Frame) -> Frame {
        match (self.flip_rows, self.flip_cols) {
            (false, false) => raw,
            (true, false) => raw.slice(s![..;-1, ..]).to_owned(),
            (false, true) => raw.slice(s![.., ..;-1]).to_owned(),
            (true, true) => raw.slice(s![..;-1, ..;-1]).to_owned(),
        }
    }
}
