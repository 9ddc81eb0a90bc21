//! Six-dimensional image volume
//!
//! Axes are `(channel, angle, z, phase, row, col)`, matching the order in which
//! SIM reconstruction expects them.

use crate::error::{DaqError, DaqResult};
use crate::hardware::detector::Frame;
use ndarray::{s, Array3, Array6, ArrayView2, ArrayView6, Axis};

/// Acquired volume of 8-bit frames.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeTensor {
    data: Array6<u8>,
}

impl VolumeTensor {
    /// Zero-initialised volume.
    pub fn zeros(
        channels: usize,
        angles: usize,
        slices: usize,
        phases: usize,
        rows: usize,
        cols: usize,
    ) -> Self {
        Self {
            data: Array6::zeros((channels, angles, slices, phases, rows, cols)),
        }
    }

    /// `[C, A, Z, P, rows, cols]`
    pub fn shape(&self) -> [usize; 6] {
        let s = self.data.shape();
        [s[0], s[1], s[2], s[3], s[4], s[5]]
    }

    /// `(rows, cols)` of each frame
    pub fn frame_shape(&self) -> (usize, usize) {
        let [_, _, _, _, rows, cols] = self.shape();
        (rows, cols)
    }

    /// Number of channels
    pub fn channel_count(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    /// Number of z-slices
    pub fn slice_count(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    /// View of `volume[c, a, z, p, :, :]`.
    ///
    /// # Panics
    /// If any index is out of bounds.
    pub fn frame(&self, c: usize, a: usize, z: usize, p: usize) -> ArrayView2<'_, u8> {
        self.data.slice(s![c, a, z, p, .., ..])
    }

    /// Copy `frame` into `volume[c, a, z, p, :, :]`.
    ///
    /// # Errors
    /// `FrameAcquisition` if the frame shape differs from the volume's frame shape
    /// or the coordinate lies outside the volume.
    pub fn write_frame(
        &mut self,
        c: usize,
        a: usize,
        z: usize,
        p: usize,
        frame: &Frame,
    ) -> DaqResult<()> {
        if frame.dim() != self.frame_shape() {
            return Err(DaqError::FrameAcquisition(format!(
                "frame shape {:?} does not match volume frame shape {:?}",
                frame.dim(),
                self.frame_shape()
            )));
        }
        let [nc, na, nz, np, _, _] = self.shape();
        if c >= nc || a >= na || z >= nz || p >= np {
            return Err(DaqError::FrameAcquisition(format!(
                "coordinate ({c}, {a}, {z}, {p}) outside volume {:?}",
                self.shape()
            )));
        }
        self.data.slice_mut(s![c, a, z, p, .., ..]).assign(frame);
        Ok(())
    }

    /// Borrow the underlying array
    pub fn view(&self) -> ArrayView6<'_, u8> {
        self.data.view()
    }

    /// Take the underlying array
    pub fn into_inner(self) -> Array6<u8> {
        self.data
    }

    /// Per-channel maximum over angle, z and phase: shape `(C, rows, cols)`.
    pub fn max_intensity_projection(&self) -> Array3<u8> {
        project(self.data.view())
    }

    /// Maximum intensity projection over slices `z_start..z_end` only.
    ///
    /// # Errors
    /// `Range` if the slice range is empty or extends past the volume.
    pub fn max_intensity_projection_range(
        &self,
        z_start: usize,
        z_end: usize,
    ) -> DaqResult<Array3<u8>> {
        let slices = self.slice_count();
        if z_end > slices {
            return Err(DaqError::range("z_end", z_end as f64, 1.0, slices as f64));
        }
        if z_start >= z_end {
            return Err(DaqError::range(
                "z_start",
                z_start as f64,
                0.0,
                z_end.saturating_sub(1) as f64,
            ));
        }
        Ok(project(self.data.slice(s![.., .., z_start..z_end, .., .., ..])))
    }
}

impl From<VolumeTensor> for Array6<u8> {
    fn from(volume: VolumeTensor) -> Self {
        volume.into_inner()
    }
}

/// Fold angle, z and phase away, leaving `(C, rows, cols)`.
fn project(view: ArrayView6<'_, u8>) -> Array3<u8> {
    let max = |m: &u8, v: &u8| (*m).max(*v);
    view.fold_axis(Axis(1), 0, max)
        .fold_axis(Axis(1), 0, max)
        .fold_axis(Axis(1), 0, max)
}
