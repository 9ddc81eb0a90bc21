//! Frame burst demultiplexing
//!
//! A SIM burst is emitted with phase varying slowest, angle next and channel
//! fastest. For `C` channels and `A` angles the frame for `(c, a, p)` sits at
//!
//! ```text
//! idx(c, a, p) = c + a*C + p*(A*C)
//! ```

use crate::acquisition::volume::VolumeTensor;
use crate::error::{DaqError, DaqResult};
use crate::hardware::detector::Frame;

/// Flat burst index of logical coordinate `(c, a, p)`.
#[inline]
pub fn frame_index(c: usize, a: usize, p: usize, channels: usize, angles: usize) -> usize {
    c + a * channels + p * (angles * channels)
}

/// Maps a flat burst onto `(channel, angle, phase)` coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDemultiplexer {
    channels: usize,
    angles: usize,
    phases: usize,
}

impl FrameDemultiplexer {
    /// Demultiplexer for a `channels x angles x phases` burst.
    pub fn new(channels: usize, angles: usize, phases: usize) -> Self {
        Self {
            channels,
            angles,
            phases,
        }
    }

    /// Frames in one burst
    pub fn burst_len(&self) -> usize {
        self.channels * self.angles * self.phases
    }

    /// Flat index of `(c, a, p)`.
    pub fn index(&self, c: usize, a: usize, p: usize) -> usize {
        frame_index(c, a, p, self.channels, self.angles)
    }

    /// Inverse of [`index`](Self::index).
    pub fn coordinates(&self, index: usize) -> (usize, usize, usize) {
        let c = index % self.channels;
        let a = (index / self.channels) % self.angles;
        let p = index / (self.channels * self.angles);
        (c, a, p)
    }

    /// Write `burst[idx(c,a,p)]` into `volume[c, a, z, p, :, :]`.
    ///
    /// # Errors
    /// `FrameAcquisition` if the burst length or any frame shape does not match
    /// the volume. The volume is left untouched in that case.
    pub fn demultiplex(
        &self,
        burst: &[Frame],
        volume: &mut VolumeTensor,
        z: usize,
    ) -> DaqResult<()> {
        if burst.len() != self.burst_len() {
            return Err(DaqError::FrameAcquisition(format!(
                "burst holds {} frames, expected {}",
                burst.len(),
                self.burst_len()
            )));
        }
        let frame_shape = volume.frame_shape();
        if let Some(frame) = burst.iter().find(|f| f.dim() != frame_shape) {
            return Err(DaqError::FrameAcquisition(format!(
                "frame shape {:?} does not match volume frame shape {:?}",
                frame.dim(),
                frame_shape
            )));
        }

        for p in 0..self.phases {
            for a in 0..self.angles {
                for c in 0..self.channels {
                    volume.write_frame(c, a, z, p, &burst[self.index(c, a, p)])?;
                }
            }
        }
        Ok(())
    }
}
