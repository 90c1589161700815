//! Planned spectrogram traversal.
//!
//! A scan range is canonical in femtoseconds of optical delay; the micron
//! view is derived through T0 and the speed-of-light conversion, so the two
//! representations can never drift apart. Constructors accept either
//! representation.

use serde::{Deserialize, Serialize};

use crate::error::{FrogError, FrogResult};
use crate::units::{delay_fs_to_distance_um, distance_um_to_delay_fs};

/// Start, end and step of a planned scan, in femtoseconds relative to T0.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanRange {
    /// First sampled delay.
    pub start_fs: f64,
    /// Last delay within the scan envelope.
    pub end_fs: f64,
    /// Signed step between samples.
    pub step_fs: f64,
}

impl ScanRange {
    /// Build a range from delays relative to T0.
    pub fn from_fs(start_fs: f64, end_fs: f64, step_fs: f64) -> Self {
        Self {
            start_fs,
            end_fs,
            step_fs,
        }
    }

    /// Build a range from absolute stage positions, given the current T0.
    pub fn from_um(t0_um: f64, start_um: f64, end_um: f64, step_um: f64) -> Self {
        Self {
            start_fs: distance_um_to_delay_fs(start_um - t0_um),
            end_fs: distance_um_to_delay_fs(end_um - t0_um),
            step_fs: distance_um_to_delay_fs(step_um),
        }
    }

    /// Absolute start position in microns for a given T0.
    pub fn start_um(&self, t0_um: f64) -> f64 {
        delay_fs_to_distance_um(self.start_fs) + t0_um
    }

    /// Absolute end position in microns for a given T0.
    pub fn end_um(&self, t0_um: f64) -> f64 {
        delay_fs_to_distance_um(self.end_fs) + t0_um
    }

    /// Signed step in microns.
    pub fn step_um(&self) -> f64 {
        delay_fs_to_distance_um(self.step_fs)
    }

    /// Scan direction: +1.0 toward larger positions, -1.0 toward smaller.
    pub fn direction(&self) -> f64 {
        self.step_fs.signum()
    }

    /// Reject ranges the sequencer cannot traverse: zero or non-finite
    /// steps, and steps pointing away from the end position.
    pub fn validate(&self) -> FrogResult<()> {
        if !self.start_fs.is_finite() || !self.end_fs.is_finite() || !self.step_fs.is_finite() {
            return Err(FrogError::Configuration(
                "scan range values must be finite".into(),
            ));
        }
        if self.step_fs == 0.0 {
            return Err(FrogError::Configuration("scan step must be nonzero".into()));
        }
        if (self.end_fs - self.start_fs) * self.step_fs < 0.0 {
            return Err(FrogError::Configuration(
                "scan step points away from the end position".into(),
            ));
        }
        Ok(())
    }
}
