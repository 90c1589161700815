//! Hardware capability contracts and device drivers.
//!
//! The coordinator never names a concrete device: it works against the
//! [`capabilities::LinearMotor`] and [`capabilities::Spectrometer`] traits.
//! Any driver satisfying the trait (real hardware or the simulators in
//! [`mock`]) is substitutable without touching the acquisition logic.

pub mod capabilities;
pub mod connect;
pub mod kinesis;
pub mod mock;
pub mod oceanoptics;

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// One spectrometer acquisition: a wavelength axis paired with intensities.
///
/// The wavelength axis is fixed for a device's lifetime, so it is shared via
/// `Arc` rather than copied into every sample.
#[derive(Clone, Debug)]
pub struct Spectrum {
    /// Wavelength bins in nanometers.
    pub wavelengths: Arc<[f64]>,
    /// Intensity per wavelength bin, arbitrary units.
    pub intensities: Vec<f64>,
    /// Acquisition timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Spectrum {
    /// Build a sample stamped with the current time.
    pub fn new(wavelengths: Arc<[f64]>, intensities: Vec<f64>) -> Self {
        Self {
            wavelengths,
            intensities,
            timestamp: Utc::now(),
        }
    }

    /// Number of wavelength bins.
    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    /// True when the sample carries no bins.
    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }
}
