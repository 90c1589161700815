//! Events produced by the coordinator and its background monitors.
//!
//! All notifications flow through a single `tokio::sync::broadcast` channel
//! of [`FrogEvent`]. Monitors and the scan sequencer publish; any number of
//! observers (CLI, GUI shell, tests) subscribe independently. Terminal events
//! carry an optional [`ErrorKind`] so one event type covers normal
//! completion, cancellation and failure.

use std::sync::Arc;

use crate::error::ErrorKind;
use crate::hardware::Spectrum;

/// Notification published on the coordinator's broadcast channel.
#[derive(Clone, Debug)]
pub enum FrogEvent {
    /// Live stage position while a motion monitor runs.
    MotionProgress {
        /// Stage position in microns.
        position_um: f64,
    },

    /// Motion monitor loop exited; emitted exactly once per monitored motion.
    MotionFinished {
        /// Final authoritative position in microns; the last cached position
        /// when the monitor terminated on a link failure.
        position_um: f64,
        /// Set when the monitor terminated on a hardware error.
        error: Option<ErrorKind>,
    },

    /// One sample from the continuous spectrum monitor (raw intensities).
    SpectrumSample(Arc<Spectrum>),

    /// One step of a spectrogram scan (background-subtracted intensities).
    ScanSample {
        /// The acquired spectrum, ambient baseline already subtracted and
        /// clamped at zero.
        spectrum: Arc<Spectrum>,
        /// Zero-based index of this step within the scan.
        step_index: usize,
        /// Optical delay of the sampled position, relative to T0.
        delay_fs: f64,
    },

    /// Scan terminated; emitted exactly once per scan, whether it ran to the
    /// end of the range, was cancelled, or failed.
    ScanFinished {
        /// `None` for normal completion or cancellation; the error kind when
        /// the scan aborted.
        error: Option<ErrorKind>,
    },
}

impl FrogEvent {
    /// True for the terminal event of a monitored motion.
    pub fn is_motion_finished(&self) -> bool {
        matches!(self, FrogEvent::MotionFinished { .. })
    }

    /// True for the terminal event of a scan.
    pub fn is_scan_finished(&self) -> bool {
        matches!(self, FrogEvent::ScanFinished { .. })
    }
}
