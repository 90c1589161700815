//! Custom error types for the application.
//!
//! This module defines the primary error type, `FrogError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures the coordinator
//! can encounter, from rejected motion commands to hardware link errors.
//!
//! ## Error Hierarchy
//!
//! - **`OutOfBounds`**: a requested move's predicted resulting position falls
//!   outside the stage travel limits. The move is rejected before anything is
//!   sent to hardware; the caller retries with an adjusted input.
//! - **`LimitsNotSet`**: a stage driver was used before its travel limits
//!   were configured.
//! - **`IntegrationTime`** / **`AverageCount`**: spectrometer configuration
//!   values outside the supported range, rejected at the setter. The previous
//!   value is retained.
//! - **`DeviceComms`**: underlying hardware link failure (connect, read,
//!   write). Fatal for the in-progress operation but not for the process.
//! - **`Busy`**: a device arbitration guard is already held, e.g. starting
//!   continuous spectrum polling while a scan owns the spectrometer.
//! - **`Configuration`**: semantic configuration errors, values that parse
//!   but are logically invalid (bad scan range, unknown log level).
//!
//! Background monitors report failures through the event channel tagged with
//! an [`ErrorKind`], a clonable mirror of the `FrogError` discriminants, so
//! the presentation layer observes one "done" event type regardless of
//! success or failure.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type FrogResult<T> = std::result::Result<T, FrogError>;

/// Primary error type for stage, spectrometer, and coordinator operations.
#[derive(Error, Debug)]
pub enum FrogError {
    #[error("predicted position {predicted_um:.3} um outside travel limits [{lower_um:.3}, {upper_um:.3}] um")]
    OutOfBounds {
        predicted_um: f64,
        lower_um: f64,
        upper_um: f64,
    },

    #[error("stage travel limits not initialized")]
    LimitsNotSet,

    #[error("integration time {requested_us} us outside supported range [{min_us}, {max_us}] us")]
    IntegrationTime {
        requested_us: u64,
        min_us: u64,
        max_us: u64,
    },

    #[error("spectrometer must average at least 1 scan (requested {0})")]
    AverageCount(u32),

    #[error("device communication error: {0}")]
    DeviceComms(String),

    #[error("{0} is busy with another operation")]
    Busy(&'static str),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV storage error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

/// Clonable classification of a [`FrogError`], carried in terminal events so
/// observers can distinguish failure modes without owning the full error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    OutOfBounds,
    LimitsNotSet,
    IntegrationTime,
    AverageCount,
    DeviceComms,
    Busy,
    Configuration,
    Io,
}

impl FrogError {
    /// Classify this error for event payloads.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FrogError::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            FrogError::LimitsNotSet => ErrorKind::LimitsNotSet,
            FrogError::IntegrationTime { .. } => ErrorKind::IntegrationTime,
            FrogError::AverageCount(_) => ErrorKind::AverageCount,
            FrogError::DeviceComms(_) => ErrorKind::DeviceComms,
            FrogError::Busy(_) => ErrorKind::Busy,
            FrogError::Configuration(_) => ErrorKind::Configuration,
            FrogError::Io(_) => ErrorKind::Io,
            #[cfg(feature = "storage_csv")]
            FrogError::Csv(_) => ErrorKind::Io,
            FrogError::SerialFeatureDisabled => ErrorKind::Configuration,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::OutOfBounds => "out of bounds",
            ErrorKind::LimitsNotSet => "limits not set",
            ErrorKind::IntegrationTime => "integration time",
            ErrorKind::AverageCount => "average count",
            ErrorKind::DeviceComms => "device comms",
            ErrorKind::Busy => "busy",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Io => "i/o",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        let err = FrogError::OutOfBounds {
            predicted_um: -100.0,
            lower_um: 0.0,
            upper_um: 20_000.0,
        };
        assert_eq!(err.kind(), ErrorKind::OutOfBounds);

        let err = FrogError::IntegrationTime {
            requested_us: 5,
            min_us: 1_000,
            max_us: 10_000_000,
        };
        assert_eq!(err.kind(), ErrorKind::IntegrationTime);

        assert_eq!(FrogError::Busy("motor").kind(), ErrorKind::Busy);
        assert_eq!(
            FrogError::DeviceComms("read timeout".into()).kind(),
            ErrorKind::DeviceComms
        );
    }

    #[test]
    fn out_of_bounds_message_names_limits() {
        let err = FrogError::OutOfBounds {
            predicted_um: 25_000.0,
            lower_um: 0.0,
            upper_um: 20_000.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("25000.000"));
        assert!(msg.contains("20000.000"));
    }
}
