//! Device capability contracts.
//!
//! Fine-grained traits that concrete drivers implement. The contracts are
//! deliberately small: a linear motor knows how to report position, move,
//! home and stop; a spectrometer knows how to acquire spectra and manage its
//! integration settings. Everything delay-specific (time zero, femtosecond
//! conversions, the predicted-position safety check applied to every move)
//! lives above the contract in [`crate::stage::DelayStage`].
//!
//! # Design
//!
//! Each trait:
//! - Is async (`#[async_trait]`) and thread-safe (`Send + Sync`)
//! - Takes `&self`; drivers use interior mutability for their state
//! - Returns [`FrogResult`] with the typed errors from [`crate::error`]
//!
//! Motion initiation methods (`move_to_um`, `move_by_um`, `home`, `stop`)
//! return once the command is accepted by the device, not once motion has
//! ceased. Completion is observed by polling [`LinearMotor::is_in_motion`],
//! which is what the motion monitor does.

use async_trait::async_trait;

use crate::error::FrogResult;
use crate::hardware::Spectrum;

/// Contract for a single-axis motorized linear stage.
///
/// # Contract
/// - Positions are in microns from the homing reference.
/// - `move_to_um` / `move_by_um` must reject a command whose predicted
///   resulting position (current cached position plus delta) falls outside
///   [`travel_limits_um`](LinearMotor::travel_limits_um) with
///   [`FrogError::OutOfBounds`](crate::error::FrogError::OutOfBounds),
///   before writing anything to the hardware link.
/// - Travel limits are fixed at connect time; no API mutates them afterward.
/// - A rejected command leaves all driver state unchanged.
#[async_trait]
pub trait LinearMotor: Send + Sync {
    /// Read the authoritative position from hardware, in microns.
    async fn position_um(&self) -> FrogResult<f64>;

    /// Command an absolute move. Non-blocking: returns once accepted.
    async fn move_to_um(&self, target_um: f64) -> FrogResult<()>;

    /// Command a relative move. Non-blocking: returns once accepted.
    async fn move_by_um(&self, delta_um: f64) -> FrogResult<()>;

    /// Start the homing sequence. Non-blocking; completion is observed via
    /// [`is_in_motion`](LinearMotor::is_in_motion).
    async fn home(&self) -> FrogResult<()>;

    /// True while the stage is moving (including homing).
    async fn is_in_motion(&self) -> FrogResult<bool>;

    /// Command the stage to decelerate to a stop. Non-blocking.
    async fn stop(&self) -> FrogResult<()>;

    /// Soft travel limits `(lower, upper)` in microns, set at connect time.
    fn travel_limits_um(&self) -> (f64, f64);

    /// Release the hardware link.
    async fn close(&self) -> FrogResult<()>;
}

/// Contract for a fiber spectrometer.
///
/// # Contract
/// - The wavelength axis is fixed for the device's lifetime.
/// - `set_integration_time_micros` rejects values outside
///   [`integration_time_micros_limit`](Spectrometer::integration_time_micros_limit)
///   with `IntegrationTime`; the previous value is retained.
/// - `set_scans_to_avg` rejects counts below 1 with `AverageCount`; the
///   previous value is retained.
#[async_trait]
pub trait Spectrometer: Send + Sync {
    /// Wavelength bins in nanometers.
    async fn wavelengths(&self) -> FrogResult<std::sync::Arc<[f64]>>;

    /// Acquire one intensity vector.
    async fn intensities(&self) -> FrogResult<Vec<f64>>;

    /// Acquire one full sample (wavelengths paired with fresh intensities).
    async fn spectrum(&self) -> FrogResult<Spectrum>;

    /// Current integration time in microseconds.
    async fn integration_time_micros(&self) -> u64;

    /// Set the integration time in microseconds.
    async fn set_integration_time_micros(&self, micros: u64) -> FrogResult<()>;

    /// Supported integration-time range `(min, max)` in microseconds.
    fn integration_time_micros_limit(&self) -> (u64, u64);

    /// Number of scans averaged into each returned spectrum.
    async fn scans_to_avg(&self) -> u32;

    /// Set the number of scans averaged into each returned spectrum.
    async fn set_scans_to_avg(&self, n: u32) -> FrogResult<()>;

    /// Release the hardware link.
    async fn close(&self) -> FrogResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrogError;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    struct FixedMotor {
        position: RwLock<f64>,
        limits: (f64, f64),
    }

    #[async_trait]
    impl LinearMotor for FixedMotor {
        async fn position_um(&self) -> FrogResult<f64> {
            Ok(*self.position.read().await)
        }

        async fn move_to_um(&self, target_um: f64) -> FrogResult<()> {
            if target_um < self.limits.0 || target_um > self.limits.1 {
                return Err(FrogError::OutOfBounds {
                    predicted_um: target_um,
                    lower_um: self.limits.0,
                    upper_um: self.limits.1,
                });
            }
            *self.position.write().await = target_um;
            Ok(())
        }

        async fn move_by_um(&self, delta_um: f64) -> FrogResult<()> {
            let target = *self.position.read().await + delta_um;
            self.move_to_um(target).await
        }

        async fn home(&self) -> FrogResult<()> {
            *self.position.write().await = 0.0;
            Ok(())
        }

        async fn is_in_motion(&self) -> FrogResult<bool> {
            Ok(false)
        }

        async fn stop(&self) -> FrogResult<()> {
            Ok(())
        }

        fn travel_limits_um(&self) -> (f64, f64) {
            self.limits
        }

        async fn close(&self) -> FrogResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn trait_objects_are_substitutable() {
        let motor: Arc<dyn LinearMotor> = Arc::new(FixedMotor {
            position: RwLock::new(5.0),
            limits: (0.0, 100.0),
        });

        motor.move_by_um(10.0).await.unwrap();
        assert!((motor.position_um().await.unwrap() - 15.0).abs() < 1e-12);

        let err = motor.move_to_um(500.0).await.unwrap_err();
        assert!(matches!(err, FrogError::OutOfBounds { .. }));
        // Rejected command left the position untouched.
        assert!((motor.position_um().await.unwrap() - 15.0).abs() < 1e-12);
    }
}
