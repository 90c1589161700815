//! Device connection factory.
//!
//! Builds the configured motor/spectrometer pair and applies the initial
//! hardware settings (integration time, scans to average). Connection
//! failures surface as `DeviceComms` so the caller can tell a wiring problem
//! from a configuration one.

use std::sync::Arc;

use tracing::info;

use crate::config::{FrogConfig, SpectrometerKind, StageKind};
use crate::error::FrogResult;
use crate::hardware::capabilities::{LinearMotor, Spectrometer};
use crate::hardware::kinesis::{KinesisSdkKind, KinesisStage};
use crate::hardware::mock::{MockSpectrometer, MockStage};
use crate::hardware::oceanoptics::{
    OceanOpticsSpectrometer, OceanSdkKind, DEFAULT_INTEGRATION_LIMITS_US,
};

/// Create and initialize the configured motor and spectrometer.
///
/// Returns the fully initialized pair with travel limits, integration time
/// and scans-to-average applied.
pub async fn connect_devices(
    config: &FrogConfig,
) -> FrogResult<(Arc<dyn LinearMotor>, Arc<dyn Spectrometer>)> {
    let motor: Arc<dyn LinearMotor> = match config.stage.kind {
        StageKind::Mock => {
            info!("connecting simulated stage");
            Arc::new(
                MockStage::new()
                    .with_limits(config.stage.travel_limits_um)
                    .with_speed(50_000.0),
            )
        }
        StageKind::Kinesis => {
            info!(port = %config.stage.port, "connecting Kinesis stage");
            Arc::new(KinesisStage::open(
                &config.stage.port,
                KinesisSdkKind::Real,
                config.stage.travel_limits_um,
                config.stage.counts_per_mm,
            )?)
        }
    };

    let spectrometer: Arc<dyn Spectrometer> = match config.spectrometer.kind {
        SpectrometerKind::Mock => {
            info!("connecting emulated spectrometer");
            Arc::new(MockSpectrometer::new())
        }
        SpectrometerKind::Oceanoptics => {
            info!(port = %config.spectrometer.port, "connecting Ocean Optics spectrometer");
            Arc::new(
                OceanOpticsSpectrometer::open(
                    &config.spectrometer.port,
                    OceanSdkKind::Real,
                    DEFAULT_INTEGRATION_LIMITS_US,
                )
                .await?,
            )
        }
    };

    spectrometer
        .set_integration_time_micros(config.spectrometer.integration_time_micros)
        .await?;
    spectrometer
        .set_scans_to_avg(config.spectrometer.scans_to_avg)
        .await?;

    Ok((motor, spectrometer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_pair_comes_up_initialized() {
        let mut config = FrogConfig::default();
        config.spectrometer.integration_time_micros = 5_000;
        config.spectrometer.scans_to_avg = 3;

        let (motor, spectrometer) = connect_devices(&config).await.unwrap();
        assert_eq!(motor.travel_limits_um(), (0.0, 20_000.0));
        assert_eq!(spectrometer.integration_time_micros().await, 5_000);
        assert_eq!(spectrometer.scans_to_avg().await, 3);
    }

    #[tokio::test]
    async fn out_of_range_initial_integration_time_fails_connect() {
        let mut config = FrogConfig::default();
        config.spectrometer.integration_time_micros = 1; // below device minimum
        assert!(connect_devices(&config).await.is_err());
    }
}
