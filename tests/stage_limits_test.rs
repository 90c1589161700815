//! Integration tests for travel-limit enforcement and T0 persistence across
//! the driver, delay-stage wrapper and coordinator layers.

use std::sync::Arc;

use tokio::time::{sleep, Duration};

use frog_daq::calibration::TimeZeroStore;
use frog_daq::hardware::capabilities::LinearMotor;
use frog_daq::hardware::kinesis::{KinesisSdkKind, KinesisStage, Z8_COUNTS_PER_MM};
use frog_daq::hardware::mock::MockStage;
use frog_daq::stage::DelayStage;
use frog_daq::FrogError;

#[tokio::test]
async fn kinesis_driver_enforces_predicted_position() {
    let stage = KinesisStage::open(
        "/dev/null",
        KinesisSdkKind::Mock,
        (0.0, 20_000.0),
        Z8_COUNTS_PER_MM,
    )
    .unwrap();

    stage.move_to_um(100.0).await.unwrap();
    while stage.is_in_motion().await.unwrap() {}

    // Predicted resulting position -100 um is below the lower limit.
    let err = stage.move_by_um(-200.0).await.unwrap_err();
    assert!(matches!(err, FrogError::OutOfBounds { .. }));

    // The same magnitude in the legal direction lands at 300 um.
    stage.move_by_um(200.0).await.unwrap();
    while stage.is_in_motion().await.unwrap() {}
    let pos = stage.position_um().await.unwrap();
    assert!((pos - 300.0).abs() < 0.1, "position was {pos}");
}

#[tokio::test]
async fn wrapper_and_driver_agree_on_rejection() {
    let motor = Arc::new(
        MockStage::new()
            .with_position(100.0)
            .with_limits((0.0, 20_000.0))
            .with_speed(1_000_000.0),
    );
    let device: Arc<dyn LinearMotor> = motor;
    let stage = DelayStage::with_t0(device, 0.0, 1.0).await.unwrap();

    assert!(matches!(
        stage.move_by_um(-200.0).await,
        Err(FrogError::OutOfBounds { .. })
    ));
    assert!(matches!(
        stage.move_to_um(25_000.0).await,
        Err(FrogError::OutOfBounds { .. })
    ));

    // A legal move still goes through and the cache follows the hardware.
    stage.move_by_um(200.0).await.unwrap();
    while stage.is_in_motion().await.unwrap() {
        sleep(Duration::from_millis(1)).await;
    }
    assert!((stage.position_um().await.unwrap() - 300.0).abs() < 1e-9);
    assert!((stage.cached_position_um().await - 300.0).abs() < 1e-9);
}

#[tokio::test]
async fn t0_survives_reconnect_with_same_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("T0_um.txt");

    // First session: calibrate T0 at 1500 um.
    {
        let motor: Arc<dyn LinearMotor> =
            Arc::new(MockStage::new().with_position(1_500.0).with_speed(1_000_000.0));
        let stage = DelayStage::connect(motor, TimeZeroStore::new(&path), 1.0)
            .await
            .unwrap();
        stage.set_t0_to_current().await.unwrap();
        assert!((stage.t0_um().await - 1_500.0).abs() < 1e-9);
    }

    // Second session: stage powers up elsewhere, T0 comes from the file.
    {
        let motor: Arc<dyn LinearMotor> =
            Arc::new(MockStage::new().with_position(9_000.0).with_speed(1_000_000.0));
        let stage = DelayStage::connect(motor, TimeZeroStore::new(&path), 1.0)
            .await
            .unwrap();
        assert!((stage.t0_um().await - 1_500.0).abs() < 1e-9);

        // Delay readout references the persisted zero, not the power-up spot.
        let delay = stage.position_fs().await.unwrap();
        assert!(delay > 0.0);
    }
}
