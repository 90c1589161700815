//! Integration tests for the acquisition coordinator: scan sequencing,
//! cancellation, device arbitration and baseline subtraction, all against the
//! simulated hardware.

use std::sync::Arc;

use serial_test::serial;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Duration};

use frog_daq::coordinator::{CoordinatorOptions, FrogCoordinator};
use frog_daq::hardware::capabilities::Spectrometer;
use frog_daq::hardware::mock::{MockSpectrometer, MockStage};
use frog_daq::messages::FrogEvent;
use frog_daq::scan_range::ScanRange;
use frog_daq::stage::DelayStage;
use frog_daq::units::delay_fs_to_distance_um;
use frog_daq::{ErrorKind, FrogError};

const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

struct Rig {
    stage: Arc<MockStage>,
    coordinator: FrogCoordinator,
}

async fn build_rig(
    stage: MockStage,
    spectrometer: MockSpectrometer,
    options: CoordinatorOptions,
) -> Rig {
    let stage = Arc::new(stage);
    spectrometer
        .set_integration_time_micros(1_000)
        .await
        .unwrap();

    let motor: Arc<dyn frog_daq::hardware::capabilities::LinearMotor> = stage.clone();
    let delay_stage = DelayStage::with_t0(motor, 0.0, 1.0).await.unwrap();
    let coordinator = FrogCoordinator::new(
        Arc::new(delay_stage),
        Arc::new(spectrometer),
        options,
    )
    .await
    .unwrap();

    Rig { stage, coordinator }
}

fn fast_options() -> CoordinatorOptions {
    CoordinatorOptions {
        poll_interval: Duration::from_millis(1),
        backlash_um: 25.0,
        max_jog_um: None,
    }
}

/// Drain events until the scan terminates, returning the samples seen.
async fn collect_scan(
    rx: &mut broadcast::Receiver<FrogEvent>,
) -> (Vec<(usize, f64)>, Option<ErrorKind>) {
    let mut samples = Vec::new();
    loop {
        let event = timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("scan did not terminate in time")
            .expect("event channel closed");
        match event {
            FrogEvent::ScanSample {
                step_index,
                delay_fs,
                ..
            } => samples.push((step_index, delay_fs)),
            FrogEvent::ScanFinished { error } => return (samples, error),
            _ => {}
        }
    }
}

fn round3(value: f64) -> f64 {
    (value * 1_000.0).round() / 1_000.0
}

#[tokio::test]
#[serial]
async fn scan_covers_range_with_exact_step_count() {
    let rig = build_rig(
        MockStage::new().with_speed(1_000_000.0),
        MockSpectrometer::with_pixels(16),
        fast_options(),
    )
    .await;

    let mut rx = rig.coordinator.subscribe();
    let range = ScanRange::from_um(0.0, 1_000.0, 1_010.0, 2.0);
    rig.coordinator.start_scan(range).await.unwrap();

    let (samples, error) = collect_scan(&mut rx).await;
    assert!(error.is_none());

    // 1000, 1002, ..., 1010: exactly six samples, strictly increasing index.
    assert_eq!(samples.len(), 6);
    for (i, (step_index, delay_fs)) in samples.iter().enumerate() {
        assert_eq!(*step_index, i);
        let position_um = delay_fs_to_distance_um(*delay_fs);
        assert!(
            round3(position_um) <= 1_010.0,
            "sample {i} at {position_um} um is past the end bound"
        );
    }

    // Delays map back onto the commanded grid.
    let first_um = delay_fs_to_distance_um(samples[0].1);
    assert!((round3(first_um) - 1_000.0).abs() < 1e-9);

    let spectrogram = rig.coordinator.spectrogram().await.unwrap();
    assert_eq!(spectrogram.len(), 6);
    assert_eq!(spectrogram.wavelengths.len(), 16);
}

#[tokio::test]
#[serial]
async fn cancellation_mid_scan_keeps_collected_rows() {
    // Slow the stage so there is ample time to cancel between steps.
    let rig = build_rig(
        MockStage::new().with_speed(1_000.0),
        MockSpectrometer::with_pixels(16),
        fast_options(),
    )
    .await;

    let mut rx = rig.coordinator.subscribe();
    let range = ScanRange::from_um(0.0, 1_000.0, 1_010.0, 2.0);
    rig.coordinator.start_scan(range).await.unwrap();

    let mut samples = 0usize;
    let error = loop {
        let event = timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("scan did not terminate in time")
            .expect("event channel closed");
        match event {
            FrogEvent::ScanSample { step_index, .. } => {
                samples += 1;
                if step_index == 2 {
                    rig.coordinator.stop_scan().await;
                }
            }
            FrogEvent::ScanFinished { error } => break error,
            _ => {}
        }
    };

    assert!(error.is_none());
    assert_eq!(samples, 3, "no sample may follow the stop request");

    // Rows 0..=2 remain retrievable after cancellation.
    let partial = rig.coordinator.spectrogram().await.unwrap();
    assert_eq!(partial.len(), 3);

    // The scan task winds down right after its terminal event.
    sleep(Duration::from_millis(20)).await;
    assert!(!rig.coordinator.scan_active().await);
}

#[tokio::test]
#[serial]
async fn continuous_polling_is_rejected_while_scan_owns_spectrometer() {
    let rig = build_rig(
        MockStage::new().with_speed(500.0),
        MockSpectrometer::with_pixels(16),
        fast_options(),
    )
    .await;

    let mut rx = rig.coordinator.subscribe();
    let range = ScanRange::from_um(0.0, 1_000.0, 1_010.0, 2.0);
    rig.coordinator.start_scan(range).await.unwrap();

    let err = rig.coordinator.start_continuous_spectrum().await.unwrap_err();
    assert!(matches!(err, FrogError::Busy("spectrometer")));

    rig.coordinator.stop_scan().await;
    let (_, error) = collect_scan(&mut rx).await;
    assert!(error.is_none());
}

#[tokio::test]
#[serial]
async fn starting_scan_stops_continuous_polling_first() {
    let rig = build_rig(
        MockStage::new().with_speed(1_000_000.0),
        MockSpectrometer::with_pixels(16),
        fast_options(),
    )
    .await;

    rig.coordinator.start_continuous_spectrum().await.unwrap();
    sleep(Duration::from_millis(10)).await;
    assert!(rig.coordinator.continuous_spectrum_active().await);

    let mut rx = rig.coordinator.subscribe();
    let range = ScanRange::from_um(0.0, 100.0, 104.0, 2.0);
    rig.coordinator.start_scan(range).await.unwrap();

    let (samples, error) = collect_scan(&mut rx).await;
    assert!(error.is_none());
    assert_eq!(samples.len(), 3);
    assert!(!rig.coordinator.continuous_spectrum_active().await);
}

#[tokio::test]
#[serial]
async fn start_scan_while_scanning_toggles_to_stop() {
    let rig = build_rig(
        MockStage::new().with_speed(1_000.0),
        MockSpectrometer::with_pixels(16),
        fast_options(),
    )
    .await;

    let mut rx = rig.coordinator.subscribe();
    let range = ScanRange::from_um(0.0, 1_000.0, 1_100.0, 2.0);
    rig.coordinator.start_scan(range).await.unwrap();
    sleep(Duration::from_millis(20)).await;

    // Second invocation must cancel, not start a second scan.
    rig.coordinator.start_scan(range).await.unwrap();

    let (samples, error) = collect_scan(&mut rx).await;
    assert!(error.is_none());
    assert!(samples.len() < 51, "scan was not cancelled");
}

#[tokio::test]
#[serial]
async fn scan_samples_are_background_subtracted() {
    let profile = vec![8.0, 4.0, 2.0, 1.0];
    let rig = build_rig(
        MockStage::new().with_speed(1_000_000.0),
        MockSpectrometer::with_pixels(4).with_profile(profile.clone()),
        fast_options(),
    )
    .await;

    // Populate the last-seen sample, then freeze it as the ambient baseline.
    rig.coordinator.start_continuous_spectrum().await.unwrap();
    sleep(Duration::from_millis(20)).await;
    rig.coordinator.stop_continuous_spectrum().await.unwrap();
    rig.coordinator.set_ambient().await;
    assert_eq!(rig.coordinator.ambient().await, profile);

    let mut rx = rig.coordinator.subscribe();
    let range = ScanRange::from_um(0.0, 100.0, 102.0, 2.0);
    rig.coordinator.start_scan(range).await.unwrap();

    loop {
        let event = timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("scan did not terminate in time")
            .expect("event channel closed");
        match event {
            FrogEvent::ScanSample { spectrum, .. } => {
                // Raw equals baseline, so every emitted bin clamps to zero.
                assert!(spectrum.intensities.iter().all(|v| *v == 0.0));
            }
            FrogEvent::ScanFinished { error } => {
                assert!(error.is_none());
                break;
            }
            _ => {}
        }
    }

    // Zeroing the baseline restores the raw line.
    rig.coordinator.zero_ambient().await;
    sleep(Duration::from_millis(20)).await;
    let mut rx = rig.coordinator.subscribe();
    rig.coordinator.start_scan(range).await.unwrap();
    let mut saw_sample = false;
    loop {
        let event = timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("scan did not terminate in time")
            .expect("event channel closed");
        match event {
            FrogEvent::ScanSample { spectrum, .. } => {
                saw_sample = true;
                assert_eq!(spectrum.intensities, profile);
            }
            FrogEvent::ScanFinished { error } => {
                assert!(error.is_none());
                break;
            }
            _ => {}
        }
    }
    assert!(saw_sample);
}

#[tokio::test]
#[serial]
async fn spectrometer_failure_aborts_scan_but_keeps_partial_data() {
    let rig = build_rig(
        MockStage::new().with_speed(1_000_000.0),
        MockSpectrometer::with_pixels(8).fail_after(3),
        fast_options(),
    )
    .await;

    let mut rx = rig.coordinator.subscribe();
    let range = ScanRange::from_um(0.0, 1_000.0, 1_020.0, 2.0);
    rig.coordinator.start_scan(range).await.unwrap();

    let (samples, error) = collect_scan(&mut rx).await;
    assert_eq!(error, Some(ErrorKind::DeviceComms));
    assert_eq!(samples.len(), 3);

    let partial = rig.coordinator.spectrogram().await.unwrap();
    assert_eq!(partial.len(), 3);

    // The failed scan released both devices.
    sleep(Duration::from_millis(20)).await;
    rig.coordinator.start_continuous_spectrum().await.unwrap();
    rig.coordinator.stop_continuous_spectrum().await.unwrap();
}

#[tokio::test]
#[serial]
async fn jog_toggles_to_a_single_hardware_stop() {
    let rig = build_rig(
        MockStage::new().with_position(5_000.0).with_speed(500.0),
        MockSpectrometer::with_pixels(8),
        fast_options(),
    )
    .await;

    let mut rx = rig.coordinator.subscribe();
    rig.coordinator.jog_by_um(2_000.0).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    // Jogging again while in motion stops the motor; a third call is a no-op
    // on the already-stopping monitor.
    rig.coordinator.jog_by_um(2_000.0).await.unwrap();
    rig.coordinator.jog_by_um(2_000.0).await.unwrap();

    loop {
        let event = timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("motion did not finish")
            .expect("event channel closed");
        if let FrogEvent::MotionFinished { error, .. } = event {
            assert!(error.is_none());
            break;
        }
    }
    assert_eq!(rig.stage.stop_commands(), 1);
}

#[tokio::test]
#[serial]
async fn scan_rejects_range_outside_travel_limits() {
    let rig = build_rig(
        MockStage::new().with_speed(1_000_000.0),
        MockSpectrometer::with_pixels(8),
        fast_options(),
    )
    .await;

    let range = ScanRange::from_um(0.0, 19_990.0, 20_050.0, 2.0);
    let err = rig.coordinator.start_scan(range).await.unwrap_err();
    assert!(matches!(err, FrogError::OutOfBounds { .. }));

    // Nothing started: devices stay free.
    assert!(!rig.coordinator.scan_active().await);
    rig.coordinator.start_continuous_spectrum().await.unwrap();
    rig.coordinator.stop_continuous_spectrum().await.unwrap();
}
