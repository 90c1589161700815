//! Background monitor for continuous spectrum acquisition.
//!
//! Free-running loop that repeatedly samples the spectrometer and publishes
//! each raw spectrum until a stop is requested. The spectrometer guard token
//! travels with the task, so the device only reads as free once the loop has
//! genuinely stopped touching it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::coordinator::guards::GuardToken;
use crate::error::{FrogError, FrogResult};
use crate::hardware::capabilities::Spectrometer;
use crate::messages::FrogEvent;

/// Acquire-and-emit loop for free-running spectrum display.
pub struct SpectrumMonitor {
    spectrometer: Arc<dyn Spectrometer>,
    events: broadcast::Sender<FrogEvent>,
    last_intensities: Arc<tokio::sync::RwLock<Vec<f64>>>,
    stop_requested: Arc<AtomicBool>,
}

impl SpectrumMonitor {
    /// Create a monitor. `last_intensities` is the coordinator's cache of the
    /// most recent raw sample, used by `set_ambient`.
    pub fn new(
        spectrometer: Arc<dyn Spectrometer>,
        events: broadcast::Sender<FrogEvent>,
        last_intensities: Arc<tokio::sync::RwLock<Vec<f64>>>,
    ) -> Self {
        Self {
            spectrometer,
            events,
            last_intensities,
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn run(&self) -> FrogResult<()> {
        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                return Ok(());
            }

            let spectrum = self.spectrometer.spectrum().await?;
            self.last_intensities
                .write()
                .await
                .clone_from(&spectrum.intensities);
            let _ = self
                .events
                .send(FrogEvent::SpectrumSample(Arc::new(spectrum)));
        }
    }

    /// Run the monitor on its own task, carrying the spectrometer guard
    /// token until the loop exits.
    pub fn spawn(self, token: GuardToken) -> SpectrumHandle {
        let stop_requested = Arc::clone(&self.stop_requested);
        let task = tokio::spawn(async move {
            let result = self.run().await;
            if let Err(err) = &result {
                warn!(error = %err, "continuous spectrum monitor terminated on hardware error");
            }
            drop(token);
            result
        });
        SpectrumHandle {
            stop_requested,
            task,
        }
    }
}

/// Caller-side handle to a spawned spectrum monitor.
#[derive(Debug)]
pub struct SpectrumHandle {
    stop_requested: Arc<AtomicBool>,
    task: JoinHandle<FrogResult<()>>,
}

impl SpectrumHandle {
    /// Request the loop to stop and wait until it has exited. The device is
    /// not free for another operation until this returns.
    pub async fn stop(self) -> FrogResult<()> {
        self.stop_requested.store(true, Ordering::Release);
        self.task
            .await
            .map_err(|err| FrogError::DeviceComms(format!("spectrum monitor task failed: {err}")))?
    }

    /// Whether the monitor task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::guards::DeviceGuard;
    use crate::hardware::mock::MockSpectrometer;
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn emits_samples_until_stopped() {
        let spectrometer = Arc::new(MockSpectrometer::with_pixels(32));
        spectrometer
            .set_integration_time_micros(1_000)
            .await
            .unwrap();
        let (events, mut rx) = broadcast::channel(256);
        let last = Arc::new(tokio::sync::RwLock::new(Vec::new()));

        let guard = DeviceGuard::new("spectrometer");
        let device: Arc<dyn Spectrometer> = spectrometer.clone();
        let monitor = SpectrumMonitor::new(device, events, Arc::clone(&last));
        let handle = monitor.spawn(guard.try_acquire().unwrap());

        sleep(Duration::from_millis(20)).await;
        handle.stop().await.unwrap();
        assert!(!guard.is_busy());

        let mut samples = 0;
        while let Ok(event) = rx.try_recv() {
            if let FrogEvent::SpectrumSample(spectrum) = event {
                assert_eq!(spectrum.len(), 32);
                samples += 1;
            }
        }
        assert!(samples >= 2, "only {samples} samples seen");
        assert_eq!(last.read().await.len(), 32);
    }

    #[tokio::test]
    async fn hardware_error_releases_guard() {
        let spectrometer = Arc::new(MockSpectrometer::with_pixels(8).fail_after(1));
        spectrometer
            .set_integration_time_micros(1_000)
            .await
            .unwrap();
        let (events, _rx) = broadcast::channel(64);
        let last = Arc::new(tokio::sync::RwLock::new(Vec::new()));

        let guard = DeviceGuard::new("spectrometer");
        let device: Arc<dyn Spectrometer> = spectrometer.clone();
        let monitor = SpectrumMonitor::new(device, events, last);
        let handle = monitor.spawn(guard.try_acquire().unwrap());

        sleep(Duration::from_millis(30)).await;
        assert!(handle.is_finished());
        assert!(!guard.is_busy());
        assert!(handle.stop().await.is_err());
    }
}
