//! Stage motion and spectrogram acquisition coordination.
//!
//! [`FrogCoordinator`] is the single owner of the delay stage and the
//! spectrometer. It arbitrates device access between the continuous spectrum
//! monitor, manual motion (jog / move-to / home) and the spectrogram scan,
//! publishes all progress on one broadcast channel, and carries the shared
//! acquisition state the presentation layer observes.
//!
//! Command semantics follow the lab bench conventions: every motion-bearing
//! command is a toggle: invoking it while its operation (or a scan) is
//! already running requests a stop instead of starting anything new.

pub mod guards;
pub mod motion;
pub mod scan;
pub mod spectrum;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Duration;
use tracing::{debug, info};

use crate::error::{FrogError, FrogResult};
use crate::hardware::capabilities::Spectrometer;
use crate::messages::FrogEvent;
use crate::scan_range::ScanRange;
use crate::spectrogram::Spectrogram;
use crate::stage::DelayStage;
use crate::units::delay_fs_to_distance_um;

use guards::{DeviceGuard, GuardToken};
use motion::{MotionHandle, MotionMonitor};
use scan::{AcquisitionState, ScanHandle, ScanPlan, ScanTask};
use spectrum::{SpectrumHandle, SpectrumMonitor};

/// Tunables for the coordinator, filled from the application config.
#[derive(Clone, Copy, Debug)]
pub struct CoordinatorOptions {
    /// Cadence of the motion poll loops. Floored at 1 ms.
    pub poll_interval: Duration,
    /// Overshoot distance for the one-directional scan start approach.
    pub backlash_um: f64,
    /// Largest permitted manual jog, when set.
    pub max_jog_um: Option<f64>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            backlash_um: 25.0,
            max_jog_um: None,
        }
    }
}

/// Owner and arbiter of one delay-stage/spectrometer rig.
pub struct FrogCoordinator {
    stage: Arc<DelayStage>,
    spectrometer: Arc<dyn Spectrometer>,
    options: CoordinatorOptions,

    events: broadcast::Sender<FrogEvent>,
    motor_guard: DeviceGuard,
    spectrometer_guard: DeviceGuard,
    state: Arc<RwLock<AcquisitionState>>,

    ambient: Arc<RwLock<Vec<f64>>>,
    last_intensities: Arc<RwLock<Vec<f64>>>,
    spectrogram: Arc<RwLock<Option<Spectrogram>>>,

    motion: Mutex<Option<MotionHandle>>,
    spectrum_monitor: Mutex<Option<SpectrumHandle>>,
    scan: Mutex<Option<ScanHandle>>,
}

impl FrogCoordinator {
    /// Build a coordinator for a connected rig.
    pub async fn new(
        stage: Arc<DelayStage>,
        spectrometer: Arc<dyn Spectrometer>,
        options: CoordinatorOptions,
    ) -> FrogResult<Self> {
        let pixels = spectrometer.wavelengths().await?.len();
        let (events, _) = broadcast::channel(1024);
        Ok(Self {
            stage,
            spectrometer,
            options,
            events,
            motor_guard: DeviceGuard::new("motor"),
            spectrometer_guard: DeviceGuard::new("spectrometer"),
            state: Arc::new(RwLock::new(AcquisitionState::Idle)),
            ambient: Arc::new(RwLock::new(vec![0.0; pixels])),
            last_intensities: Arc::new(RwLock::new(vec![0.0; pixels])),
            spectrogram: Arc::new(RwLock::new(None)),
            motion: Mutex::new(None),
            spectrum_monitor: Mutex::new(None),
            scan: Mutex::new(None),
        })
    }

    /// Subscribe to the coordinator's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<FrogEvent> {
        self.events.subscribe()
    }

    /// The delay stage this coordinator owns.
    pub fn stage(&self) -> &Arc<DelayStage> {
        &self.stage
    }

    /// The spectrometer this coordinator owns.
    pub fn spectrometer(&self) -> &Arc<dyn Spectrometer> {
        &self.spectrometer
    }

    /// Current acquisition lifecycle state.
    pub async fn acquisition_state(&self) -> AcquisitionState {
        *self.state.read().await
    }

    /// Snapshot of the current spectrogram, complete or partial. `None`
    /// before the first scan.
    pub async fn spectrogram(&self) -> Option<Spectrogram> {
        self.spectrogram.read().await.clone()
    }

    // -------------------------------------------------------------------
    // Continuous spectrum display
    // -------------------------------------------------------------------

    /// Start free-running spectrum acquisition, or stop it when it is
    /// already running (toggle).
    ///
    /// Fails with `Busy` when the spectrometer is owned by a scan.
    pub async fn start_continuous_spectrum(&self) -> FrogResult<()> {
        let mut slot = self.spectrum_monitor.lock().await;
        if let Some(handle) = slot.take() {
            if !handle.is_finished() {
                handle.stop().await?;
                info!("continuous spectrum update stopped");
                return Ok(());
            }
            // Monitor already died on its own; reap it and start fresh.
            let _ = handle.stop().await;
        }

        let token = self.spectrometer_guard.try_acquire()?;
        let monitor = SpectrumMonitor::new(
            Arc::clone(&self.spectrometer),
            self.events.clone(),
            Arc::clone(&self.last_intensities),
        );
        *slot = Some(monitor.spawn(token));
        info!("continuous spectrum update started");
        Ok(())
    }

    /// Stop free-running spectrum acquisition, waiting until the monitor has
    /// released the device. No-op when not running.
    pub async fn stop_continuous_spectrum(&self) -> FrogResult<()> {
        if let Some(handle) = self.spectrum_monitor.lock().await.take() {
            if handle.is_finished() {
                let _ = handle.stop().await;
            } else {
                handle.stop().await?;
                info!("continuous spectrum update stopped");
            }
        }
        Ok(())
    }

    /// Whether the continuous monitor is currently running.
    pub async fn continuous_spectrum_active(&self) -> bool {
        matches!(&*self.spectrum_monitor.lock().await, Some(handle) if !handle.is_finished())
    }

    // -------------------------------------------------------------------
    // Manual motion
    // -------------------------------------------------------------------

    /// Jog the stage by a relative distance, or stop the active motion/scan
    /// when one is running (toggle).
    pub async fn jog_by_um(&self, delta_um: f64) -> FrogResult<()> {
        if self.stop_if_motion_active().await {
            return Ok(());
        }
        if let Some(max) = self.options.max_jog_um {
            if delta_um.abs() > max {
                return Err(FrogError::Configuration(format!(
                    "jog of {delta_um} um exceeds the {max} um limit"
                )));
            }
        }

        let token = self.motor_guard.try_acquire()?;
        self.stage.move_by_um(delta_um).await?;
        self.spawn_motion(token, None).await;
        Ok(())
    }

    /// Jog the stage by a relative delay in femtoseconds.
    pub async fn jog_by_fs(&self, delta_fs: f64) -> FrogResult<()> {
        self.jog_by_um(delay_fs_to_distance_um(delta_fs)).await
    }

    /// Move to an absolute position, or stop the active motion/scan when one
    /// is running (toggle).
    pub async fn move_to_um(&self, target_um: f64) -> FrogResult<()> {
        if self.stop_if_motion_active().await {
            return Ok(());
        }
        let token = self.motor_guard.try_acquire()?;
        self.stage.move_to_um(target_um).await?;
        self.spawn_motion(token, None).await;
        Ok(())
    }

    /// Move to a delay position relative to T0.
    pub async fn move_to_fs(&self, delay_fs: f64) -> FrogResult<()> {
        let target_um = self.stage.um_for_delay_fs(delay_fs).await;
        self.move_to_um(target_um).await
    }

    /// Home the stage, or stop the active motion/scan when one is running
    /// (toggle).
    pub async fn home(&self) -> FrogResult<()> {
        if self.stop_if_motion_active().await {
            return Ok(());
        }
        let token = self.motor_guard.try_acquire()?;
        self.stage.home().await?;
        self.spawn_motion(token, Some(AcquisitionState::Homing)).await;
        Ok(())
    }

    /// Request a controlled stop of the monitored manual motion, if any.
    /// Idempotent.
    pub async fn stop_motion(&self) {
        if let Some(handle) = &*self.motion.lock().await {
            handle.request_stop();
        }
    }

    // -------------------------------------------------------------------
    // Calibration and baseline
    // -------------------------------------------------------------------

    /// Define the current stage position as zero delay. Fails with `Busy`
    /// while the motor is owned by a motion or scan.
    pub async fn set_t0(&self) -> FrogResult<f64> {
        if self.motor_guard.is_busy() {
            return Err(FrogError::Busy("motor"));
        }
        self.stage.set_t0_to_current().await
    }

    /// Capture the most recently observed raw spectrum as the ambient
    /// baseline.
    pub async fn set_ambient(&self) {
        let last = self.last_intensities.read().await.clone();
        *self.ambient.write().await = last;
        debug!("ambient baseline captured");
    }

    /// Reset the ambient baseline to zero.
    pub async fn zero_ambient(&self) {
        for value in self.ambient.write().await.iter_mut() {
            *value = 0.0;
        }
        debug!("ambient baseline zeroed");
    }

    /// Current ambient baseline (for display).
    pub async fn ambient(&self) -> Vec<f64> {
        self.ambient.read().await.clone()
    }

    // -------------------------------------------------------------------
    // Spectrogram scan
    // -------------------------------------------------------------------

    /// Start a spectrogram scan over `range`, or request cancellation when a
    /// scan or motion is already active (toggle).
    ///
    /// Continuous spectrum polling is stopped (and awaited) first; the scan
    /// then owns both devices until it terminates.
    pub async fn start_scan(&self, range: ScanRange) -> FrogResult<()> {
        {
            let slot = self.scan.lock().await;
            if let Some(handle) = &*slot {
                if !handle.is_finished() {
                    handle.request_stop();
                    info!("scan stop requested");
                    return Ok(());
                }
            }
        }
        if self.stop_if_motion_active().await {
            return Ok(());
        }

        self.stop_continuous_spectrum().await?;

        range.validate()?;
        let t0_um = self.stage.t0_um().await;
        let plan = ScanPlan {
            start_um: range.start_um(t0_um),
            end_um: range.end_um(t0_um),
            step_um: range.step_um(),
            backlash_um: self.options.backlash_um,
        };
        self.stage.check_target_um(plan.start_um)?;
        self.stage.check_target_um(plan.end_um)?;

        let motor_token = self.motor_guard.try_acquire()?;
        let spectrometer_token = self.spectrometer_guard.try_acquire()?;

        let wavelengths = self.spectrometer.wavelengths().await?;
        *self.spectrogram.write().await = Some(Spectrogram::new(wavelengths.to_vec()));

        info!(
            start_um = plan.start_um,
            end_um = plan.end_um,
            step_um = plan.step_um,
            "starting spectrogram scan"
        );

        let task = ScanTask {
            stage: Arc::clone(&self.stage),
            spectrometer: Arc::clone(&self.spectrometer),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            ambient: Arc::clone(&self.ambient),
            last_intensities: Arc::clone(&self.last_intensities),
            spectrogram: Arc::clone(&self.spectrogram),
            plan,
            poll_interval: self.options.poll_interval,
            cancel: Arc::new(AtomicBool::new(false)),
            motor_token,
            spectrometer_token,
        };
        *self.scan.lock().await = Some(task.spawn());
        Ok(())
    }

    /// Request cancellation of the running scan, if any. Idempotent; the
    /// scan still emits its terminal `ScanFinished` event.
    pub async fn stop_scan(&self) {
        if let Some(handle) = &*self.scan.lock().await {
            handle.request_stop();
        }
    }

    /// Whether a scan currently owns the devices.
    pub async fn scan_active(&self) -> bool {
        matches!(&*self.scan.lock().await, Some(handle) if !handle.is_finished())
    }

    // -------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------

    /// Stop every running operation and release both devices.
    pub async fn shutdown(&self) -> FrogResult<()> {
        if let Some(handle) = self.scan.lock().await.take() {
            handle.request_stop();
            let _ = handle.join().await;
        }
        if let Some(handle) = self.motion.lock().await.take() {
            handle.request_stop();
            let _ = handle.join().await;
        }
        self.stop_continuous_spectrum().await?;
        self.stage.close().await?;
        self.spectrometer.close().await?;
        info!("coordinator shut down");
        Ok(())
    }

    // -------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------

    /// Toggle support: when a scan or a monitored motion is active, request
    /// its stop and report `true` so the caller returns without starting
    /// anything.
    async fn stop_if_motion_active(&self) -> bool {
        {
            let slot = self.scan.lock().await;
            if let Some(handle) = &*slot {
                if !handle.is_finished() {
                    handle.request_stop();
                    return true;
                }
            }
        }
        let slot = self.motion.lock().await;
        if let Some(handle) = &*slot {
            if !handle.is_finished() {
                handle.request_stop();
                return true;
            }
        }
        false
    }

    /// Spawn a motion monitor for a command that was just issued, optionally
    /// publishing a lifecycle state for its duration.
    async fn spawn_motion(&self, token: GuardToken, entry: Option<AcquisitionState>) {
        // Subscribe before spawning so the reset watcher cannot miss the
        // terminal event.
        let reset_watcher = entry.map(|_| (self.events.subscribe(), Arc::clone(&self.state)));
        if let Some(state) = entry {
            *self.state.write().await = state;
        }

        let monitor = MotionMonitor::new(
            Arc::clone(&self.stage),
            self.events.clone(),
            self.options.poll_interval,
        );
        let handle = monitor.spawn(token);

        if let Some((mut rx, state)) = reset_watcher {
            tokio::spawn(async move {
                while let Ok(event) = rx.recv().await {
                    if event.is_motion_finished() {
                        *state.write().await = AcquisitionState::Idle;
                        break;
                    }
                }
            });
        }

        *self.motion.lock().await = Some(handle);
    }
}
