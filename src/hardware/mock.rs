//! Mock hardware implementations.
//!
//! Simulated devices for testing the coordinator without physical hardware.
//! All mocks use async-safe operations (`tokio::time::sleep`, never
//! `std::thread::sleep`).
//!
//! - [`MockStage`]: linear stage with finite-velocity motion, travel limits
//!   and homing
//! - [`MockSpectrometer`]: emulated fiber spectrometer producing a
//!   sech-shaped line of randomized width, after the lab's bench emulator

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration, Instant};

use crate::error::{FrogError, FrogResult};
use crate::hardware::capabilities::{LinearMotor, Spectrometer};
use crate::hardware::Spectrum;

// =============================================================================
// MockStage - Simulated Linear Stage
// =============================================================================

struct Motion {
    origin_um: f64,
    target_um: f64,
    started: Instant,
}

struct StageState {
    position_um: f64,
    motion: Option<Motion>,
    homed: bool,
}

/// Mock linear stage with finite-velocity motion.
///
/// Moves progress in real time at a configurable speed, so the motion monitor
/// observes a stage that is genuinely "in motion" for a while. Hardware stop
/// commands are counted for assertions on the idempotent-stop guarantee.
///
/// # Example
///
/// ```rust,ignore
/// let stage = MockStage::new().with_speed(50_000.0);
/// stage.move_to_um(100.0).await?;
/// while stage.is_in_motion().await? {}
/// assert!((stage.position_um().await? - 100.0).abs() < 1e-9);
/// ```
pub struct MockStage {
    state: RwLock<StageState>,
    limits_um: (f64, f64),
    velocity_um_per_s: f64,
    stop_commands: AtomicU32,
}

impl MockStage {
    /// Create a stage at 0 um with limits (0, 20000) um and 2 mm/s velocity.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StageState {
                position_um: 0.0,
                motion: None,
                homed: false,
            }),
            limits_um: (0.0, 20_000.0),
            velocity_um_per_s: 2_000.0,
            stop_commands: AtomicU32::new(0),
        }
    }

    /// Set the starting position in microns.
    pub fn with_position(self, position_um: f64) -> Self {
        Self {
            state: RwLock::new(StageState {
                position_um,
                motion: None,
                homed: false,
            }),
            ..self
        }
    }

    /// Set the travel limits in microns.
    pub fn with_limits(mut self, limits_um: (f64, f64)) -> Self {
        self.limits_um = limits_um;
        self
    }

    /// Set the simulated velocity in um/s.
    pub fn with_speed(mut self, velocity_um_per_s: f64) -> Self {
        self.velocity_um_per_s = velocity_um_per_s;
        self
    }

    /// Number of hardware stop commands received so far.
    pub fn stop_commands(&self) -> u32 {
        self.stop_commands.load(Ordering::SeqCst)
    }

    /// Whether the stage has completed a homing sequence.
    pub async fn is_homed(&self) -> bool {
        self.state.read().await.homed
    }

    /// Advance the simulation: fold a completed motion into the settled
    /// position, or report the live position of an ongoing one.
    fn live_position(state: &StageState, velocity_um_per_s: f64) -> (f64, bool) {
        match &state.motion {
            None => (state.position_um, false),
            Some(m) => {
                let total = (m.target_um - m.origin_um).abs();
                let traveled = m.started.elapsed().as_secs_f64() * velocity_um_per_s;
                if traveled >= total {
                    (m.target_um, false)
                } else {
                    let dir = (m.target_um - m.origin_um).signum();
                    (m.origin_um + dir * traveled, true)
                }
            }
        }
    }

    async fn settle(&self) -> (f64, bool) {
        let mut state = self.state.write().await;
        let (pos, moving) = Self::live_position(&state, self.velocity_um_per_s);
        if !moving {
            state.position_um = pos;
            state.motion = None;
        }
        (pos, moving)
    }

    async fn begin_motion(&self, target_um: f64) -> FrogResult<()> {
        if target_um < self.limits_um.0 || target_um > self.limits_um.1 {
            return Err(FrogError::OutOfBounds {
                predicted_um: target_um,
                lower_um: self.limits_um.0,
                upper_um: self.limits_um.1,
            });
        }
        let (current, _) = self.settle().await;
        let mut state = self.state.write().await;
        state.position_um = current;
        state.motion = Some(Motion {
            origin_um: current,
            target_um,
            started: Instant::now(),
        });
        Ok(())
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinearMotor for MockStage {
    async fn position_um(&self) -> FrogResult<f64> {
        let (pos, _) = self.settle().await;
        Ok(pos)
    }

    async fn move_to_um(&self, target_um: f64) -> FrogResult<()> {
        self.begin_motion(target_um).await
    }

    async fn move_by_um(&self, delta_um: f64) -> FrogResult<()> {
        let (current, _) = self.settle().await;
        self.begin_motion(current + delta_um).await
    }

    async fn home(&self) -> FrogResult<()> {
        self.begin_motion(self.limits_um.0.max(0.0)).await?;
        let mut state = self.state.write().await;
        state.homed = true;
        Ok(())
    }

    async fn is_in_motion(&self) -> FrogResult<bool> {
        let (_, moving) = self.settle().await;
        Ok(moving)
    }

    async fn stop(&self) -> FrogResult<()> {
        self.stop_commands.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().await;
        let (pos, _) = Self::live_position(&state, self.velocity_um_per_s);
        state.position_um = pos;
        state.motion = None;
        Ok(())
    }

    fn travel_limits_um(&self) -> (f64, f64) {
        self.limits_um
    }

    async fn close(&self) -> FrogResult<()> {
        Ok(())
    }
}

// =============================================================================
// MockSpectrometer - Emulated Fiber Spectrometer
// =============================================================================

/// Mock spectrometer producing a sech-shaped spectral line.
///
/// The emitted line is `1 / cosh((wl - 750) / w)` over 350-1150 nm with a
/// randomized width `w` per acquisition, matching the bench emulator used
/// before real hardware was available. A fixed profile can be substituted for
/// deterministic tests, and reads can be scripted to fail after N successes
/// to exercise mid-scan abort paths.
pub struct MockSpectrometer {
    wavelengths: Arc<[f64]>,
    profile: Option<Vec<f64>>,
    integration_time_us: RwLock<u64>,
    integration_limits_us: (u64, u64),
    scans_to_avg: RwLock<u32>,
    fail_after: Option<u64>,
    reads: AtomicU64,
}

impl MockSpectrometer {
    /// Create an emulator with 2048 pixels over 350-1150 nm.
    pub fn new() -> Self {
        Self::with_pixels(2048)
    }

    /// Create an emulator with a custom pixel count.
    pub fn with_pixels(pixels: usize) -> Self {
        let n = pixels.max(2);
        let wavelengths: Arc<[f64]> = (0..n)
            .map(|i| 350.0 + 800.0 * i as f64 / (n - 1) as f64)
            .collect::<Vec<_>>()
            .into();
        Self {
            wavelengths,
            profile: None,
            integration_time_us: RwLock::new(30_000),
            integration_limits_us: (1_000, 10_000_000),
            scans_to_avg: RwLock::new(1),
            fail_after: None,
            reads: AtomicU64::new(0),
        }
    }

    /// Replace the emulated line with a fixed intensity profile.
    ///
    /// The profile length becomes the pixel count; the wavelength axis is
    /// regenerated to match.
    pub fn with_profile(mut self, profile: Vec<f64>) -> Self {
        let n = profile.len().max(2);
        self.wavelengths = (0..n)
            .map(|i| 350.0 + 800.0 * i as f64 / (n - 1) as f64)
            .collect::<Vec<_>>()
            .into();
        self.profile = Some(profile);
        self
    }

    /// Fail every acquisition after `n` successful reads with a
    /// communications error.
    pub fn fail_after(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Number of successful acquisitions so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn emulated_line(&self) -> Vec<f64> {
        if let Some(profile) = &self.profile {
            return profile.clone();
        }
        let width = 25.0 + 5.0 * rand::thread_rng().gen::<f64>();
        self.wavelengths
            .iter()
            .map(|wl| 1.0 / ((wl - 750.0) / width).cosh())
            .collect()
    }
}

impl Default for MockSpectrometer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Spectrometer for MockSpectrometer {
    async fn wavelengths(&self) -> FrogResult<Arc<[f64]>> {
        Ok(Arc::clone(&self.wavelengths))
    }

    async fn intensities(&self) -> FrogResult<Vec<f64>> {
        if let Some(limit) = self.fail_after {
            if self.reads.load(Ordering::SeqCst) >= limit {
                return Err(FrogError::DeviceComms(
                    "spectrometer read timed out".into(),
                ));
            }
        }

        // Simulate the integration window, capped so tests stay quick.
        let itime_us = *self.integration_time_us.read().await;
        sleep(Duration::from_micros(itime_us.min(50_000))).await;

        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.emulated_line())
    }

    async fn spectrum(&self) -> FrogResult<Spectrum> {
        let intensities = self.intensities().await?;
        Ok(Spectrum::new(Arc::clone(&self.wavelengths), intensities))
    }

    async fn integration_time_micros(&self) -> u64 {
        *self.integration_time_us.read().await
    }

    async fn set_integration_time_micros(&self, micros: u64) -> FrogResult<()> {
        let (min_us, max_us) = self.integration_limits_us;
        if micros < min_us || micros > max_us {
            return Err(FrogError::IntegrationTime {
                requested_us: micros,
                min_us,
                max_us,
            });
        }
        *self.integration_time_us.write().await = micros;
        Ok(())
    }

    fn integration_time_micros_limit(&self) -> (u64, u64) {
        self.integration_limits_us
    }

    async fn scans_to_avg(&self) -> u32 {
        *self.scans_to_avg.read().await
    }

    async fn set_scans_to_avg(&self, n: u32) -> FrogResult<()> {
        if n < 1 {
            return Err(FrogError::AverageCount(n));
        }
        *self.scans_to_avg.write().await = n;
        Ok(())
    }

    async fn close(&self) -> FrogResult<()> {
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_settled(stage: &MockStage) {
        while stage.is_in_motion().await.unwrap() {
            sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn stage_absolute_move_reaches_target() {
        let stage = MockStage::new().with_speed(500_000.0);
        stage.move_to_um(150.0).await.unwrap();
        wait_settled(&stage).await;
        assert!((stage.position_um().await.unwrap() - 150.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stage_relative_moves_accumulate() {
        let stage = MockStage::new()
            .with_position(100.0)
            .with_speed(500_000.0);
        stage.move_by_um(25.0).await.unwrap();
        wait_settled(&stage).await;
        stage.move_by_um(-10.0).await.unwrap();
        wait_settled(&stage).await;
        assert!((stage.position_um().await.unwrap() - 115.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stage_rejects_out_of_bounds_target() {
        let stage = MockStage::new().with_limits((0.0, 200.0));
        let err = stage.move_to_um(500.0).await.unwrap_err();
        assert!(matches!(err, FrogError::OutOfBounds { .. }));
        assert!(!stage.is_in_motion().await.unwrap());
    }

    #[tokio::test]
    async fn stage_is_in_motion_during_slow_move() {
        let stage = MockStage::new().with_speed(100.0);
        stage.move_to_um(1_000.0).await.unwrap();
        assert!(stage.is_in_motion().await.unwrap());
        stage.stop().await.unwrap();
        assert!(!stage.is_in_motion().await.unwrap());
        assert_eq!(stage.stop_commands(), 1);
    }

    #[tokio::test]
    async fn stage_homing_sets_flag() {
        let stage = MockStage::new()
            .with_position(500.0)
            .with_speed(500_000.0);
        stage.home().await.unwrap();
        wait_settled(&stage).await;
        assert!(stage.is_homed().await);
        assert!((stage.position_um().await.unwrap()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn spectrometer_emits_line_peaked_at_750nm() {
        let spec = MockSpectrometer::with_pixels(256);
        spec.set_integration_time_micros(1_000).await.unwrap();
        let sample = spec.spectrum().await.unwrap();
        assert_eq!(sample.len(), 256);

        let (peak_idx, _) = sample
            .intensities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        let peak_wl = sample.wavelengths[peak_idx];
        assert!((peak_wl - 750.0).abs() < 10.0, "peak at {peak_wl} nm");
    }

    #[tokio::test]
    async fn spectrometer_rejects_bad_integration_time() {
        let spec = MockSpectrometer::new();
        let before = spec.integration_time_micros().await;
        let err = spec.set_integration_time_micros(10).await.unwrap_err();
        assert!(matches!(err, FrogError::IntegrationTime { .. }));
        // Previous value retained on rejection.
        assert_eq!(spec.integration_time_micros().await, before);
    }

    #[tokio::test]
    async fn spectrometer_rejects_zero_average_count() {
        let spec = MockSpectrometer::new();
        let err = spec.set_scans_to_avg(0).await.unwrap_err();
        assert!(matches!(err, FrogError::AverageCount(0)));
        assert_eq!(spec.scans_to_avg().await, 1);
    }

    #[tokio::test]
    async fn spectrometer_scripted_failure() {
        let spec = MockSpectrometer::with_pixels(16).fail_after(2);
        spec.set_integration_time_micros(1_000).await.unwrap();
        spec.intensities().await.unwrap();
        spec.intensities().await.unwrap();
        let err = spec.intensities().await.unwrap_err();
        assert!(matches!(err, FrogError::DeviceComms(_)));
        assert_eq!(spec.reads(), 2);
    }
}
