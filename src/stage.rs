//! Delay-domain wrapper around a raw linear motor.
//!
//! [`DelayStage`] owns everything the bare [`LinearMotor`] contract does not:
//! the persisted time-zero reference, femtosecond/micron conversions, and the
//! single safety chokepoint every move request passes through. Jogs, absolute
//! moves and scan steps all funnel into the same predicted-position check, so
//! there is exactly one place that can reject a command as out of bounds.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::calibration::TimeZeroStore;
use crate::error::{FrogError, FrogResult};
use crate::hardware::capabilities::LinearMotor;
use crate::units::{delay_fs_to_distance_um, distance_um_to_delay_fs};

/// Default distance kept between any commanded position and the travel
/// limits, in microns.
pub const DEFAULT_EDGE_BUFFER_UM: f64 = 1.0;

/// A linear motor augmented with the T0 reference and delay conversions.
pub struct DelayStage {
    motor: Arc<dyn LinearMotor>,
    t0_um: RwLock<f64>,
    store: Option<TimeZeroStore>,
    edge_buffer_um: f64,
    cached_um: RwLock<f64>,
}

impl DelayStage {
    /// Wrap a connected motor, loading T0 from the store.
    ///
    /// When the store holds no calibration (first run), T0 defaults to the
    /// stage's current position and is written back immediately.
    pub async fn connect(
        motor: Arc<dyn LinearMotor>,
        store: TimeZeroStore,
        edge_buffer_um: f64,
    ) -> FrogResult<Self> {
        let position = motor.position_um().await?;
        let t0_um = match store.load()? {
            Some(value) => value,
            None => {
                store.save(position)?;
                info!(t0_um = position, "no stored T0, defaulting to current position");
                position
            }
        };
        Ok(Self {
            motor,
            t0_um: RwLock::new(t0_um),
            store: Some(store),
            edge_buffer_um,
            cached_um: RwLock::new(position),
        })
    }

    /// Wrap a motor with an explicit T0 and no persistence (tests, dry runs).
    pub async fn with_t0(
        motor: Arc<dyn LinearMotor>,
        t0_um: f64,
        edge_buffer_um: f64,
    ) -> FrogResult<Self> {
        let position = motor.position_um().await?;
        Ok(Self {
            motor,
            t0_um: RwLock::new(t0_um),
            store: None,
            edge_buffer_um,
            cached_um: RwLock::new(position),
        })
    }

    /// Authoritative position read from hardware, in microns. Refreshes the
    /// advisory cache.
    pub async fn position_um(&self) -> FrogResult<f64> {
        let pos = self.motor.position_um().await?;
        *self.cached_um.write().await = pos;
        Ok(pos)
    }

    /// Last position observed from hardware. Advisory only; refresh with
    /// [`position_um`](DelayStage::position_um) after any move.
    pub async fn cached_position_um(&self) -> f64 {
        *self.cached_um.read().await
    }

    /// Current position expressed as optical delay relative to T0.
    pub async fn position_fs(&self) -> FrogResult<f64> {
        let pos = self.position_um().await?;
        Ok(self.delay_at_um(pos).await)
    }

    /// The time-zero stage position in microns.
    pub async fn t0_um(&self) -> f64 {
        *self.t0_um.read().await
    }

    /// Redefine T0 to an explicit stage position, persisting it.
    pub async fn set_t0_um(&self, t0_um: f64) -> FrogResult<()> {
        *self.t0_um.write().await = t0_um;
        if let Some(store) = &self.store {
            store.save(t0_um)?;
        }
        info!(t0_um, "T0 updated");
        Ok(())
    }

    /// Redefine T0 as the current stage position. Returns the new T0.
    pub async fn set_t0_to_current(&self) -> FrogResult<f64> {
        let pos = self.position_um().await?;
        self.set_t0_um(pos).await?;
        Ok(pos)
    }

    /// Optical delay of a stage position, in femtoseconds.
    pub async fn delay_at_um(&self, position_um: f64) -> f64 {
        distance_um_to_delay_fs(position_um - self.t0_um().await)
    }

    /// Stage position corresponding to an optical delay, in microns.
    pub async fn um_for_delay_fs(&self, delay_fs: f64) -> f64 {
        delay_fs_to_distance_um(delay_fs) + self.t0_um().await
    }

    /// The chokepoint: reject any predicted position outside the travel
    /// limits shrunk by the edge buffer. Rejection leaves all state unchanged.
    fn ensure_within_limits(&self, predicted_um: f64) -> FrogResult<()> {
        let (lower, upper) = self.motor.travel_limits_um();
        let lower_ok = lower + self.edge_buffer_um;
        let upper_ok = upper - self.edge_buffer_um;
        if predicted_um < lower_ok || predicted_um > upper_ok {
            return Err(FrogError::OutOfBounds {
                predicted_um,
                lower_um: lower_ok,
                upper_um: upper_ok,
            });
        }
        Ok(())
    }

    /// Check a prospective absolute position against the buffered envelope
    /// without commanding anything.
    pub fn check_target_um(&self, target_um: f64) -> FrogResult<()> {
        self.ensure_within_limits(target_um)
    }

    /// Command a relative move, checked against the predicted resulting
    /// position. Non-blocking.
    pub async fn move_by_um(&self, delta_um: f64) -> FrogResult<()> {
        let current = self.position_um().await?;
        self.ensure_within_limits(current + delta_um)?;
        self.motor.move_by_um(delta_um).await
    }

    /// Command an absolute move, checked against the target. Non-blocking.
    pub async fn move_to_um(&self, target_um: f64) -> FrogResult<()> {
        // Refresh the cache before the move starts.
        self.position_um().await?;
        self.ensure_within_limits(target_um)?;
        self.motor.move_to_um(target_um).await
    }

    /// Command a relative move expressed in femtoseconds of delay.
    pub async fn move_by_fs(&self, delta_fs: f64) -> FrogResult<()> {
        self.move_by_um(delay_fs_to_distance_um(delta_fs)).await
    }

    /// Command an absolute move to a delay position relative to T0.
    pub async fn move_to_fs(&self, delay_fs: f64) -> FrogResult<()> {
        let target = self.um_for_delay_fs(delay_fs).await;
        self.move_to_um(target).await
    }

    /// Start the homing sequence. Non-blocking.
    pub async fn home(&self) -> FrogResult<()> {
        self.motor.home().await
    }

    /// True while the stage is moving.
    pub async fn is_in_motion(&self) -> FrogResult<bool> {
        self.motor.is_in_motion().await
    }

    /// Command the stage to stop. Non-blocking.
    pub async fn stop(&self) -> FrogResult<()> {
        self.motor.stop().await
    }

    /// Soft travel limits of the underlying motor.
    pub fn travel_limits_um(&self) -> (f64, f64) {
        self.motor.travel_limits_um()
    }

    /// Release the underlying hardware link.
    pub async fn close(&self) -> FrogResult<()> {
        self.motor.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockStage;
    use tokio::time::{sleep, Duration};

    async fn settled(stage: &DelayStage) {
        while stage.is_in_motion().await.unwrap() {
            sleep(Duration::from_millis(1)).await;
        }
    }

    fn fast_stage(position_um: f64) -> Arc<MockStage> {
        Arc::new(
            MockStage::new()
                .with_position(position_um)
                .with_limits((0.0, 20_000.0))
                .with_speed(1_000_000.0),
        )
    }

    #[tokio::test]
    async fn bounds_enforced_on_predicted_position() {
        let stage = DelayStage::with_t0(fast_stage(100.0), 0.0, DEFAULT_EDGE_BUFFER_UM)
            .await
            .unwrap();

        let err = stage.move_by_um(-200.0).await.unwrap_err();
        assert!(matches!(err, FrogError::OutOfBounds { .. }));
        // Rejected command left the position unchanged.
        assert!((stage.position_um().await.unwrap() - 100.0).abs() < 1e-9);

        stage.move_by_um(200.0).await.unwrap();
        settled(&stage).await;
        assert!((stage.position_um().await.unwrap() - 300.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn edge_buffer_shrinks_envelope() {
        let stage = DelayStage::with_t0(fast_stage(10.0), 0.0, 25.0).await.unwrap();
        // Target 5 um is within the raw limits but violates the 25 um buffer.
        let err = stage.move_to_um(5.0).await.unwrap_err();
        assert!(matches!(err, FrogError::OutOfBounds { .. }));
    }

    #[tokio::test]
    async fn delay_positions_reference_t0() {
        let stage = DelayStage::with_t0(fast_stage(1_000.0), 1_000.0, 1.0)
            .await
            .unwrap();
        assert!(stage.position_fs().await.unwrap().abs() < 1e-9);

        stage.move_by_fs(100.0).await.unwrap();
        settled(&stage).await;
        let fs = stage.position_fs().await.unwrap();
        assert!((fs - 100.0).abs() < 1e-6, "delay was {fs} fs");
    }

    #[tokio::test]
    async fn t0_defaults_to_current_position_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("T0_um.txt");

        {
            let store = TimeZeroStore::new(&path);
            let stage = DelayStage::connect(fast_stage(432.0), store, 1.0)
                .await
                .unwrap();
            assert!((stage.t0_um().await - 432.0).abs() < 1e-9);
        }

        // A later session with a different physical position loads the stored
        // calibration instead of re-defaulting.
        {
            let store = TimeZeroStore::new(&path);
            let stage = DelayStage::connect(fast_stage(5_000.0), store, 1.0)
                .await
                .unwrap();
            assert!((stage.t0_um().await - 432.0).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn set_t0_rewrites_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("T0_um.txt");
        let store = TimeZeroStore::new(&path);

        let stage = DelayStage::connect(fast_stage(100.0), store.clone(), 1.0)
            .await
            .unwrap();
        stage.move_to_um(250.0).await.unwrap();
        settled(&stage).await;

        let new_t0 = stage.set_t0_to_current().await.unwrap();
        assert!((new_t0 - 250.0).abs() < 1e-9);
        assert_eq!(store.load().unwrap(), Some(new_t0));
    }
}
