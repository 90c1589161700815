//! Spectrogram acquisition sequencer.
//!
//! Drives the stage across a resolved scan plan, sampling the spectrometer at
//! every stop. The sequencer is an explicit state machine on a single async
//! task: each step waits for the motion monitor to report the stage settled,
//! then re-enters the loop, so the stack stays bounded and every cancellation
//! point is explicit.
//!
//! Sequencing guarantees:
//! - Strict alternation: sample `i` is fully emitted (position read,
//!   background subtraction, event send) before move `i+1` is issued.
//! - The cancel flag is consulted only at the top of each step; an in-flight
//!   move is never interrupted, but no further step is scheduled.
//! - Every termination path (end of range, cancellation, hardware failure)
//!   emits exactly one [`FrogEvent::ScanFinished`], and rows collected before
//!   the termination remain retrievable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::coordinator::guards::GuardToken;
use crate::coordinator::motion::MotionMonitor;
use crate::error::{FrogError, FrogResult};
use crate::hardware::capabilities::Spectrometer;
use crate::hardware::Spectrum;
use crate::messages::FrogEvent;
use crate::spectrogram::{subtract_ambient, Spectrogram};
use crate::stage::DelayStage;

/// Lifecycle of the acquisition coordinator.
///
/// Exactly one coordinator instance is active per physical rig; the state is
/// created `Idle` at startup and returns to `Idle` after every scan, whether
/// it completed, was cancelled, or failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionState {
    /// No acquisition in progress.
    Idle,
    /// Homing sequence running.
    Homing,
    /// Stage traveling to the scan start position.
    MovingToStart,
    /// Scan running; carries the index of the step being acquired.
    Scanning(usize),
    /// Stop requested, scan winding down.
    Stopping,
    /// Terminal bookkeeping before returning to `Idle`.
    Finished,
}

impl std::fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionState::Idle => write!(f, "Idle"),
            AcquisitionState::Homing => write!(f, "Homing"),
            AcquisitionState::MovingToStart => write!(f, "MovingToStart"),
            AcquisitionState::Scanning(step) => write!(f, "Scanning({step})"),
            AcquisitionState::Stopping => write!(f, "Stopping"),
            AcquisitionState::Finished => write!(f, "Finished"),
        }
    }
}

impl AcquisitionState {
    /// True while a scan owns the devices.
    pub fn is_scanning(&self) -> bool {
        matches!(
            self,
            AcquisitionState::MovingToStart
                | AcquisitionState::Scanning(_)
                | AcquisitionState::Stopping
        )
    }
}

/// End-position comparisons use a fixed decimal rounding so float noise in
/// the position readout cannot produce a spurious extra step.
fn round3(value: f64) -> f64 {
    (value * 1_000.0).round() / 1_000.0
}

/// A scan range resolved against T0 into absolute stage coordinates.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ScanPlan {
    pub start_um: f64,
    pub end_um: f64,
    pub step_um: f64,
    pub backlash_um: f64,
}

impl ScanPlan {
    fn direction(&self) -> f64 {
        self.step_um.signum()
    }

    fn past_end(&self, position_um: f64) -> bool {
        if self.direction() > 0.0 {
            round3(position_um) > round3(self.end_um)
        } else {
            round3(position_um) < round3(self.end_um)
        }
    }
}

/// One scan's worth of work, run to completion on its own task.
pub(crate) struct ScanTask {
    pub stage: Arc<DelayStage>,
    pub spectrometer: Arc<dyn Spectrometer>,
    pub events: broadcast::Sender<FrogEvent>,
    pub state: Arc<RwLock<AcquisitionState>>,
    pub ambient: Arc<RwLock<Vec<f64>>>,
    pub last_intensities: Arc<RwLock<Vec<f64>>>,
    pub spectrogram: Arc<RwLock<Option<Spectrogram>>>,
    pub plan: ScanPlan,
    pub poll_interval: Duration,
    pub cancel: Arc<AtomicBool>,
    pub motor_token: GuardToken,
    pub spectrometer_token: GuardToken,
}

impl ScanTask {
    pub(crate) fn spawn(self) -> ScanHandle {
        let cancel = Arc::clone(&self.cancel);
        let task = tokio::spawn(self.run());
        ScanHandle { cancel, task }
    }

    async fn run(self) {
        let result = self.execute().await;
        let error = result.as_ref().err().map(FrogError::kind);
        match &result {
            Ok(()) => info!("scan finished"),
            Err(err) => warn!(error = %err, "scan aborted"),
        }

        self.set_state(AcquisitionState::Finished).await;
        let _ = self.events.send(FrogEvent::ScanFinished { error });
        self.set_state(AcquisitionState::Idle).await;
        // Guard tokens drop here, releasing both devices.
    }

    async fn execute(&self) -> FrogResult<()> {
        self.set_state(AcquisitionState::MovingToStart).await;
        self.approach_start().await?;

        let mut step_index = 0usize;
        loop {
            // The only cancellation point: nothing past this line runs for a
            // cancelled scan, and rows already collected stay in place.
            if self.cancel.swap(false, Ordering::AcqRel) {
                self.set_state(AcquisitionState::Stopping).await;
                debug!(steps_collected = step_index, "scan cancelled");
                return Ok(());
            }

            let position_um = self.stage.position_um().await?;
            if self.plan.past_end(position_um) {
                break;
            }

            self.set_state(AcquisitionState::Scanning(step_index)).await;

            let raw = self.spectrometer.spectrum().await?;
            self.last_intensities
                .write()
                .await
                .clone_from(&raw.intensities);

            let corrected = {
                let ambient = self.ambient.read().await;
                subtract_ambient(&raw.intensities, &ambient)
            };
            let delay_fs = self.stage.delay_at_um(position_um).await;

            if let Some(gram) = self.spectrogram.write().await.as_mut() {
                gram.push_row(delay_fs, corrected.clone());
            }

            let sample = Spectrum {
                wavelengths: Arc::clone(&raw.wavelengths),
                intensities: corrected,
                timestamp: raw.timestamp,
            };
            let _ = self.events.send(FrogEvent::ScanSample {
                spectrum: Arc::new(sample),
                step_index,
                delay_fs,
            });
            info!(step = step_index, position_um, delay_fs, "scan step acquired");

            self.stage.move_by_um(self.plan.step_um).await?;
            self.wait_motion().await?;
            step_index += 1;
        }

        Ok(())
    }

    /// Move to the scan start, always arriving in the scan direction.
    ///
    /// The stage first overshoots to `start - backlash` and re-approaches, so
    /// mechanical play is taken up the same way for the start position as for
    /// every subsequent step. The overshoot is skipped when it would leave
    /// the travel envelope.
    async fn approach_start(&self) -> FrogResult<()> {
        if self.plan.backlash_um > 0.0 {
            let pre_target = self.plan.start_um - self.plan.backlash_um * self.plan.direction();
            match self.stage.move_to_um(pre_target).await {
                Ok(()) => {
                    self.wait_motion().await?;
                }
                Err(FrogError::OutOfBounds { .. }) => {
                    debug!(pre_target, "backlash overshoot outside limits, approaching directly");
                }
                Err(err) => return Err(err),
            }
            if self.cancel.load(Ordering::Acquire) {
                return Ok(());
            }
        }

        self.stage.move_to_um(self.plan.start_um).await?;
        self.wait_motion().await?;
        Ok(())
    }

    async fn wait_motion(&self) -> FrogResult<f64> {
        MotionMonitor::new(
            Arc::clone(&self.stage),
            self.events.clone(),
            self.poll_interval,
        )
        .run()
        .await
    }

    async fn set_state(&self, state: AcquisitionState) {
        *self.state.write().await = state;
    }
}

/// Caller-side handle to a running scan.
#[derive(Debug)]
pub struct ScanHandle {
    cancel: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ScanHandle {
    /// Request cancellation; observed at the top of the next step.
    pub fn request_stop(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Whether the scan task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the scan task to exit.
    pub async fn join(self) -> FrogResult<()> {
        self.task
            .await
            .map_err(|err| FrogError::DeviceComms(format!("scan task failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounded_end_comparison_absorbs_float_noise() {
        let plan = ScanPlan {
            start_um: 1_000.0,
            end_um: 1_010.0,
            step_um: 2.0,
            backlash_um: 0.0,
        };
        // A readout a hair above the end position is not "past" it.
        assert!(!plan.past_end(1_010.000_4));
        assert!(plan.past_end(1_010.001));
        assert!(!plan.past_end(1_008.0));
    }

    #[test]
    fn past_end_respects_scan_direction() {
        let plan = ScanPlan {
            start_um: 1_010.0,
            end_um: 1_000.0,
            step_um: -2.0,
            backlash_um: 0.0,
        };
        assert!(!plan.past_end(1_005.0));
        assert!(plan.past_end(999.5));
    }

    #[test]
    fn scanning_states_report_active() {
        assert!(AcquisitionState::MovingToStart.is_scanning());
        assert!(AcquisitionState::Scanning(3).is_scanning());
        assert!(AcquisitionState::Stopping.is_scanning());
        assert!(!AcquisitionState::Idle.is_scanning());
        assert!(!AcquisitionState::Homing.is_scanning());
        assert_eq!(AcquisitionState::Scanning(2).to_string(), "Scanning(2)");
    }
}
