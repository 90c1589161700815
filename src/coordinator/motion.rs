//! Background monitor for stage motion.
//!
//! Polls the motor until motion ceases, publishing live positions and a
//! single terminal [`FrogEvent::MotionFinished`]. The monitor either runs as
//! a spawned task (manual jogs, absolute moves, homing) or is awaited inline
//! by the scan sequencer as its step continuation.
//!
//! Stop discipline: callers only ever set an atomic request flag. The poll
//! loop is the sole site that writes the stop command to the hardware link,
//! guarded by a `stop_issued` latch, so repeated stop requests issue
//! exactly one hardware stop, and the stop command never races a position
//! query on the same link. The loop exits naturally once the device reports
//! motion has ceased.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::coordinator::guards::GuardToken;
use crate::error::{FrogError, FrogResult};
use crate::messages::FrogEvent;
use crate::stage::DelayStage;

/// Floor on the poll cadence so a tight loop cannot saturate the link.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Poll-until-settled monitor for one motion.
pub struct MotionMonitor {
    stage: Arc<DelayStage>,
    events: broadcast::Sender<FrogEvent>,
    stop_requested: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl MotionMonitor {
    /// Create a monitor for a motion that has just been commanded.
    pub fn new(
        stage: Arc<DelayStage>,
        events: broadcast::Sender<FrogEvent>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            stage,
            events,
            stop_requested: Arc::new(AtomicBool::new(false)),
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }

    /// Shared flag observed by the poll loop; setting it requests a stop.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_requested)
    }

    /// Run the monitor to completion, returning the final position.
    ///
    /// Emits `MotionProgress` while the stage moves and exactly one
    /// `MotionFinished` on exit, tagged with the error kind if the hardware
    /// link failed mid-monitor.
    pub async fn run(&self) -> FrogResult<f64> {
        let outcome = self.poll_loop().await;
        match &outcome {
            Ok(position_um) => {
                let _ = self.events.send(FrogEvent::MotionFinished {
                    position_um: *position_um,
                    error: None,
                });
            }
            Err(err) => {
                warn!(error = %err, "motion monitor terminated on hardware error");
                let _ = self.events.send(FrogEvent::MotionFinished {
                    position_um: self.stage.cached_position_um().await,
                    error: Some(err.kind()),
                });
            }
        }
        outcome
    }

    async fn poll_loop(&self) -> FrogResult<f64> {
        let mut stop_issued = false;

        while self.stage.is_in_motion().await? {
            // One request at a time: the stop write happens here, in the
            // loop body, never from the caller's context.
            if self.stop_requested.load(Ordering::Acquire) && !stop_issued {
                debug!("issuing hardware stop");
                self.stage.stop().await?;
                stop_issued = true;
            }

            let position_um = self.stage.position_um().await?;
            let _ = self.events.send(FrogEvent::MotionProgress { position_um });

            sleep(self.poll_interval).await;
        }

        // One final authoritative read after the device settles.
        let position_um = self.stage.position_um().await?;
        let _ = self.events.send(FrogEvent::MotionProgress { position_um });
        Ok(position_um)
    }

    /// Run the monitor on its own task, carrying the motor guard token until
    /// the loop exits.
    pub fn spawn(self, token: GuardToken) -> MotionHandle {
        let stop_requested = Arc::clone(&self.stop_requested);
        let task = tokio::spawn(async move {
            let result = self.run().await;
            drop(token);
            result
        });
        MotionHandle {
            stop_requested,
            task,
        }
    }
}

/// Caller-side handle to a spawned motion monitor.
#[derive(Debug)]
pub struct MotionHandle {
    stop_requested: Arc<AtomicBool>,
    task: JoinHandle<FrogResult<f64>>,
}

impl MotionHandle {
    /// Request a controlled stop. Safe to call any number of times; the
    /// monitor issues at most one hardware stop command.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    /// Whether the monitor task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the monitor to exit, returning the final position.
    pub async fn join(self) -> FrogResult<f64> {
        self.task
            .await
            .map_err(|err| FrogError::DeviceComms(format!("motion monitor task failed: {err}")))?
    }
}
