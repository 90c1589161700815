//! Mutually-exclusive device access guards.
//!
//! Each physical device gets one [`DeviceGuard`]: an atomic busy flag that is
//! check-and-set before any long-running operation touches the device.
//! Acquisition yields a [`GuardToken`] that moves into the monitor task and
//! releases the flag on drop. The flag is therefore cleared only by the task
//! that was actually talking to the device; an external canceller can never
//! release a device it does not own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::error::{FrogError, FrogResult};

/// Busy flag for one physical device.
#[derive(Clone, Debug)]
pub struct DeviceGuard {
    name: &'static str,
    busy: Arc<AtomicBool>,
}

impl DeviceGuard {
    /// Create an idle guard for the named device.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the device is currently owned by an operation.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Atomically claim the device. Fails with
    /// [`FrogError::Busy`] when another operation holds it.
    pub fn try_acquire(&self) -> FrogResult<GuardToken> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FrogError::Busy(self.name));
        }
        trace!(device = self.name, "guard acquired");
        Ok(GuardToken {
            name: self.name,
            busy: Arc::clone(&self.busy),
        })
    }
}

/// Exclusive ownership of a device, released on drop.
#[derive(Debug)]
pub struct GuardToken {
    name: &'static str,
    busy: Arc<AtomicBool>,
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
        trace!(device = self.name, "guard released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let guard = DeviceGuard::new("motor");
        let token = guard.try_acquire().unwrap();
        assert!(guard.is_busy());
        assert!(matches!(guard.try_acquire(), Err(FrogError::Busy("motor"))));
        drop(token);
        assert!(!guard.is_busy());
        guard.try_acquire().unwrap();
    }

    #[test]
    fn clones_share_the_flag() {
        let guard = DeviceGuard::new("spectrometer");
        let alias = guard.clone();
        let _token = guard.try_acquire().unwrap();
        assert!(alias.is_busy());
        assert!(alias.try_acquire().is_err());
    }
}
