//! Cooperative interruption token.
//!
//! Threads cannot be preempted, so work that should react to revocation
//! receives an [`Interrupt`] and checks it at its own suspension points.
//! Firing the token wakes every thread blocked in [`Interrupt::sleep`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::CoordinationError;

#[derive(Debug, Default)]
struct InterruptState {
    fired: Mutex<bool>,
    cvar: Condvar,
}

/// Shared, cloneable interruption flag with condvar wake-up.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptState>,
}

impl Interrupt {
    /// Create an unfired token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token and wake all sleepers. Idempotent.
    pub fn interrupt(&self) {
        let mut fired = self.inner.fired.lock();
        *fired = true;
        self.inner.cvar.notify_all();
    }

    /// Whether the token has been fired.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        *self.inner.fired.lock()
    }

    /// Return `Err(Interrupted)` once the token has fired.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Interrupted`] if fired.
    pub fn check(&self) -> Result<(), CoordinationError> {
        if self.is_interrupted() {
            Err(CoordinationError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless interrupted first.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Interrupted`] if the token fires before the time is up.
    pub fn sleep(&self, duration: Duration) -> Result<(), CoordinationError> {
        let deadline = Instant::now() + duration;
        let mut fired = self.inner.fired.lock();
        while !*fired {
            if self.inner.cvar.wait_until(&mut fired, deadline).timed_out() {
                break;
            }
        }
        if *fired {
            Err(CoordinationError::Interrupted)
        } else {
            Ok(())
        }
    }
}
