//! Allocation wrapper that records every observed state.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::allocation::{Allocation, AllocationService, AllocationState, ListenerId, RemoteAllocation};
use crate::core::{CoordinationError, Interrupt};

use super::{Executable, StateLog};

/// Schedules one allocation and lets callers wait for its states.
pub struct AllocatableResource {
    remote: RemoteAllocation,
    log: Arc<StateLog>,
    listener: Mutex<Option<ListenerId>>,
}

impl AllocatableResource {
    /// Wrap `allocation` in a fresh proxy.
    #[must_use]
    pub fn new(service: Arc<AllocationService>, allocation: Allocation) -> Self {
        Self {
            remote: RemoteAllocation::new(service, allocation),
            log: Arc::new(StateLog::new()),
            listener: Mutex::new(None),
        }
    }

    /// Underlying proxy.
    #[must_use]
    pub const fn remote(&self) -> &RemoteAllocation {
        &self.remote
    }

    /// Latest logged state; `None` before startup.
    #[must_use]
    pub fn state(&self) -> Option<AllocationState> {
        self.log.last()
    }

    /// Every state logged so far.
    #[must_use]
    pub fn history(&self) -> Vec<AllocationState> {
        self.log.history()
    }

    /// Block until `state` has been observed.
    pub fn await_state(&self, state: AllocationState) {
        self.log.await_any(&[state]);
    }

    /// Block until `state` has been observed or `interrupt` fires. On
    /// interruption the allocation is given up through [`Executable::shutdown`].
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Interrupted`] once the token fires.
    pub fn await_state_interruptibly(
        &self,
        state: AllocationState,
        interrupt: &Interrupt,
    ) -> Result<(), CoordinationError> {
        if let Err(e) = self.log.await_any_interruptibly(&[state], interrupt) {
            debug!(allocation_id = %self.remote.id(), awaited = %state, "wait interrupted, giving up allocation");
            if let Err(shutdown) = self.shutdown() {
                warn!(allocation_id = %self.remote.id(), error = %shutdown, "could not give up allocation");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Block up to `timeout` until `state` has been observed.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Timeout`] if it was not observed in time.
    pub fn await_state_timeout(
        &self,
        state: AllocationState,
        timeout: Duration,
    ) -> Result<(), CoordinationError> {
        self.log.await_any_timeout(&[state], timeout)
    }
}

impl Executable for AllocatableResource {
    fn startup(&self) -> Result<(), CoordinationError> {
        {
            let mut listener = self.listener.lock();
            if !self.log.is_empty() {
                warn!(
                    allocation_id = %self.remote.id(),
                    state = ?self.state(),
                    "startup called while already active, ignoring"
                );
                return Ok(());
            }
            self.log.push(self.remote.state());
            let log = Arc::clone(&self.log);
            *listener = Some(
                self.remote
                    .add_listener(move |a: &Allocation| log.push(a.state)),
            );
        }
        self.remote.schedule()
    }

    fn shutdown(&self) -> Result<(), CoordinationError> {
        match self.state() {
            Some(AllocationState::Requested | AllocationState::Scheduled) => self.remote.cancel(),
            Some(AllocationState::Allocated) => self.remote.abort(),
            state => {
                warn!(
                    allocation_id = %self.remote.id(),
                    state = ?state,
                    "shutdown called in inactive state, ignoring"
                );
                Ok(())
            }
        }
    }
}
