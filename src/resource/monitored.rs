//! Passive observer of every allocation touching a set of resources.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::allocation::{Allocation, AllocationService, AllocationState};
use crate::core::{CoordinationError, Interrupt};
use crate::infra::transport::{queue_adapter, HandlerId};

use super::{Executable, StateLog};

/// Logs the state of every arbiter update whose resources intersect the
/// watched set. Owns no allocation.
pub struct MonitoredResource {
    service: Arc<AllocationService>,
    resources: Vec<String>,
    log: Arc<StateLog>,
    alive: Arc<AtomicBool>,
    handler: Mutex<Option<HandlerId>>,
}

impl MonitoredResource {
    /// Watch `resources` through `service`.
    pub fn new<I, S>(service: Arc<AllocationService>, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service,
            resources: resources.into_iter().map(Into::into).collect(),
            log: Arc::new(StateLog::new()),
            alive: Arc::new(AtomicBool::new(false)),
            handler: Mutex::new(None),
        }
    }

    /// Watched resource names.
    #[must_use]
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    /// Latest observed state.
    #[must_use]
    pub fn state(&self) -> Option<AllocationState> {
        self.log.last()
    }

    /// Every state observed so far.
    #[must_use]
    pub fn history(&self) -> Vec<AllocationState> {
        self.log.history()
    }

    /// Block until any of `states` has been observed.
    pub fn await_any(&self, states: &[AllocationState]) {
        self.log.await_any(states);
    }

    /// Block until any of `states` has been observed or `interrupt` fires.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Interrupted`] once the token fires.
    pub fn await_any_interruptibly(
        &self,
        states: &[AllocationState],
        interrupt: &Interrupt,
    ) -> Result<(), CoordinationError> {
        self.log.await_any_interruptibly(states, interrupt)
    }

    /// Block up to `timeout` until any of `states` has been observed.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Timeout`] if none was observed in time.
    pub fn await_any_timeout(
        &self,
        states: &[AllocationState],
        timeout: Duration,
    ) -> Result<(), CoordinationError> {
        self.log.await_any_timeout(states, timeout)
    }

    /// Whether the listener thread is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn allocation_updated(log: &StateLog, allocation: &Allocation) {
        log.push(allocation.state);
    }
}

impl Executable for MonitoredResource {
    fn startup(&self) -> Result<(), CoordinationError> {
        let mut slot = self.handler.lock();
        if slot.is_some() {
            warn!(resources = ?self.resources, "monitor already active, ignoring startup");
            return Ok(());
        }
        debug!(resources = ?self.resources, "activating resource listener");
        let (handler, rx) = queue_adapter();
        *slot = Some(self.service.add_handler(handler, true));
        self.alive.store(true, Ordering::Release);

        let alive = Arc::clone(&self.alive);
        let log = Arc::clone(&self.log);
        let resources = self.resources.clone();
        let poll = self.service.config().dispatch_poll();
        let spawned = thread::Builder::new()
            .name(format!("resource-listener@{resources:?}"))
            .spawn(move || {
                while alive.load(Ordering::Acquire) {
                    match rx.recv_timeout(poll) {
                        Ok(event) if event.data.covers_any(&resources) => {
                            Self::allocation_updated(&log, &event.data);
                        }
                        Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(resources = ?resources, "resource listener stopped");
            });
        if let Err(e) = spawned {
            self.alive.store(false, Ordering::Release);
            if let Some(id) = slot.take() {
                self.service.remove_handler(id, false);
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<(), CoordinationError> {
        self.alive.store(false, Ordering::Release);
        if let Some(id) = self.handler.lock().take() {
            self.service.remove_handler(id, true);
        }
        Ok(())
    }
}
