//! Allocation wrapper that runs user work inside the granted slot.
//!
//! The work is queued on a [`SingleWorker`] at startup and parks until the
//! allocation is `ALLOCATED`. A grant runs it; a refusal first skips it.
//! Once the work returns, the [`Completion`] policy decides what happens to
//! the allocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::allocation::{
    Allocation, AllocationService, AllocationState, ListenerId, RemoteAllocation,
};
use crate::core::{AppResult, CoordinationError, Interrupt, JobHandle, SingleWorker};

use super::Executable;

/// Interval at which a parked job re-checks its interrupt token.
const PARK_SLICE: Duration = Duration::from_millis(100);

/// What to do with the allocation after the work returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
    /// Release right away.
    #[default]
    Expire,
    /// Keep the allocation alive.
    Retain,
    /// Hold the allocation until the slot runs out, then release.
    Monitor,
}

type Work<T> = Box<dyn FnOnce(&Interrupt) -> AppResult<T> + Send + 'static>;

/// Wakes parked jobs on every transition.
#[derive(Default)]
struct Gate {
    lock: Mutex<()>,
    cvar: Condvar,
}

impl Gate {
    fn notify(&self) {
        let _guard = self.lock.lock();
        self.cvar.notify_all();
    }
}

struct Shared<T> {
    remote: RemoteAllocation,
    completion: Completion,
    executor: Arc<SingleWorker>,
    owns_executor: bool,
    gate: Gate,
    work: Mutex<Option<Work<T>>>,
    result: Mutex<Option<JobHandle<Option<T>>>>,
    listener: Mutex<Option<ListenerId>>,
    /// Set once user code has returned; revocation no longer cancels the job.
    finishing: AtomicBool,
    /// Set by `terminate_execution`; a parked job gives up.
    stopped: AtomicBool,
}

/// Runs one unit of user work exactly while its allocation is granted.
pub struct ExecutableResource<T> {
    shared: Arc<Shared<T>>,
}

impl<T> ExecutableResource<T>
where
    T: Send + 'static,
{
    /// Wrap `allocation` and run `work` on a dedicated worker thread.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Spawn`] if the worker cannot be started.
    pub fn new<F>(
        service: Arc<AllocationService>,
        allocation: Allocation,
        completion: Completion,
        work: F,
    ) -> Result<Self, CoordinationError>
    where
        F: FnOnce(&Interrupt) -> AppResult<T> + Send + 'static,
    {
        let executor = Arc::new(SingleWorker::new(format!(
            "resource-executor#{}",
            allocation.id
        ))?);
        Ok(Self::build(service, allocation, completion, executor, true, Box::new(work)))
    }

    /// Wrap `allocation` and run `work` on a caller-owned worker, which is
    /// never shut down by this resource.
    pub fn with_executor<F>(
        service: Arc<AllocationService>,
        allocation: Allocation,
        completion: Completion,
        executor: Arc<SingleWorker>,
        work: F,
    ) -> Self
    where
        F: FnOnce(&Interrupt) -> AppResult<T> + Send + 'static,
    {
        Self::build(service, allocation, completion, executor, false, Box::new(work))
    }

    fn build(
        service: Arc<AllocationService>,
        allocation: Allocation,
        completion: Completion,
        executor: Arc<SingleWorker>,
        owns_executor: bool,
        work: Work<T>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                remote: RemoteAllocation::new(service, allocation),
                completion,
                executor,
                owns_executor,
                gate: Gate::default(),
                work: Mutex::new(Some(work)),
                result: Mutex::new(None),
                listener: Mutex::new(None),
                finishing: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Underlying proxy.
    #[must_use]
    pub fn remote(&self) -> &RemoteAllocation {
        &self.shared.remote
    }

    /// Completion policy.
    #[must_use]
    pub fn completion(&self) -> Completion {
        self.shared.completion
    }

    /// Handle to the work's outcome; `None` before startup. The value is
    /// `None` when the work never ran or failed.
    #[must_use]
    pub fn result(&self) -> Option<JobHandle<Option<T>>> {
        self.shared.result.lock().clone()
    }
}

impl<T> Executable for ExecutableResource<T>
where
    T: Send + 'static,
{
    fn startup(&self) -> Result<(), CoordinationError> {
        let Some(work) = self.shared.work.lock().take() else {
            warn!(
                allocation_id = %self.shared.remote.id(),
                "startup called while already active, ignoring"
            );
            return Ok(());
        };
        let job_shared = Arc::clone(&self.shared);
        let handle = self
            .shared
            .executor
            .submit(move |interrupt: &Interrupt| job_shared.run(work, interrupt))?;
        *self.shared.result.lock() = Some(handle);

        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        let id = self.shared.remote.add_listener(move |a: &Allocation| {
            if let Some(shared) = weak.upgrade() {
                shared.allocation_updated(a);
            }
        });
        *self.shared.listener.lock() = Some(id);

        if self.shared.remote.is_scheduled() {
            Ok(())
        } else {
            self.shared.remote.schedule()
        }
    }

    fn shutdown(&self) -> Result<(), CoordinationError> {
        let shared = &self.shared;
        match shared.remote.state() {
            AllocationState::Requested | AllocationState::Scheduled => {
                let outcome = shared.remote.cancel();
                shared.terminate_execution(false, true);
                outcome
            }
            AllocationState::Allocated => {
                let outcome = shared.remote.abort();
                shared.terminate_execution(true, true);
                outcome
            }
            state => {
                warn!(
                    allocation_id = %shared.remote.id(),
                    state = %state,
                    "shutdown called in inactive state"
                );
                shared.terminate_execution(false, true);
                Ok(())
            }
        }
    }
}

impl<T> Shared<T>
where
    T: Send + 'static,
{
    fn allocation_updated(&self, allocation: &Allocation) {
        self.gate.notify();
        match allocation.state {
            AllocationState::Rejected | AllocationState::Cancelled => {
                self.terminate_execution(false, false);
            }
            AllocationState::Aborted | AllocationState::Released => {
                self.terminate_execution(true, false);
            }
            _ => {}
        }
    }

    /// Stop the job (interrupting it if asked), detach from the proxy and
    /// close an owned worker. Joining is only done from `shutdown`.
    fn terminate_execution(&self, interrupt: bool, join: bool) {
        if !self.finishing.load(Ordering::Acquire) {
            if let Some(handle) = self.result.lock().as_ref() {
                if !handle.is_done() {
                    handle.cancel(interrupt);
                }
            }
        }
        if let Some(id) = self.listener.lock().take() {
            self.remote.remove_listener(id);
        }
        self.stopped.store(true, Ordering::Release);
        self.gate.notify();
        if self.owns_executor {
            if join && !self.executor.is_current() {
                self.executor
                    .shutdown(self.remote.service().config().executor_shutdown());
            } else {
                self.executor.close();
            }
        }
    }

    /// Park until granted. Ok(false) means the allocation ended first.
    fn await_grant(&self, interrupt: &Interrupt) -> Result<bool, CoordinationError> {
        let mut guard = self.gate.lock.lock();
        loop {
            interrupt.check()?;
            if self.stopped.load(Ordering::Acquire) {
                return Ok(false);
            }
            match self.remote.state() {
                AllocationState::Allocated => return Ok(true),
                state if state.is_terminal() => return Ok(false),
                _ => {}
            }
            self.gate.cvar.wait_for(&mut guard, PARK_SLICE);
        }
    }

    fn run(&self, work: Work<T>, interrupt: &Interrupt) -> Option<T> {
        match self.await_grant(interrupt) {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    allocation_id = %self.remote.id(),
                    state = %self.remote.state(),
                    "allocation ended before grant, skipping user code"
                );
                return None;
            }
            Err(_) => {
                error!(
                    allocation_id = %self.remote.id(),
                    state = %self.remote.state(),
                    "startup interrupted, aborting allocation"
                );
                self.abort_remote();
                return None;
            }
        }

        debug!(
            allocation_id = %self.remote.id(),
            remaining_ms = u64::try_from(self.remote.remaining_time().as_millis()).unwrap_or(u64::MAX),
            "starting user code execution"
        );
        match work(interrupt) {
            Ok(value) => {
                self.finishing.store(true, Ordering::Release);
                debug!(allocation_id = %self.remote.id(), "user code execution returned");
                self.complete(interrupt);
                Some(value)
            }
            Err(e) if interrupt.is_interrupted() || CoordinationError::is_interruption(&e) => {
                debug!(allocation_id = %self.remote.id(), "user code interrupted, aborting allocation");
                self.abort_remote();
                None
            }
            Err(e) => {
                warn!(
                    allocation_id = %self.remote.id(),
                    error = %e,
                    "user code execution failed, aborting allocation"
                );
                self.abort_remote();
                None
            }
        }
    }

    fn complete(&self, interrupt: &Interrupt) {
        match self.completion {
            Completion::Retain => return,
            Completion::Monitor => {
                let mut guard = self.gate.lock.lock();
                loop {
                    let left = self.remote.remaining_time();
                    if left.is_zero() || interrupt.is_interrupted() {
                        break;
                    }
                    self.gate.cvar.wait_for(&mut guard, left.min(PARK_SLICE));
                }
            }
            Completion::Expire => {}
        }
        if let Err(e) = self.remote.release() {
            warn!(allocation_id = %self.remote.id(), error = %e, "could not release allocation");
        }
    }

    fn abort_remote(&self) {
        if let Err(e) = self.remote.abort() {
            warn!(allocation_id = %self.remote.id(), error = %e, "could not abort allocation");
        }
    }
}
