//! All-or-nothing scheduling of several executable resources.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::allocation::{Allocation, AllocationState, ListenerId};
use crate::core::{AppResult, CoordinationError, Interrupt};
use crate::resource::{Executable, ExecutableResource};

use super::local::LocalTask;

/// Interval at which [`LocalTask::run`] checks its interrupt while members run.
const RUN_SLICE: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Barrier {
    lock: Mutex<()>,
    cvar: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    Pending,
    Failed(AllocationState),
}

/// Members scheduled together: either every member is scheduled within the
/// grace period and all of them run, or none of them does.
pub struct ResourceGroup<T> {
    members: Vec<ExecutableResource<T>>,
    grace: Duration,
}

impl<T> ResourceGroup<T>
where
    T: Send + 'static,
{
    /// Group over `members`, waiting up to `grace` for all to be scheduled.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::IllegalState`] for an empty group.
    pub fn new(members: Vec<ExecutableResource<T>>, grace: Duration) -> Result<Self, CoordinationError> {
        if members.is_empty() {
            return Err(CoordinationError::IllegalState(
                "a resource group needs at least one member".into(),
            ));
        }
        Ok(Self { members, grace })
    }

    /// Members in construction order.
    #[must_use]
    pub fn members(&self) -> &[ExecutableResource<T>] {
        &self.members
    }

    /// Grace period for scheduling.
    #[must_use]
    pub const fn grace(&self) -> Duration {
        self.grace
    }

    /// Schedule every member and wait until all are scheduled.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Unavailable`] if any member is rejected or the
    /// grace period passes first; every member is then cancelled.
    /// Transport errors from scheduling cancel the group as well.
    pub fn schedule(&self) -> Result<(), CoordinationError> {
        let barrier = Arc::new(Barrier::default());
        let ids: Vec<ListenerId> = self
            .members
            .iter()
            .map(|member| {
                let barrier = Arc::clone(&barrier);
                member.remote().add_listener(move |_: &Allocation| {
                    let _guard = barrier.lock.lock();
                    barrier.cvar.notify_all();
                })
            })
            .collect();

        let outcome = self.schedule_members().and_then(|()| self.await_ready(&barrier));
        for (member, id) in self.members.iter().zip(ids) {
            member.remote().remove_listener(id);
        }
        if let Err(e) = outcome {
            warn!(members = self.members.len(), error = %e, "group scheduling failed, cancelling all");
            self.cancel_all();
            return Err(e);
        }
        info!(members = self.members.len(), "all group members scheduled");
        Ok(())
    }

    fn schedule_members(&self) -> Result<(), CoordinationError> {
        for member in &self.members {
            if !member.remote().is_scheduled() {
                member.remote().schedule()?;
            }
        }
        Ok(())
    }

    fn await_ready(&self, barrier: &Barrier) -> Result<(), CoordinationError> {
        let deadline = Instant::now() + self.grace;
        let mut guard = barrier.lock.lock();
        loop {
            match self.readiness() {
                Readiness::Ready => return Ok(()),
                Readiness::Failed(state) => {
                    return Err(CoordinationError::Unavailable(format!(
                        "a group member ended {state} while scheduling"
                    )));
                }
                Readiness::Pending => {}
            }
            if barrier.cvar.wait_until(&mut guard, deadline).timed_out() {
                if self.readiness() == Readiness::Ready {
                    return Ok(());
                }
                return Err(CoordinationError::Unavailable(format!(
                    "group not scheduled within {} ms",
                    self.grace.as_millis()
                )));
            }
        }
    }

    fn readiness(&self) -> Readiness {
        let mut ready = true;
        for member in &self.members {
            match member.remote().state() {
                AllocationState::Scheduled | AllocationState::Allocated => {}
                AllocationState::Requested => ready = false,
                other => return Readiness::Failed(other),
            }
        }
        if ready {
            Readiness::Ready
        } else {
            Readiness::Pending
        }
    }

    fn cancel_all(&self) {
        for member in &self.members {
            if let Err(e) = member.shutdown() {
                warn!(allocation_id = %member.remote().id(), error = %e, "could not cancel group member");
            }
        }
    }

    /// Start every member and block until all of their work has finished.
    /// A member whose work never ran or failed yields `None`.
    ///
    /// # Errors
    ///
    /// Startup failure of a member; the group is aborted.
    pub fn run_all(&self) -> Result<Vec<Option<T>>, CoordinationError> {
        self.start_all()?;
        Ok(self
            .members
            .iter()
            .map(|member| member.result().and_then(|h| h.wait().ok().flatten()))
            .collect())
    }

    fn start_all(&self) -> Result<(), CoordinationError> {
        for member in &self.members {
            if let Err(e) = member.startup() {
                warn!(allocation_id = %member.remote().id(), error = %e, "group member failed to start");
                self.abort();
                return Err(e);
            }
        }
        debug!(members = self.members.len(), "group started");
        Ok(())
    }

    /// Shut down every member.
    pub fn abort(&self) {
        for member in &self.members {
            if let Err(e) = member.shutdown() {
                warn!(allocation_id = %member.remote().id(), error = %e, "could not shut down group member");
            }
        }
    }
}

impl<T> LocalTask for ResourceGroup<T>
where
    T: Serialize + Send + 'static,
{
    fn run(&self, interrupt: &Interrupt) -> AppResult<Value> {
        self.schedule()?;
        self.start_all()?;
        let mut results = Vec::with_capacity(self.members.len());
        for member in &self.members {
            let Some(handle) = member.result() else {
                results.push(None);
                continue;
            };
            loop {
                if interrupt.is_interrupted() {
                    self.abort();
                    return Err(CoordinationError::Interrupted.into());
                }
                match handle.wait_timeout(RUN_SLICE) {
                    Ok(value) => {
                        results.push(value);
                        break;
                    }
                    Err(CoordinationError::Timeout(_)) => {}
                    Err(_) => {
                        results.push(None);
                        break;
                    }
                }
            }
        }
        Ok(serde_json::to_value(results)?)
    }

    fn abort(&self, _payload: &Value) -> AppResult<()> {
        ResourceGroup::abort(self);
        Ok(())
    }
}
