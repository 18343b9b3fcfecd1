//! Handler-side execution of one task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::core::{CoordinationError, SingleWorker};

use super::local::{LocalTask, LocalTaskFactory};
use super::proxy::TaskProxy;
use super::record::{TaskState, TaskStatus};

/// Drives one accepted task from materialization to its final state.
pub struct TaskExecutionMonitor {
    proxy: TaskProxy,
    factory: Arc<dyn LocalTaskFactory>,
}

impl TaskExecutionMonitor {
    /// Monitor for the task behind `proxy`.
    #[must_use]
    pub fn new(proxy: TaskProxy, factory: Arc<dyn LocalTaskFactory>) -> Self {
        Self { proxy, factory }
    }

    /// Handler-side proxy.
    #[must_use]
    pub const fn proxy(&self) -> &TaskProxy {
        &self.proxy
    }

    /// Run the protocol to completion and return the final state.
    ///
    /// # Errors
    ///
    /// Activation or worker spawn failure. Failures of the task itself are
    /// published, not returned.
    pub fn call(&self) -> Result<TaskStatus, CoordinationError> {
        let scope = self.proxy.scope().clone();
        if let Err(e) = self.proxy.activate() {
            error!(scope = %scope, error = %e, "could not activate task proxy");
            return Err(e);
        }

        let payload = match self.proxy.payload() {
            Ok(payload) => payload,
            Err(e) => return Ok(self.reject(&e.to_string())),
        };
        let task = match self.factory.new_local_task(&payload) {
            Ok(Some(task)) => task,
            Ok(None) => return Ok(self.reject(&format!("no local task for payload {payload}"))),
            Err(e) => return Ok(self.reject(&format!("{e:#}"))),
        };

        let worker = Arc::new(SingleWorker::new(format!("task-executor@{scope}"))?);
        let aborted = Arc::new(AtomicBool::new(false));
        self.watch_for_abort(&task, &worker, &aborted);

        if let Err(e) = self.proxy.update_status(TaskStatus::Accepted) {
            warn!(scope = %scope, error = %e, "could not publish ACCEPTED");
            worker.close();
            self.proxy.deactivate();
            return Err(e);
        }
        debug!(scope = %scope, "task accepted, starting execution");

        let job = Arc::clone(&task);
        let outcome = worker
            .submit(move |interrupt| job.run(interrupt))
            .and_then(|handle| handle.wait());

        let (status, result) = match outcome {
            Ok(Ok(value)) => (TaskStatus::Completed, value),
            Ok(Err(e)) if aborted.load(Ordering::Acquire) => {
                (TaskStatus::Aborted, Value::String(format!("{e:#}")))
            }
            Ok(Err(e)) => (TaskStatus::Failed, Value::String(format!("{e:#}"))),
            Err(e) if aborted.load(Ordering::Acquire) => {
                (TaskStatus::Aborted, Value::String(e.to_string()))
            }
            Err(e) => (TaskStatus::Failed, Value::String(e.to_string())),
        };
        worker.close();

        info!(scope = %scope, state = %status, "task execution finished");
        if self.proxy.is_active() {
            if let Err(e) = self.proxy.update(status, &result) {
                error!(scope = %scope, state = %status, error = %e, "could not publish final task state");
            }
        }
        self.proxy.deactivate();
        Ok(status)
    }

    fn reject(&self, reason: &str) -> TaskStatus {
        let scope = self.proxy.scope();
        warn!(scope = %scope, reason, "rejecting task");
        if let Err(e) = self.proxy.update(TaskStatus::Rejected, &Value::String(reason.to_owned())) {
            error!(scope = %scope, error = %e, "could not publish REJECTED");
        }
        self.proxy.deactivate();
        TaskStatus::Rejected
    }

    fn watch_for_abort(
        &self,
        task: &Arc<dyn LocalTask>,
        worker: &Arc<SingleWorker>,
        aborted: &Arc<AtomicBool>,
    ) {
        let task = Arc::clone(task);
        let worker = Arc::clone(worker);
        let aborted = Arc::clone(aborted);
        let scope = self.proxy.scope().clone();
        // Cleared on deactivation, which releases this handle.
        let proxy = self.proxy.clone();
        self.proxy.add_listener(move |update: &TaskState| {
            if !matches!(
                update.state,
                TaskStatus::Abort
                    | TaskStatus::Aborted
                    | TaskStatus::Failed
                    | TaskStatus::UpdateRejected
            ) {
                return;
            }
            if aborted.swap(true, Ordering::AcqRel) {
                return;
            }
            info!(scope = %scope, state = %update.state, "abort requested, stopping task");
            let payload = proxy.payload().unwrap_or(Value::Null);
            if let Err(e) = task.abort(&payload) {
                warn!(scope = %scope, error = %format!("{e:#}"), "task abort hook failed");
            }
            worker.shutdown_now();
        });
    }
}
