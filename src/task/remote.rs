//! Submitter-side blocking call over the task protocol.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::core::{CoordinationError, Interrupt};
use crate::infra::transport::{Scope, Transport};

use super::proxy::TaskProxy;
use super::record::{TaskState, TaskStatus};

/// Default time a handler has to accept or reject a task.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Submit one task and block for its outcome.
pub struct RemoteTask {
    proxy: TaskProxy,
    payload: Value,
    accept_timeout: Duration,
}

impl RemoteTask {
    /// Task carrying `payload` on `scope`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport<TaskState>>, scope: Scope, payload: Value) -> Self {
        Self {
            proxy: TaskProxy::submitter(transport, scope),
            payload,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
        }
    }

    /// Override the acceptance timeout.
    #[must_use]
    pub const fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Underlying proxy, for observers.
    #[must_use]
    pub const fn proxy(&self) -> &TaskProxy {
        &self.proxy
    }

    /// Publish the task and wait for its result.
    ///
    /// # Errors
    ///
    /// - [`CoordinationError::Timeout`] if no handler answered in time
    /// - [`CoordinationError::Rejected`] with the handler's reason
    /// - [`CoordinationError::Abnormal`] if the task aborted or failed
    /// - [`CoordinationError::IllegalState`] on a protocol violation
    /// - transport and payload errors
    pub fn call(&self) -> Result<Value, CoordinationError> {
        self.call_with(&Interrupt::new())
    }

    /// [`RemoteTask::call`] that gives up once `interrupt` fires: the
    /// handler is asked to abort and the proxy is deactivated.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Interrupted`] on interruption, otherwise as
    /// [`RemoteTask::call`].
    pub fn call_with(&self, interrupt: &Interrupt) -> Result<Value, CoordinationError> {
        interrupt.check()?;
        self.proxy.activate()?;
        if let Err(e) = self.proxy.update(TaskStatus::Initiated, &self.payload) {
            self.proxy.deactivate();
            return Err(e);
        }
        let scope = self.proxy.scope().clone();

        let state = self
            .proxy
            .await_status_interruptibly(interrupt, Some(self.accept_timeout), |s| {
                s != TaskStatus::Initiated
            })
            .map_err(|e| self.abandon(e))?;
        match state {
            TaskStatus::Initiated => {
                self.proxy.deactivate();
                warn!(scope = %scope, timeout_ms = self.accept_timeout.as_millis(), "task not accepted in time");
                return Err(CoordinationError::Timeout(format!(
                    "no handler accepted task on {scope} within {} ms",
                    self.accept_timeout.as_millis()
                )));
            }
            TaskStatus::Rejected => {
                return Err(CoordinationError::Rejected(self.proxy.payload_text()));
            }
            _ => debug!(scope = %scope, state = %state, "task accepted"),
        }

        let state = self
            .proxy
            .await_status_interruptibly(interrupt, None, |s| {
                !matches!(
                    s,
                    TaskStatus::Accepted | TaskStatus::ResultAvailable | TaskStatus::AbortFailed
                )
            })
            .map_err(|e| self.abandon(e))?;
        match state {
            TaskStatus::Completed => self.proxy.payload(),
            TaskStatus::Aborted | TaskStatus::Failed | TaskStatus::UpdateRejected => {
                Err(CoordinationError::Abnormal {
                    state: state.to_string(),
                    reason: self.proxy.payload_text(),
                })
            }
            TaskStatus::Abort | TaskStatus::Update | TaskStatus::Initiated => {
                warn!(scope = %scope, state = %state, "illegal task state after acceptance, aborting");
                if let Err(e) = self.proxy.update_status(TaskStatus::Abort) {
                    warn!(scope = %scope, error = %e, "could not publish abort");
                }
                self.proxy.deactivate();
                Err(CoordinationError::IllegalState(format!(
                    "task on {scope} reached {state} after acceptance"
                )))
            }
            other => Err(CoordinationError::IllegalState(format!(
                "task on {scope} reached {other} after acceptance"
            ))),
        }
    }

    /// Ask the handler to stop and detach; hands `cause` back.
    fn abandon(&self, cause: CoordinationError) -> CoordinationError {
        debug!(scope = %self.proxy.scope(), "task call interrupted, aborting");
        if let Err(e) = self.proxy.update_status(TaskStatus::Abort) {
            warn!(scope = %self.proxy.scope(), error = %e, "could not publish abort");
        }
        self.proxy.deactivate();
        cause
    }
}
