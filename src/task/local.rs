//! Locally executable work materialized from a task payload.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::core::{AppResult, Interrupt};

/// Work a handler runs for one task.
pub trait LocalTask: Send + Sync {
    /// Run to completion. Long-running work should check `interrupt`.
    ///
    /// # Errors
    ///
    /// Any failure; it is reported to the submitter as `FAILED`.
    fn run(&self, interrupt: &Interrupt) -> AppResult<Value>;

    /// Called when the submitter aborts while `run` is in progress.
    ///
    /// # Errors
    ///
    /// Failures are logged; the worker is terminated regardless.
    fn abort(&self, _payload: &Value) -> AppResult<()> {
        Ok(())
    }
}

/// Builds a [`LocalTask`] from a decoded payload. `Ok(None)` means the
/// payload is not something this factory handles.
pub trait LocalTaskFactory: Send + Sync {
    /// Materialize the task for `payload`.
    ///
    /// # Errors
    ///
    /// Any failure; it is reported to the submitter as `REJECTED`.
    fn new_local_task(&self, payload: &Value) -> AppResult<Option<Arc<dyn LocalTask>>>;
}

impl<F> LocalTaskFactory for F
where
    F: Fn(&Value) -> AppResult<Option<Arc<dyn LocalTask>>> + Send + Sync,
{
    fn new_local_task(&self, payload: &Value) -> AppResult<Option<Arc<dyn LocalTask>>> {
        self(payload)
    }
}

type RunFn = Box<dyn Fn(&Interrupt) -> AppResult<Value> + Send + Sync>;
type AbortFn = Box<dyn Fn(&Value) -> AppResult<()> + Send + Sync>;

/// [`LocalTask`] built from closures.
pub struct FnTask {
    run: RunFn,
    abort: Option<AbortFn>,
}

impl FnTask {
    /// Task running `run`, with a no-op abort hook.
    pub fn new<F>(run: F) -> Self
    where
        F: Fn(&Interrupt) -> AppResult<Value> + Send + Sync + 'static,
    {
        Self {
            run: Box::new(run),
            abort: None,
        }
    }

    /// Set the abort hook.
    #[must_use]
    pub fn on_abort<F>(mut self, abort: F) -> Self
    where
        F: Fn(&Value) -> AppResult<()> + Send + Sync + 'static,
    {
        self.abort = Some(Box::new(abort));
        self
    }

    /// Wrap into the shared form factories return.
    #[must_use]
    pub fn shared(self) -> Arc<dyn LocalTask> {
        Arc::new(self)
    }
}

impl LocalTask for FnTask {
    fn run(&self, interrupt: &Interrupt) -> AppResult<Value> {
        (self.run)(interrupt)
    }

    fn abort(&self, payload: &Value) -> AppResult<()> {
        self.abort.as_ref().map_or(Ok(()), |abort| abort(payload))
    }
}

impl fmt::Debug for FnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask")
            .field("has_abort_hook", &self.abort.is_some())
            .finish_non_exhaustive()
    }
}
