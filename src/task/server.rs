//! Handler-side task intake.
//!
//! A [`TaskServer`] listens on a scope for new tasks and passes each one to
//! a [`TaskHandler`]. [`ExecutorFactoryTaskHandler`] is the standard
//! handler: it runs every task under its own [`TaskExecutionMonitor`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::core::{AppResult, CoordinationError};
use crate::infra::transport::{
    queue_adapter, Event, Informer, Listener, OriginFilter, Scope, Transport,
};

use super::local::LocalTaskFactory;
use super::monitor::TaskExecutionMonitor;
use super::proxy::TaskProxy;
use super::record::{Origin, TaskState, TaskStatus};

/// Interval at which an idle server re-checks whether it was deactivated.
const LISTEN_POLL: Duration = Duration::from_millis(200);

/// Receives every newly initiated task.
pub trait TaskHandler: Send + Sync {
    /// Take over `task`, which arrived with `cause`. Replies may be
    /// published through the server's `informer`.
    ///
    /// # Errors
    ///
    /// Any failure; the server logs it and keeps listening.
    fn handle(
        &self,
        task: TaskState,
        cause: &Event<TaskState>,
        informer: &Arc<Informer<TaskState>>,
    ) -> AppResult<()>;
}

/// Blocking task intake loop on one scope.
pub struct TaskServer {
    scope: Scope,
    informer: Arc<Informer<TaskState>>,
    listener: Listener<TaskState>,
    queue: Mutex<Option<Receiver<Event<TaskState>>>>,
    handler: Arc<dyn TaskHandler>,
    active: AtomicBool,
}

impl TaskServer {
    /// Server on `scope` handing tasks to `handler`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport<TaskState>>,
        scope: Scope,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let informer = Arc::new(Informer::new(Arc::clone(&transport), scope.clone()));
        let listener = Listener::new(transport, scope.clone());
        listener.add_filter(OriginFilter::exclude(informer.id()));
        Self {
            scope,
            informer,
            listener,
            queue: Mutex::new(None),
            handler,
            active: AtomicBool::new(false),
        }
    }

    /// Served scope.
    #[must_use]
    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Informer shared with handler-side proxies.
    #[must_use]
    pub const fn informer(&self) -> &Arc<Informer<TaskState>> {
        &self.informer
    }

    /// Whether the server accepts tasks.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Subscribe and enable the shared informer. Idempotent.
    ///
    /// # Errors
    ///
    /// Transport failure.
    pub fn activate(&self) -> Result<(), CoordinationError> {
        let mut queue = self.queue.lock();
        if queue.is_some() {
            return Ok(());
        }
        let (handler, rx) = queue_adapter();
        self.listener.add_handler(handler, true);
        self.informer.activate();
        self.listener.activate()?;
        *queue = Some(rx);
        self.active.store(true, Ordering::Release);
        info!(scope = %self.scope, "task server activated");
        Ok(())
    }

    /// Unsubscribe, which ends a running [`TaskServer::listen`].
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        if let Err(e) = self.listener.deactivate() {
            warn!(scope = %self.scope, error = %e, "could not deactivate task server listener");
        }
        self.informer.deactivate();
        self.queue.lock().take();
        info!(scope = %self.scope, "task server deactivated");
    }

    /// Serve tasks until deactivated.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::IllegalState`] if the server was never activated.
    pub fn listen(&self) -> Result<(), CoordinationError> {
        let Some(rx) = self.queue.lock().clone() else {
            return Err(CoordinationError::IllegalState(format!(
                "task server on {} is not active",
                self.scope
            )));
        };
        while self.is_active() {
            match rx.recv_timeout(LISTEN_POLL) {
                Ok(event) => self.dispatch(&event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(scope = %self.scope, "task server loop finished");
        Ok(())
    }

    /// Activate and serve until deactivated.
    ///
    /// # Errors
    ///
    /// See [`TaskServer::activate`].
    pub fn execute(&self) -> Result<(), CoordinationError> {
        self.activate()?;
        self.listen()
    }

    fn dispatch(&self, event: &Event<TaskState>) {
        let task = &event.data;
        if task.origin != Origin::Submitter || task.state != TaskStatus::Initiated {
            info!(
                scope = %event.scope,
                state = %task.state,
                origin = ?task.origin,
                "ignoring task event"
            );
            return;
        }
        info!(scope = %event.scope, event_id = %event.id, "new task");
        if let Err(e) = self.handler.handle(task.clone(), event, &self.informer) {
            warn!(scope = %event.scope, error = %format!("{e:#}"), "task handler failed");
        }
    }
}

/// [`TaskHandler`] running each task under its own monitor thread.
pub struct ExecutorFactoryTaskHandler {
    transport: Arc<dyn Transport<TaskState>>,
    factory: Arc<dyn LocalTaskFactory>,
}

impl ExecutorFactoryTaskHandler {
    /// Handler materializing tasks through `factory`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport<TaskState>>, factory: Arc<dyn LocalTaskFactory>) -> Self {
        Self { transport, factory }
    }
}

impl TaskHandler for ExecutorFactoryTaskHandler {
    fn handle(
        &self,
        task: TaskState,
        cause: &Event<TaskState>,
        informer: &Arc<Informer<TaskState>>,
    ) -> AppResult<()> {
        let proxy = TaskProxy::with_informer(
            Arc::clone(&self.transport),
            task,
            cause,
            Arc::clone(informer),
        );
        let monitor = TaskExecutionMonitor::new(proxy, Arc::clone(&self.factory));
        let scope = cause.scope.clone();
        thread::Builder::new()
            .name(format!("task-monitor@{scope}"))
            .spawn(move || match monitor.call() {
                Ok(state) => debug!(scope = %scope, state = %state, "task monitor finished"),
                Err(e) => error!(scope = %scope, error = %e, "task monitor failed"),
            })?;
        Ok(())
    }
}
