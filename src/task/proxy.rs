//! Local proxy of a task record shared between submitter and handler.
//!
//! Both sides talk on the task's scope. A handler's events name the
//! submitter's initiating event as their cause, and the submitter's later
//! events name that same first event, so each proxy subscribes only to
//! events caused by its correlating event id.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::{CoordinationError, Interrupt};
use crate::infra::transport::{
    Event, EventId, Handler, Informer, Listener, OriginFilter, Scope, Transport,
};

use super::payload::CodecRegistry;
use super::record::{Origin, TaskState, TaskStatus};

/// How often an interruptible wait re-checks its token.
const INTERRUPT_SLICE: Duration = Duration::from_millis(50);

/// Observer of inbound task updates.
pub trait TaskListener: Send + Sync {
    /// Called with every update received from the other side.
    fn updated(&self, update: &TaskState);
}

impl<F> TaskListener for F
where
    F: Fn(&TaskState) + Send + Sync,
{
    fn updated(&self, update: &TaskState) {
        self(update);
    }
}

/// Registration id returned by [`TaskProxy::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskListenerId(u64);

struct Inner {
    scope: Scope,
    origin: Origin,
    informer: Arc<Informer<TaskState>>,
    foreign_informer: bool,
    listener: Listener<TaskState>,
    task: Mutex<TaskState>,
    cvar: Condvar,
    cause: Arc<Mutex<Option<EventId>>>,
    listeners: Mutex<Vec<(TaskListenerId, Arc<dyn TaskListener>)>>,
    next_listener: AtomicU64,
    active: AtomicBool,
    lifecycle: Mutex<()>,
    codecs: CodecRegistry,
}

/// One side's view of a task, kept in step with the other side.
///
/// Cloning yields another handle to the same proxy.
#[derive(Clone)]
pub struct TaskProxy {
    inner: Arc<Inner>,
}

impl TaskProxy {
    /// Submitter-side proxy for a new task on `scope`.
    #[must_use]
    pub fn submitter(transport: Arc<dyn Transport<TaskState>>, scope: Scope) -> Self {
        let informer = Arc::new(Informer::new(Arc::clone(&transport), scope.clone()));
        Self::build(transport, scope, Origin::Submitter, TaskState::submitter(), None, informer, false)
    }

    /// Handler-side proxy answering `cause`, which carried `original`.
    #[must_use]
    pub fn handler(
        transport: Arc<dyn Transport<TaskState>>,
        original: TaskState,
        cause: &Event<TaskState>,
    ) -> Self {
        let informer = Arc::new(Informer::new(Arc::clone(&transport), cause.scope.clone()));
        Self::build(
            transport,
            cause.scope.clone(),
            Origin::Handler,
            original,
            Some(cause.id),
            informer,
            false,
        )
    }

    /// Handler-side proxy publishing through a shared `informer`, which is
    /// left active on deactivation.
    #[must_use]
    pub fn with_informer(
        transport: Arc<dyn Transport<TaskState>>,
        original: TaskState,
        cause: &Event<TaskState>,
        informer: Arc<Informer<TaskState>>,
    ) -> Self {
        Self::build(
            transport,
            cause.scope.clone(),
            Origin::Handler,
            original,
            Some(cause.id),
            informer,
            true,
        )
    }

    fn build(
        transport: Arc<dyn Transport<TaskState>>,
        scope: Scope,
        origin: Origin,
        mut task: TaskState,
        cause: Option<EventId>,
        informer: Arc<Informer<TaskState>>,
        foreign_informer: bool,
    ) -> Self {
        task.origin = origin;
        let listener = Listener::new(transport, scope.clone());
        listener.add_filter(OriginFilter::exclude(informer.id()));
        Self {
            inner: Arc::new(Inner {
                scope,
                origin,
                informer,
                foreign_informer,
                listener,
                task: Mutex::new(task),
                cvar: Condvar::new(),
                cause: Arc::new(Mutex::new(cause)),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                active: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
                codecs: CodecRegistry::new(),
            }),
        }
    }

    /// Codec registry used for payloads; register extra codecs here.
    #[must_use]
    pub fn codecs(&self) -> &CodecRegistry {
        &self.inner.codecs
    }

    /// Task scope.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// Side this proxy publishes as.
    #[must_use]
    pub fn origin(&self) -> Origin {
        self.inner.origin
    }

    /// Correlating event id, once known.
    #[must_use]
    pub fn cause(&self) -> Option<EventId> {
        *self.inner.cause.lock()
    }

    /// Snapshot of the record.
    #[must_use]
    pub fn task(&self) -> TaskState {
        self.inner.task.lock().clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.inner.task.lock().state
    }

    /// Whether the proxy is subscribed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Decode the current payload.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Payload`] for unknown schemas or malformed bytes.
    pub fn payload(&self) -> Result<Value, CoordinationError> {
        let (schema, bytes) = {
            let task = self.inner.task.lock();
            (task.wire_schema.clone(), task.payload.clone())
        };
        self.inner.codecs.decode(&schema, &bytes)
    }

    /// Payload as display text, for error messages.
    #[must_use]
    pub fn payload_text(&self) -> String {
        match self.payload() {
            Ok(Value::String(s)) => s,
            Ok(other) => other.to_string(),
            Err(e) => format!("<{e}>"),
        }
    }

    /// Register an observer of inbound updates.
    pub fn add_listener<L>(&self, listener: L) -> TaskListenerId
    where
        L: TaskListener + 'static,
    {
        let id = TaskListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Deregister an observer. Returns false for unknown ids.
    pub fn remove_listener(&self, id: TaskListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Block until the state satisfies `done` or `timeout` passes. Returns
    /// the state observed last.
    pub fn await_status_timeout<P>(&self, timeout: Duration, done: P) -> TaskStatus
    where
        P: Fn(TaskStatus) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut task = self.inner.task.lock();
        while !done(task.state) {
            if self.inner.cvar.wait_until(&mut task, deadline).timed_out() {
                break;
            }
        }
        task.state
    }

    /// Block until the state satisfies `done`.
    pub fn await_status<P>(&self, done: P) -> TaskStatus
    where
        P: Fn(TaskStatus) -> bool,
    {
        let mut task = self.inner.task.lock();
        while !done(task.state) {
            self.inner.cvar.wait(&mut task);
        }
        task.state
    }

    /// Block until the state satisfies `done`, `timeout` passes or
    /// `interrupt` fires. Returns the state observed last on success or
    /// timeout.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Interrupted`] once the token fires.
    pub fn await_status_interruptibly<P>(
        &self,
        interrupt: &Interrupt,
        timeout: Option<Duration>,
        done: P,
    ) -> Result<TaskStatus, CoordinationError>
    where
        P: Fn(TaskStatus) -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut task = self.inner.task.lock();
        while !done(task.state) {
            interrupt.check()?;
            let slice = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        break;
                    }
                    left.min(INTERRUPT_SLICE)
                }
                None => INTERRUPT_SLICE,
            };
            self.inner.cvar.wait_for(&mut task, slice);
        }
        Ok(task.state)
    }

    /// Subscribe to the other side's events and start the dispatcher.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Transport or spawn failure.
    pub fn activate(&self) -> Result<(), CoordinationError> {
        let _lifecycle = self.inner.lifecycle.lock();
        if self.is_active() {
            return Ok(());
        }
        let (tx, rx) = unbounded();
        let cause = Arc::clone(&self.inner.cause);
        self.inner.listener.add_handler(
            Handler::filtered(tx, move |e: &Event<TaskState>| {
                cause.lock().is_some_and(|c| e.caused_by(&c))
            }),
            true,
        );
        if !self.inner.informer.is_active() {
            self.inner.informer.activate();
        }
        self.inner.listener.activate()?;
        self.inner.active.store(true, Ordering::Release);
        info!(scope = %self.inner.scope, origin = ?self.inner.origin, "activated listener/informer pair");

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("task-dispatcher@{}", self.inner.scope))
            .spawn(move || Inner::dispatch(&inner, &rx));
        if let Err(e) = spawned {
            self.deactivate_locked();
            return Err(e.into());
        }
        Ok(())
    }

    /// Drop observers and tear down the subscription and an owned informer.
    /// Idempotent; failures are logged.
    pub fn deactivate(&self) {
        let _lifecycle = self.inner.lifecycle.lock();
        self.deactivate_locked();
    }

    fn deactivate_locked(&self) {
        self.inner.deactivate_locked();
    }

    /// Set the state and publish.
    ///
    /// # Errors
    ///
    /// Transport failure.
    pub fn update_status(&self, status: TaskStatus) -> Result<EventId, CoordinationError> {
        self.publish(|task| {
            task.state = status;
            Ok(())
        })
    }

    /// Set the payload and publish.
    ///
    /// # Errors
    ///
    /// Payload encoding or transport failure.
    pub fn update_payload(&self, payload: &Value) -> Result<EventId, CoordinationError> {
        let (bytes, schema) = self.inner.codecs.encode(payload)?;
        self.publish(move |task| {
            task.payload = bytes;
            task.wire_schema = schema;
            Ok(())
        })
    }

    /// Set state and payload and publish both in one event.
    ///
    /// # Errors
    ///
    /// Payload encoding or transport failure.
    pub fn update(&self, status: TaskStatus, payload: &Value) -> Result<EventId, CoordinationError> {
        let (bytes, schema) = self.inner.codecs.encode(payload)?;
        self.publish(move |task| {
            task.state = status;
            task.payload = bytes;
            task.wire_schema = schema;
            Ok(())
        })
    }

    /// Merge `task` into the record and publish.
    ///
    /// # Errors
    ///
    /// Transport failure.
    pub fn update_task(&self, task: &TaskState) -> Result<EventId, CoordinationError> {
        self.publish(|record| {
            record.merge(task);
            Ok(())
        })
    }

    fn publish<F>(&self, change: F) -> Result<EventId, CoordinationError>
    where
        F: FnOnce(&mut TaskState) -> Result<(), CoordinationError>,
    {
        let (id, terminal) = {
            let mut task = self.inner.task.lock();
            change(&mut task)?;
            task.origin = self.inner.origin;
            task.serial += 1;
            let mut event = self
                .inner
                .informer
                .prepare_at(&self.inner.scope, task.clone())?;
            {
                let mut cause = self.inner.cause.lock();
                match *cause {
                    Some(c) => event.add_cause(c),
                    // The first event is its own correlation id; set it
                    // before sending so no reply can arrive unmatched.
                    None => *cause = Some(event.id),
                }
            }
            info!(
                scope = %self.inner.scope,
                state = %task.state,
                serial = task.serial,
                origin = ?task.origin,
                "SENDING task update"
            );
            self.inner.cvar.notify_all();
            self.inner.informer.send(&event)?;
            (event.id, task.state.is_terminal())
        };
        if terminal {
            self.deactivate();
        }
        Ok(id)
    }
}

impl Inner {
    fn dispatch(inner: &Arc<Self>, rx: &Receiver<Event<TaskState>>) {
        while let Ok(event) = rx.recv() {
            let update = event.data;
            info!(
                scope = %inner.scope,
                state = %update.state,
                serial = update.serial,
                origin = ?update.origin,
                "RECEIVED task update"
            );
            let terminal = {
                let mut task = inner.task.lock();
                task.merge(&update);
                task.state.is_terminal()
            };
            let snapshot: Vec<Arc<dyn TaskListener>> = inner
                .listeners
                .lock()
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect();
            for listener in &snapshot {
                listener.updated(&update);
            }
            // Waiters wake only after observers have seen the update.
            {
                let _task = inner.task.lock();
                inner.cvar.notify_all();
            }
            if terminal {
                let _lifecycle = inner.lifecycle.lock();
                inner.deactivate_locked();
            }
        }
        debug!(scope = %inner.scope, "task dispatcher stopped");
    }

    fn deactivate_locked(&self) {
        self.listeners.lock().clear();
        if let Err(e) = self.listener.deactivate() {
            warn!(scope = %self.scope, error = %e, "could not deactivate task listener");
        }
        if !self.foreign_informer && self.informer.is_active() {
            self.informer.deactivate();
        }
        if self.active.swap(false, Ordering::AcqRel) {
            info!(scope = %self.scope, "deactivated listener/informer pair");
        }
    }
}

impl fmt::Debug for TaskProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task = self.inner.task.lock();
        f.debug_struct("TaskProxy")
            .field("scope", &self.inner.scope)
            .field("origin", &self.inner.origin)
            .field("state", &task.state)
            .field("serial", &task.serial)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::transport::{queue_adapter, InMemoryBus};
    use serde_json::json;

    fn bus() -> Arc<dyn Transport<TaskState>> {
        Arc::new(InMemoryBus::new())
    }

    #[test]
    fn test_interruptible_wait_gives_up_on_interrupt_or_timeout() {
        let proxy = TaskProxy::submitter(bus(), Scope::new("/task/wait").unwrap());
        let interrupt = Interrupt::new();

        let state = proxy
            .await_status_interruptibly(&interrupt, Some(Duration::from_millis(30)), TaskStatus::is_terminal)
            .unwrap();
        assert_eq!(state, TaskStatus::Initiated);

        let remote = interrupt.clone();
        let firing = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.interrupt();
        });
        let outcome = proxy.await_status_interruptibly(&interrupt, None, TaskStatus::is_terminal);
        assert!(matches!(outcome, Err(CoordinationError::Interrupted)));
        firing.join().unwrap();
    }

    #[test]
    fn test_serial_strictly_increases() {
        let transport = bus();
        let proxy = TaskProxy::submitter(transport, Scope::new("/task/a").unwrap());
        proxy.activate().unwrap();
        let mut last = proxy.task().serial;
        for status in [TaskStatus::Initiated, TaskStatus::Update, TaskStatus::Abort] {
            proxy.update_status(status).unwrap();
            let serial = proxy.task().serial;
            assert!(serial > last);
            last = serial;
        }
        proxy.deactivate();
    }

    #[test]
    fn test_first_publish_sets_cause_and_later_ones_carry_it() {
        let transport = bus();
        let scope = Scope::new("/task/b").unwrap();
        let watcher = Listener::new(Arc::clone(&transport), scope.clone());
        let (handler, rx) = queue_adapter();
        watcher.add_handler(handler, true);
        watcher.activate().unwrap();

        let proxy = TaskProxy::submitter(transport, scope);
        proxy.activate().unwrap();
        assert!(proxy.cause().is_none());
        let first = proxy.update(TaskStatus::Initiated, &json!("x")).unwrap();
        assert_eq!(proxy.cause(), Some(first));
        proxy.update_status(TaskStatus::Abort).unwrap();

        let e1 = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let e2 = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(e1.causes.is_empty());
        assert!(e2.caused_by(&first));
        proxy.deactivate();
    }

    #[test]
    fn test_handler_reply_reaches_submitter() {
        let transport = bus();
        let scope = Scope::new("/task/c").unwrap();
        let submitter = TaskProxy::submitter(Arc::clone(&transport), scope.clone());
        submitter.activate().unwrap();

        // Grab the initiating event the way a server would.
        let server = Listener::new(Arc::clone(&transport), scope);
        let (handler, rx) = queue_adapter();
        server.add_handler(handler, true);
        server.activate().unwrap();

        submitter.update(TaskStatus::Initiated, &json!("x")).unwrap();
        let initiating = rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let remote = TaskProxy::handler(transport, initiating.data.clone(), &initiating);
        remote.activate().unwrap();
        assert_eq!(remote.payload().unwrap(), json!("x"));
        remote.update(TaskStatus::Completed, &json!("x-done")).unwrap();
        assert!(!remote.is_active());

        let state = submitter.await_status_timeout(Duration::from_secs(2), TaskStatus::is_terminal);
        assert_eq!(state, TaskStatus::Completed);
        assert_eq!(submitter.payload().unwrap(), json!("x-done"));
        assert_eq!(submitter.task().origin, Origin::Handler);
    }

    #[test]
    fn test_deactivate_is_idempotent_and_keeps_foreign_informer() {
        let transport = bus();
        let scope = Scope::new("/task/d").unwrap();
        let shared = Arc::new(Informer::new(Arc::clone(&transport), scope.clone()));
        shared.activate();
        let cause = shared.prepare(TaskState::submitter());
        let proxy = TaskProxy::with_informer(transport, cause.data.clone(), &cause, Arc::clone(&shared));
        proxy.activate().unwrap();
        proxy.deactivate();
        proxy.deactivate();
        assert!(!proxy.is_active());
        assert!(shared.is_active());
    }
}
