//! Client-side proxy of one allocation.
//!
//! [`RemoteAllocation`] keeps the local view of an allocation in step with
//! the arbiter. Every request (schedule, slot change, state change) arms a
//! watchdog; if the arbiter stays silent for the acknowledgment timeout the
//! watchdog synthesizes a fallback update and feeds it through the same
//! transition path as a genuine one.
//!
//! # Locking
//!
//! - `transition` serializes transitions and their listener fan-out. It is
//!   reentrant so a listener may issue requests from its callback.
//! - `state` guards the record and the pending-request token; `cvar` is
//!   tied to it.
//! - `listeners` is separate; fan-out runs over a snapshot.
//!
//! Lock order is `transition` then `state`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use tracing::{debug, error, warn};

use crate::core::CoordinationError;
use crate::infra::transport::{queue_adapter, Event, HandlerId};
use crate::util::remaining_until;

use super::{Allocation, AllocationService, AllocationState, Interval};

/// Observer of allocation transitions.
pub trait SchedulerListener: Send + Sync {
    /// Called after every applied transition with the new record.
    fn allocation_updated(&self, allocation: &Allocation);
}

impl<F> SchedulerListener for F
where
    F: Fn(&Allocation) + Send + Sync,
{
    fn allocation_updated(&self, allocation: &Allocation) {
        self(allocation);
    }
}

/// Registration id returned by [`RemoteAllocation::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// What a watchdog applies when its request goes unacknowledged.
#[derive(Debug, Clone, Copy)]
enum Fallback {
    /// Initial publication: give up the request.
    Cancel,
    /// Slot change: cancel before the grant, abort after it.
    ByPhase,
    /// State change: apply the requested state locally.
    Force(AllocationState),
}

impl Fallback {
    const fn label(self) -> &'static str {
        match self {
            Self::Cancel => "request",
            Self::ByPhase => "slot",
            Self::Force(_) => "state",
        }
    }

    const fn resolve(self, current: AllocationState) -> AllocationState {
        match self {
            Self::Cancel => AllocationState::Cancelled,
            Self::ByPhase => match current {
                AllocationState::Requested | AllocationState::Scheduled => {
                    AllocationState::Cancelled
                }
                _ => AllocationState::Aborted,
            },
            Self::Force(state) => state,
        }
    }
}

struct ProxyState {
    allocation: Allocation,
    /// Generation of the request still waiting for an acknowledgment.
    pending: Option<u64>,
    generation: u64,
    handler: Option<HandlerId>,
    scheduled: bool,
}

impl ProxyState {
    fn arm(&mut self) -> u64 {
        self.generation += 1;
        self.pending = Some(self.generation);
        self.generation
    }
}

struct Inner {
    id: String,
    service: Arc<AllocationService>,
    transition: ReentrantMutex<()>,
    state: Mutex<ProxyState>,
    cvar: Condvar,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn SchedulerListener>)>>,
    next_listener: AtomicU64,
}

/// Local, authoritative proxy of a remote allocation.
///
/// Cloning yields another handle to the same proxy.
#[derive(Clone)]
pub struct RemoteAllocation {
    inner: Arc<Inner>,
}

impl RemoteAllocation {
    /// Wrap `allocation`. A state other than `REQUESTED` is replaced with a
    /// warning.
    #[must_use]
    pub fn new(service: Arc<AllocationService>, mut allocation: Allocation) -> Self {
        if allocation.state != AllocationState::Requested {
            warn!(
                allocation_id = %allocation.id,
                state = %allocation.state,
                "invalid initial state, altering to REQUESTED"
            );
            allocation.state = AllocationState::Requested;
        }
        Self {
            inner: Arc::new(Inner {
                id: allocation.id.clone(),
                service,
                transition: ReentrantMutex::new(()),
                state: Mutex::new(ProxyState {
                    allocation,
                    pending: None,
                    generation: 0,
                    handler: None,
                    scheduled: false,
                }),
                cvar: Condvar::new(),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    /// Allocation id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Service this proxy talks through.
    #[must_use]
    pub fn service(&self) -> &Arc<AllocationService> {
        &self.inner.service
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> AllocationState {
        self.inner.state.lock().allocation.state
    }

    /// Snapshot of the current record.
    #[must_use]
    pub fn allocation(&self) -> Allocation {
        self.inner.state.lock().allocation.clone()
    }

    /// False once a terminal state has been applied.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    /// Whether [`RemoteAllocation::schedule`] has been called.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.inner.state.lock().scheduled
    }

    /// Time until the slot ends while alive, zero otherwise.
    #[must_use]
    pub fn remaining_time(&self) -> Duration {
        let st = self.inner.state.lock();
        if st.allocation.state.is_alive() {
            remaining_until(st.allocation.slot.end)
        } else {
            Duration::ZERO
        }
    }

    /// Block until the state satisfies `done` or `timeout` passes. Returns
    /// the state observed last.
    pub fn await_until<P>(&self, timeout: Duration, done: P) -> AllocationState
    where
        P: Fn(AllocationState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut st = self.inner.state.lock();
        while !done(st.allocation.state) {
            if self.inner.cvar.wait_until(&mut st, deadline).timed_out() {
                break;
            }
        }
        st.allocation.state
    }

    /// Register an observer of transitions.
    pub fn add_listener<L>(&self, listener: L) -> ListenerId
    where
        L: SchedulerListener + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Deregister an observer. Returns false for unknown ids.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Deregister every observer.
    pub fn remove_all_listeners(&self) {
        self.inner.listeners.lock().clear();
    }

    /// Subscribe to arbiter updates, arm the acknowledgment watchdog and
    /// publish the request.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::IllegalState`] if already scheduled or no longer
    /// alive; spawn or transport failure otherwise. After a publish failure
    /// the watchdog still cancels the allocation.
    pub fn schedule(&self) -> Result<(), CoordinationError> {
        let (allocation, generation, rx) = {
            let _transition = self.inner.transition.lock();
            let mut st = self.inner.state.lock();
            if st.scheduled {
                return Err(CoordinationError::IllegalState(format!(
                    "allocation {} already scheduled",
                    self.inner.id
                )));
            }
            if !st.allocation.state.is_alive() {
                return Err(CoordinationError::IllegalState(format!(
                    "allocation {} is {} and cannot be scheduled",
                    self.inner.id, st.allocation.state
                )));
            }
            st.scheduled = true;
            let generation = st.arm();
            let (handler, rx) = queue_adapter();
            st.handler = Some(self.inner.service.add_handler(handler, true));
            (st.allocation.clone(), generation, rx)
        };
        debug!(
            allocation_id = %allocation.id,
            resources = ?allocation.resource_ids,
            slot = %allocation.slot,
            "allocation scheduled by client"
        );
        Inner::start_dispatcher(&self.inner, rx)?;
        Inner::start_watchdog(&self.inner, generation, Fallback::Cancel)?;
        self.inner.service.update(&allocation)?;
        Ok(())
    }

    /// Move the slot by `amount` milliseconds.
    ///
    /// # Errors
    ///
    /// See [`RemoteAllocation::schedule`].
    pub fn shift(&self, amount: i64) -> Result<(), CoordinationError> {
        self.request_slot(|slot| slot.shifted(amount))
    }

    /// Move the slot to start at `timestamp`, keeping its length.
    ///
    /// # Errors
    ///
    /// See [`RemoteAllocation::schedule`].
    pub fn shift_to(&self, timestamp: u64) -> Result<(), CoordinationError> {
        self.request_slot(|slot| slot.moved_to(timestamp))
    }

    /// Move the slot end by `amount` milliseconds.
    ///
    /// # Errors
    ///
    /// See [`RemoteAllocation::schedule`].
    pub fn extend(&self, amount: i64) -> Result<(), CoordinationError> {
        self.request_slot(|slot| slot.extended(amount))
    }

    /// Move the slot end to `timestamp`.
    ///
    /// # Errors
    ///
    /// See [`RemoteAllocation::schedule`].
    pub fn extend_to(&self, timestamp: u64) -> Result<(), CoordinationError> {
        self.request_slot(|slot| slot.extended_to(timestamp))
    }

    /// Give up a granted allocation.
    ///
    /// # Errors
    ///
    /// See [`RemoteAllocation::request_state`].
    pub fn abort(&self) -> Result<(), CoordinationError> {
        self.request_state(AllocationState::Aborted)
    }

    /// Return the allocation after use.
    ///
    /// # Errors
    ///
    /// See [`RemoteAllocation::request_state`].
    pub fn release(&self) -> Result<(), CoordinationError> {
        self.request_state(AllocationState::Released)
    }

    /// Withdraw the request.
    ///
    /// # Errors
    ///
    /// See [`RemoteAllocation::request_state`].
    pub fn cancel(&self) -> Result<(), CoordinationError> {
        self.request_state(AllocationState::Cancelled)
    }

    /// Ask the arbiter for `target`, one of `ABORTED`, `RELEASED` or
    /// `CANCELLED`. Without an acknowledgment the state is applied locally
    /// after the timeout. Before scheduling it is applied at once.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::IllegalState`] for any other target, nothing
    /// is sent; spawn or transport failure otherwise.
    pub fn request_state(&self, target: AllocationState) -> Result<(), CoordinationError> {
        if !matches!(
            target,
            AllocationState::Aborted | AllocationState::Released | AllocationState::Cancelled
        ) {
            warn!(
                allocation_id = %self.inner.id,
                state = %target,
                "illegal state request, skipping remote update"
            );
            return Err(CoordinationError::IllegalState(format!(
                "{target} cannot be requested by a client"
            )));
        }
        let transition = self.inner.transition.lock();
        let mut st = self.inner.state.lock();
        if !st.allocation.state.is_alive() {
            debug!(
                allocation_id = %self.inner.id,
                state = %st.allocation.state,
                requested = %target,
                "allocation not active anymore, skipping state change"
            );
            return Ok(());
        }
        let request = st.allocation.with_state(target);
        if !st.scheduled {
            drop(st);
            self.inner.apply(request);
            return Ok(());
        }
        let generation = st.arm();
        debug!(
            allocation_id = %self.inner.id,
            from = %st.allocation.state,
            to = %target,
            "attempting client allocation state change"
        );
        drop(st);
        drop(transition);
        Inner::start_watchdog(&self.inner, generation, Fallback::Force(target))?;
        self.inner.service.update(&request)?;
        Ok(())
    }

    /// Apply an update with this allocation's id. Both arbiter updates and
    /// watchdog fallbacks enter here; updates after a terminal state are
    /// ignored.
    pub fn allocation_updated(&self, update: Allocation) {
        let _transition = self.inner.transition.lock();
        self.inner.apply(update);
    }

    fn request_slot<F>(&self, change: F) -> Result<(), CoordinationError>
    where
        F: FnOnce(Interval) -> Interval,
    {
        let (request, generation) = {
            let _transition = self.inner.transition.lock();
            let mut st = self.inner.state.lock();
            let slot = change(st.allocation.slot);
            if !st.allocation.state.is_alive() {
                debug!(
                    allocation_id = %self.inner.id,
                    state = %st.allocation.state,
                    slot = %slot,
                    "allocation not active anymore, skipping slot change"
                );
                return Ok(());
            }
            if !st.scheduled {
                st.allocation.slot = slot;
                return Ok(());
            }
            let generation = st.arm();
            debug!(
                allocation_id = %self.inner.id,
                from = %st.allocation.slot,
                to = %slot,
                "attempting client allocation slot change"
            );
            (st.allocation.with_slot(slot), generation)
        };
        Inner::start_watchdog(&self.inner, generation, Fallback::ByPhase)?;
        self.inner.service.update(&request)?;
        Ok(())
    }
}

impl Inner {
    fn is_alive(&self) -> bool {
        self.state.lock().allocation.state.is_alive()
    }

    /// Caller holds `transition`.
    fn apply(&self, update: Allocation) {
        let (current, handler) = {
            let mut st = self.state.lock();
            if update.id != st.allocation.id {
                debug!(allocation_id = %self.id, other = %update.id, "ignoring update for other allocation");
                return;
            }
            if !st.allocation.state.is_alive() {
                debug!(
                    allocation_id = %self.id,
                    state = %st.allocation.state,
                    ignored = %update.state,
                    "allocation already terminated, ignoring update"
                );
                return;
            }
            debug!(
                allocation_id = %self.id,
                from = %st.allocation.state,
                to = %update.state,
                "allocation updated"
            );
            st.allocation = update;
            st.pending = None;
            self.cvar.notify_all();
            let handler = if st.allocation.state.is_terminal() {
                st.handler.take()
            } else {
                None
            };
            (st.allocation.clone(), handler)
        };

        let snapshot: Vec<Arc<dyn SchedulerListener>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in &snapshot {
            listener.allocation_updated(&current);
        }

        if let Some(handler) = handler {
            debug!(allocation_id = %self.id, "stop listening to arbiter updates");
            if !self.service.remove_handler(handler, true) {
                error!(allocation_id = %self.id, "could not remove allocation handler");
            }
        }
    }

    fn start_dispatcher(
        inner: &Arc<Self>,
        rx: Receiver<Event<Allocation>>,
    ) -> Result<(), CoordinationError> {
        let inner = Arc::clone(inner);
        let poll = inner.service.config().dispatch_poll();
        thread::Builder::new()
            .name(format!("allocation-dispatcher#{}", inner.id))
            .spawn(move || {
                while inner.is_alive() {
                    match rx.recv_timeout(poll) {
                        Ok(event) if event.data.id == inner.id => {
                            let _transition = inner.transition.lock();
                            inner.apply(event.data);
                        }
                        Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            debug!(allocation_id = %inner.id, "allocation queue disconnected");
                            break;
                        }
                    }
                }
            })?;
        Ok(())
    }

    fn start_watchdog(
        inner: &Arc<Self>,
        generation: u64,
        fallback: Fallback,
    ) -> Result<(), CoordinationError> {
        let inner = Arc::clone(inner);
        thread::Builder::new()
            .name(format!("allocation-{}-timeout#{}", fallback.label(), inner.id))
            .spawn(move || inner.watch(generation, fallback))?;
        Ok(())
    }

    fn watch(&self, generation: u64, fallback: Fallback) {
        let timeout = self.service.ack_timeout();
        let deadline = Instant::now() + timeout;
        {
            let mut st = self.state.lock();
            while st.pending == Some(generation) {
                if self.cvar.wait_until(&mut st, deadline).timed_out() {
                    break;
                }
            }
            if st.pending != Some(generation) {
                return;
            }
        }

        let _transition = self.transition.lock();
        let update = {
            let st = self.state.lock();
            // An update may have landed between the wait and the lock.
            if st.pending != Some(generation) || !st.allocation.state.is_alive() {
                return;
            }
            let target = fallback.resolve(st.allocation.state);
            warn!(
                allocation_id = %self.id,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                request = fallback.label(),
                from = %st.allocation.state,
                to = %target,
                "client allocation request timed out, applying fallback"
            );
            st.allocation.with_state(target)
        };
        self.apply(update);
    }
}

impl fmt::Debug for RemoteAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("RemoteAllocation")
            .field("id", &self.inner.id)
            .field("state", &st.allocation.state)
            .field("slot", &st.allocation.slot)
            .field("scheduled", &st.scheduled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinationConfig;
    use crate::infra::transport::{InMemoryBus, Transport};

    fn service(ack_ms: u64) -> Arc<AllocationService> {
        let bus: Arc<dyn Transport<Allocation>> = Arc::new(InMemoryBus::new());
        let config = CoordinationConfig {
            ack_timeout_ms: ack_ms,
            dispatch_poll_ms: 20,
            ..CoordinationConfig::default()
        };
        AllocationService::new(bus, config).unwrap()
    }

    fn proxy(svc: &Arc<AllocationService>) -> RemoteAllocation {
        RemoteAllocation::new(
            Arc::clone(svc),
            Allocation::builder(["r"]).slot_in(Duration::ZERO, Duration::from_secs(5)).build(),
        )
    }

    #[test]
    fn test_unacknowledged_schedule_cancels() {
        let svc = service(50);
        let p = proxy(&svc);
        p.schedule().unwrap();
        assert_eq!(svc.handler_count(), 1);
        let state = p.await_until(Duration::from_secs(2), AllocationState::is_terminal);
        assert_eq!(state, AllocationState::Cancelled);
        assert_eq!(svc.handler_count(), 0);
        assert_eq!(p.remaining_time(), Duration::ZERO);
    }

    #[test]
    fn test_second_schedule_is_illegal() {
        let svc = service(5_000);
        let p = proxy(&svc);
        p.schedule().unwrap();
        assert!(matches!(p.schedule(), Err(CoordinationError::IllegalState(_))));
        p.allocation_updated(p.allocation().with_state(AllocationState::Rejected));
    }

    #[test]
    fn test_illegal_state_request_is_rejected() {
        let svc = service(5_000);
        let p = proxy(&svc);
        for state in [
            AllocationState::Requested,
            AllocationState::Scheduled,
            AllocationState::Allocated,
            AllocationState::Rejected,
        ] {
            assert!(matches!(
                p.request_state(state),
                Err(CoordinationError::IllegalState(_))
            ));
        }
        assert_eq!(p.state(), AllocationState::Requested);
    }

    #[test]
    fn test_local_changes_before_schedule() {
        let svc = service(5_000);
        let p = proxy(&svc);
        let slot = p.allocation().slot;
        p.extend(1_000).unwrap();
        assert_eq!(p.allocation().slot, slot.extended(1_000));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        p.add_listener(move |a: &Allocation| s.lock().push(a.state));
        p.cancel().unwrap();
        assert_eq!(p.state(), AllocationState::Cancelled);
        assert_eq!(*seen.lock(), vec![AllocationState::Cancelled]);
        assert!(p.schedule().is_err());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let svc = service(5_000);
        let p = proxy(&svc);
        p.schedule().unwrap();
        let base = p.allocation();
        p.allocation_updated(base.with_state(AllocationState::Released));
        p.allocation_updated(base.with_state(AllocationState::Allocated));
        assert_eq!(p.state(), AllocationState::Released);

        // Requests on a dead allocation change nothing.
        p.shift(1_000).unwrap();
        p.abort().unwrap();
        assert_eq!(p.allocation().slot, base.slot);
        assert_eq!(p.state(), AllocationState::Released);
    }

    #[test]
    fn test_slot_fallback_reads_phase_at_timeout() {
        let svc = service(80);
        let p = proxy(&svc);
        p.schedule().unwrap();
        p.allocation_updated(p.allocation().with_state(AllocationState::Allocated));
        p.extend(1_000).unwrap();
        let state = p.await_until(Duration::from_secs(2), AllocationState::is_terminal);
        assert_eq!(state, AllocationState::Aborted);
    }

    #[test]
    fn test_listener_removal() {
        let svc = service(5_000);
        let p = proxy(&svc);
        let calls = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&calls);
        let id = p.add_listener(move |_: &Allocation| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(p.remove_listener(id));
        assert!(!p.remove_listener(id));
        p.cancel().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
