//! Subscribing side of the transport.
//!
//! A [`Listener`] attaches one sink to the transport and fans every
//! accepted event out to its handlers. Each handler is an unbounded
//! channel with an optional predicate, so delivery never blocks the
//! publishing thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::{Event, ParticipantId, Scope, Sink, SinkId, Transport, TransportError};

/// Predicate deciding whether a handler wants an event.
pub type Predicate<T> = Arc<dyn Fn(&Event<T>) -> bool + Send + Sync>;

/// Registration id of a handler inside one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Channel-backed event handler.
pub struct Handler<T> {
    sender: Sender<Event<T>>,
    predicate: Option<Predicate<T>>,
}

impl<T> Handler<T> {
    /// Forward every event into `sender`.
    pub const fn new(sender: Sender<Event<T>>) -> Self {
        Self {
            sender,
            predicate: None,
        }
    }

    /// Forward only events accepted by `predicate`.
    pub fn filtered<F>(sender: Sender<Event<T>>, predicate: F) -> Self
    where
        F: Fn(&Event<T>) -> bool + Send + Sync + 'static,
    {
        Self {
            sender,
            predicate: Some(Arc::new(predicate)),
        }
    }

    fn accepts(&self, event: &Event<T>) -> bool {
        self.predicate.as_ref().is_none_or(|p| p(event))
    }
}

impl<T> Clone for Handler<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

/// Create a handler and the receiving end of its queue.
#[must_use]
pub fn queue_adapter<T>() -> (Handler<T>, Receiver<Event<T>>) {
    let (tx, rx) = unbounded();
    (Handler::new(tx), rx)
}

/// Accept or drop events by publishing participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginFilter {
    /// Participant to match.
    pub origin: ParticipantId,
    /// Drop matching events instead of keeping only them.
    pub invert: bool,
}

impl OriginFilter {
    /// Drop every event published by `origin` (echo suppression).
    #[must_use]
    pub const fn exclude(origin: ParticipantId) -> Self {
        Self {
            origin,
            invert: true,
        }
    }

    /// Keep only events published by `origin`.
    #[must_use]
    pub const fn only(origin: ParticipantId) -> Self {
        Self {
            origin,
            invert: false,
        }
    }

    fn accepts<T>(&self, event: &Event<T>) -> bool {
        (event.id.participant == self.origin) != self.invert
    }
}

struct HandlerEntry<T> {
    id: HandlerId,
    handler: Handler<T>,
}

impl<T> Clone for HandlerEntry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: self.handler.clone(),
        }
    }
}

struct Shared<T> {
    filters: RwLock<Vec<OriginFilter>>,
    /// Copy-on-write handler list; dispatch clones the `Arc`, never the list.
    handlers: Mutex<Arc<Vec<HandlerEntry<T>>>>,
    /// Held shared by every in-flight dispatch, exclusively to wait them out.
    gate: RwLock<()>,
}

impl<T: Clone> Shared<T> {
    fn dispatch(&self, event: &Event<T>) {
        if !self.filters.read().iter().all(|f| f.accepts(event)) {
            trace!(event_id = %event.id, "event dropped by filter");
            return;
        }
        let _gate = self.gate.read();
        let handlers = Arc::clone(&*self.handlers.lock());
        for entry in handlers.iter() {
            if entry.handler.accepts(event) && entry.handler.sender.send(event.clone()).is_err() {
                trace!(handler = entry.id.0, "handler queue disconnected");
            }
        }
    }

    fn wait_for_dispatch(&self) {
        drop(self.gate.write());
    }
}

/// Subscriber on one scope with filters and a set of handlers.
pub struct Listener<T> {
    scope: Scope,
    transport: Arc<dyn Transport<T>>,
    shared: Arc<Shared<T>>,
    sink: Mutex<Option<SinkId>>,
    next_handler: AtomicU64,
}

impl<T> Listener<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an inactive listener on `scope`.
    pub fn new(transport: Arc<dyn Transport<T>>, scope: Scope) -> Self {
        Self {
            scope,
            transport,
            shared: Arc::new(Shared {
                filters: RwLock::new(Vec::new()),
                handlers: Mutex::new(Arc::new(Vec::new())),
                gate: RwLock::new(()),
            }),
            sink: Mutex::new(None),
            next_handler: AtomicU64::new(0),
        }
    }

    /// Subscribed scope.
    #[must_use]
    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Add a filter applied before any handler sees an event.
    pub fn add_filter(&self, filter: OriginFilter) {
        self.shared.filters.write().push(filter);
    }

    /// Start receiving events. Idempotent.
    ///
    /// # Errors
    ///
    /// Transport failure while attaching.
    pub fn activate(&self) -> Result<(), TransportError> {
        let mut sink = self.sink.lock();
        if sink.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let callback: Sink<T> = Arc::new(move |event: &Event<T>| shared.dispatch(event));
        *sink = Some(self.transport.attach(&self.scope, callback)?);
        debug!(scope = %self.scope, "listener activated");
        Ok(())
    }

    /// Stop receiving events and drop all handlers, which disconnects their
    /// queues. Idempotent.
    ///
    /// # Errors
    ///
    /// Transport failure while detaching; handlers are dropped regardless.
    pub fn deactivate(&self) -> Result<(), TransportError> {
        let sink = self.sink.lock().take();
        let detached = sink.map(|id| self.transport.detach(id));
        *self.shared.handlers.lock() = Arc::new(Vec::new());
        self.shared.wait_for_dispatch();
        debug!(scope = %self.scope, "listener deactivated");
        detached.unwrap_or(Ok(()))
    }

    /// Whether the listener is attached.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Register a handler. With `wait`, returns only after every dispatch
    /// that started before the registration has finished.
    pub fn add_handler(&self, handler: Handler<T>, wait: bool) -> HandlerId {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        {
            let mut handlers = self.shared.handlers.lock();
            let mut next: Vec<HandlerEntry<T>> = handlers.iter().cloned().collect();
            next.push(HandlerEntry { id, handler });
            *handlers = Arc::new(next);
        }
        if wait {
            self.shared.wait_for_dispatch();
        }
        id
    }

    /// Deregister a handler. With `wait`, returns only after no dispatch
    /// can still deliver to it. Returns false for unknown ids.
    pub fn remove_handler(&self, id: HandlerId, wait: bool) -> bool {
        let removed = {
            let mut handlers = self.shared.handlers.lock();
            let before = handlers.len();
            let next: Vec<HandlerEntry<T>> = handlers
                .iter()
                .filter(|e| e.id != id)
                .cloned()
                .collect();
            let removed = next.len() != before;
            *handlers = Arc::new(next);
            removed
        };
        if !removed {
            warn!(scope = %self.scope, handler = id.0, "removing unknown handler");
        }
        if wait {
            self.shared.wait_for_dispatch();
        }
        removed
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.shared.handlers.lock().len()
    }
}

impl<T> Drop for Listener<T> {
    fn drop(&mut self) {
        if let Some(id) = self.sink.get_mut().take() {
            let _ = self.transport.detach(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::transport::{Informer, InMemoryBus};
    use std::time::Duration;

    fn setup() -> (Arc<dyn Transport<String>>, Scope) {
        (Arc::new(InMemoryBus::new()), Scope::new("/test/").unwrap())
    }

    #[test]
    fn test_listener_receives_sub_scope_events() {
        let (bus, scope) = setup();
        let listener = Listener::new(Arc::clone(&bus), scope.clone());
        let (handler, rx) = queue_adapter();
        listener.add_handler(handler, true);
        listener.activate().unwrap();

        let informer = Informer::new(bus, scope.clone());
        informer.activate();
        let sub = scope.child("sub").unwrap();
        let event = informer.prepare_at(&sub, "hello".to_string()).unwrap();
        informer.send(&event).unwrap();

        let got = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got.data, "hello");
        assert_eq!(got.scope, sub);
    }

    #[test]
    fn test_origin_filter_suppresses_echo() {
        let (bus, scope) = setup();
        let informer = Informer::new(Arc::clone(&bus), scope.clone());
        informer.activate();
        let other = Informer::new(Arc::clone(&bus), scope.clone());
        other.activate();

        let listener = Listener::new(bus, scope);
        listener.add_filter(OriginFilter::exclude(informer.id()));
        let (handler, rx) = queue_adapter();
        listener.add_handler(handler, true);
        listener.activate().unwrap();

        informer.publish("echo".into()).unwrap();
        other.publish("foreign".into()).unwrap();

        let got = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got.data, "foreign");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_filtered_handler_and_removal() {
        let (bus, scope) = setup();
        let listener = Listener::new(Arc::clone(&bus), scope.clone());
        let (tx, rx) = unbounded();
        let id = listener.add_handler(Handler::filtered(tx, |e: &Event<String>| e.data.starts_with('a')), true);
        listener.activate().unwrap();

        let informer = Informer::new(bus, scope);
        informer.activate();
        informer.publish("apple".into()).unwrap();
        informer.publish("banana".into()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap().data, "apple");
        assert!(rx.try_recv().is_err());

        assert!(listener.remove_handler(id, true));
        assert_eq!(listener.handler_count(), 0);
        informer.publish("avocado".into()).unwrap();
        // The handler's sender is gone, so the queue is disconnected.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(!listener.remove_handler(id, false));
    }

    #[test]
    fn test_deactivate_disconnects_queues() {
        let (bus, scope) = setup();
        let listener = Listener::new(bus, scope);
        let (handler, rx) = queue_adapter();
        listener.add_handler(handler, false);
        listener.activate().unwrap();
        assert!(listener.is_active());
        listener.deactivate().unwrap();
        assert!(!listener.is_active());
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(50)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        ));
    }
}
