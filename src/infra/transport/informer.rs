//! Publishing side of the transport.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use super::{Event, EventId, ParticipantId, Scope, Transport, TransportError};

/// Publisher bound to one scope, with its own participant id.
///
/// Event ids are assigned when an event is prepared, so a caller can learn
/// the id (for example to correlate replies) before the event goes out.
pub struct Informer<T> {
    id: ParticipantId,
    scope: Scope,
    transport: Arc<dyn Transport<T>>,
    active: AtomicBool,
    sequence: AtomicU64,
}

impl<T> Informer<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an inactive informer on `scope`.
    pub fn new(transport: Arc<dyn Transport<T>>, scope: Scope) -> Self {
        Self {
            id: ParticipantId::random(),
            scope,
            transport,
            active: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
        }
    }

    /// Participant id stamped on every event.
    #[must_use]
    pub const fn id(&self) -> ParticipantId {
        self.id
    }

    /// Default publishing scope.
    #[must_use]
    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Allow publishing.
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Refuse further publishing.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether publishing is allowed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Build an event on the informer's scope with a fresh id.
    pub fn prepare(&self, data: T) -> Event<T> {
        Event {
            id: self.next_id(),
            scope: self.scope.clone(),
            causes: Vec::new(),
            data,
        }
    }

    /// Build an event on `scope`, which must lie within the informer's scope.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidScope`] if `scope` is outside the informer's scope.
    pub fn prepare_at(&self, scope: &Scope, data: T) -> Result<Event<T>, TransportError> {
        if !self.scope.contains(scope) {
            return Err(TransportError::InvalidScope(format!(
                "{scope} is outside informer scope {}",
                self.scope
            )));
        }
        Ok(Event {
            id: self.next_id(),
            scope: scope.clone(),
            causes: Vec::new(),
            data,
        })
    }

    /// Publish a prepared event.
    ///
    /// # Errors
    ///
    /// [`TransportError::Inactive`] if not activated, or a backend failure.
    pub fn send(&self, event: &Event<T>) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::Inactive(self.scope.to_string()));
        }
        trace!(event_id = %event.id, scope = %event.scope, "publishing event");
        self.transport.deliver(event)
    }

    /// Prepare and publish `data` on the informer's scope.
    ///
    /// # Errors
    ///
    /// See [`Informer::send`].
    pub fn publish(&self, data: T) -> Result<EventId, TransportError> {
        let event = self.prepare(data);
        self.send(&event)?;
        Ok(event.id)
    }

    fn next_id(&self) -> EventId {
        EventId {
            participant: self.id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::transport::InMemoryBus;

    #[test]
    fn test_inactive_informer_refuses_publish() {
        let bus: Arc<dyn Transport<u32>> = Arc::new(InMemoryBus::new());
        let informer = Informer::new(bus, Scope::new("/t/").unwrap());
        assert!(matches!(informer.publish(1), Err(TransportError::Inactive(_))));
        informer.activate();
        assert!(informer.publish(1).is_ok());
    }

    #[test]
    fn test_event_ids_are_sequential_per_informer() {
        let bus: Arc<dyn Transport<u32>> = Arc::new(InMemoryBus::new());
        let informer = Informer::new(bus, Scope::new("/t/").unwrap());
        let first = informer.prepare(1);
        let second = informer.prepare(2);
        assert_eq!(first.id.participant, informer.id());
        assert_eq!(second.id.sequence, first.id.sequence + 1);
    }

    #[test]
    fn test_prepare_at_rejects_foreign_scope() {
        let bus: Arc<dyn Transport<u32>> = Arc::new(InMemoryBus::new());
        let informer = Informer::new(bus, Scope::new("/t/").unwrap());
        assert!(informer.prepare_at(&Scope::new("/t/sub").unwrap(), 1).is_ok());
        assert!(informer.prepare_at(&Scope::new("/other").unwrap(), 1).is_err());
    }
}
