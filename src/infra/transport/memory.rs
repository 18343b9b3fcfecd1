//! In-process transport.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{Event, Scope, Sink, SinkId, Transport, TransportError};

/// Synchronous in-memory bus.
///
/// `deliver` invokes every matching sink on the publishing thread, so events
/// from one thread arrive in publish order.
pub struct InMemoryBus<T> {
    sinks: RwLock<Vec<(SinkId, Scope, Sink<T>)>>,
    next_sink: AtomicU64,
    closed: AtomicBool,
}

impl<T> InMemoryBus<T> {
    /// Create an empty, open bus.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
            next_sink: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Refuse further attach and deliver calls and drop every sink.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.sinks.write().clear();
        debug!("in-memory bus closed");
    }

    /// Whether [`InMemoryBus::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of attached sinks.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }
}

impl<T> Default for InMemoryBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Transport<T> for InMemoryBus<T>
where
    T: Send + Sync,
{
    fn attach(&self, scope: &Scope, sink: Sink<T>) -> Result<SinkId, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let id = SinkId::new(self.next_sink.fetch_add(1, Ordering::Relaxed));
        self.sinks.write().push((id, scope.clone(), sink));
        trace!(sink = id.raw(), scope = %scope, "sink attached");
        Ok(id)
    }

    fn detach(&self, id: SinkId) -> Result<(), TransportError> {
        self.sinks.write().retain(|(sink_id, _, _)| *sink_id != id);
        trace!(sink = id.raw(), "sink detached");
        Ok(())
    }

    fn deliver(&self, event: &Event<T>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        // Sinks run outside the lock so they may attach or detach.
        let targets: Vec<Sink<T>> = self
            .sinks
            .read()
            .iter()
            .filter(|(_, scope, _)| scope.contains(&event.scope))
            .map(|(_, _, sink)| Sink::clone(sink))
            .collect();
        for sink in targets {
            sink(event);
        }
        Ok(())
    }
}
