//! Shared publish/subscribe endpoint on the allocation scope.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::CoordinationConfig;
use crate::core::CoordinationError;
use crate::infra::transport::{
    EventId, Handler, HandlerId, Informer, Listener, OriginFilter, Scope, Transport,
};

use super::Allocation;

const DRAIN_ATTEMPTS: u32 = 100;
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// One informer and one listener on the allocation scope.
///
/// Every [`RemoteAllocation`](super::RemoteAllocation) of a process shares
/// one service, passed in as an `Arc`. The listener drops the service's own
/// publications, so a proxy only ever sees arbiter updates.
pub struct AllocationService {
    informer: Mutex<Informer<Allocation>>,
    listener: Listener<Allocation>,
    config: CoordinationConfig,
}

impl AllocationService {
    /// Create and activate the endpoint on `config.allocation_scope`.
    ///
    /// # Errors
    ///
    /// Invalid configuration or transport failure while subscribing.
    pub fn new(
        transport: Arc<dyn Transport<Allocation>>,
        config: CoordinationConfig,
    ) -> Result<Arc<Self>, CoordinationError> {
        config.validate()?;
        let scope = config.allocation_scope.clone();
        let informer = Informer::new(Arc::clone(&transport), scope.clone());
        let listener = Listener::new(transport, scope.clone());
        listener.add_filter(OriginFilter::exclude(informer.id()));
        listener.activate()?;
        informer.activate();
        info!(scope = %scope, "allocation service active");
        Ok(Arc::new(Self {
            informer: Mutex::new(informer),
            listener,
            config,
        }))
    }

    /// Publish `allocation`. Publications are serialized.
    ///
    /// # Errors
    ///
    /// Transport failure or an inactive service.
    pub fn update(&self, allocation: &Allocation) -> Result<EventId, CoordinationError> {
        let informer = self.informer.lock();
        let id = informer.publish(allocation.clone())?;
        debug!(
            allocation_id = %allocation.id,
            state = %allocation.state,
            slot = %allocation.slot,
            "allocation published"
        );
        Ok(id)
    }

    /// Register a handler for arbiter updates.
    pub fn add_handler(&self, handler: Handler<Allocation>, wait: bool) -> HandlerId {
        self.listener.add_handler(handler, wait)
    }

    /// Deregister a handler. Returns false for unknown ids.
    pub fn remove_handler(&self, id: HandlerId, wait: bool) -> bool {
        self.listener.remove_handler(id, wait)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.listener.handler_count()
    }

    /// Allocation scope.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        self.listener.scope()
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Acknowledgment timeout for requests through this service.
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        self.config.ack_timeout()
    }

    /// Whether the service can still publish.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.informer.lock().is_active()
    }

    /// Give registered handlers about a second to deregister, then shut down.
    pub fn shutdown(&self) {
        for _ in 0..DRAIN_ATTEMPTS {
            if self.handler_count() == 0 {
                break;
            }
            std::thread::sleep(DRAIN_INTERVAL);
        }
        let remaining = self.handler_count();
        if remaining > 0 {
            warn!(
                handlers = remaining,
                "shutting down although there may still be active allocation handlers"
            );
        }
        self.shutdown_now();
    }

    /// Deactivate both channels immediately. Handler queues disconnect.
    pub fn shutdown_now(&self) {
        self.informer.lock().deactivate();
        if let Err(e) = self.listener.deactivate() {
            warn!(error = %e, "allocation listener did not detach cleanly");
        }
        info!(scope = %self.scope(), "allocation service shut down");
    }
}
