//! Infrastructure adapters: the publish/subscribe transport and its
//! in-process backend.

pub mod transport;

pub use transport::{Event, EventId, InMemoryBus, Informer, Listener, Scope, Transport, TransportError};
