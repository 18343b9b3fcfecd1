//! Publish/subscribe transport contract.
//!
//! The allocation and task protocols only need a handful of guarantees from
//! the transport:
//!
//! - **Hierarchical scopes**: a subscription on `/a/` sees events on `/a/`
//!   and every sub-scope such as `/a/b/`.
//! - **Echo suppression**: a [`Listener`] can drop events published by a
//!   given [`Informer`] via an [`OriginFilter`].
//! - **Causal linkage**: an [`Event`] lists the ids of the events that
//!   caused it.
//!
//! Anything implementing [`Transport`] can carry the protocols. The crate
//! ships [`InMemoryBus`] for in-process use and tests.

pub mod informer;
pub mod listener;
pub mod memory;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use informer::Informer;
pub use listener::{queue_adapter, Handler, HandlerId, Listener, OriginFilter, Predicate};
pub use memory::InMemoryBus;

/// Errors produced by transport implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The participant is not active.
    #[error("participant inactive at {0}")]
    Inactive(String),
    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
    /// A scope string could not be parsed.
    #[error("invalid scope: {0}")]
    InvalidScope(String),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Hierarchical address, always normalised to the form `/a/b/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Scope(String);

impl Scope {
    /// Parse and normalise a scope. Empty components are collapsed, so
    /// `"a//b"` becomes `/a/b/`.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidScope`] if a component holds characters
    /// other than ASCII alphanumerics, `_` and `-`.
    pub fn new(raw: &str) -> Result<Self, TransportError> {
        let mut normalised = String::from("/");
        for component in raw.split('/').filter(|c| !c.is_empty()) {
            if !component
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(TransportError::InvalidScope(raw.to_owned()));
            }
            normalised.push_str(component);
            normalised.push('/');
        }
        Ok(Self(normalised))
    }

    /// The root scope `/`.
    #[must_use]
    pub fn root() -> Self {
        Self("/".into())
    }

    /// Normalised string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `other` equals this scope or lies below it.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Sub-scope named `component`.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidScope`] if `component` is not a valid name.
    pub fn child(&self, component: &str) -> Result<Self, TransportError> {
        Self::new(&format!("{}{component}", self.0))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Scope {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Scope {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.0
    }
}

/// Identity of a publishing participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    /// Fresh random id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Globally unique event id: the publisher plus its sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId {
    /// Publishing participant.
    pub participant: ParticipantId,
    /// Per-participant sequence number, starting at 1.
    pub sequence: u64,
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.participant, self.sequence)
    }
}

/// A published record together with its addressing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    /// Unique id assigned by the publishing informer.
    pub id: EventId,
    /// Scope the event was published on.
    pub scope: Scope,
    /// Ids of events that caused this one.
    pub causes: Vec<EventId>,
    /// Payload record.
    pub data: T,
}

impl<T> Event<T> {
    /// Declare `cause` as a cause of this event.
    pub fn add_cause(&mut self, cause: EventId) {
        if !self.causes.contains(&cause) {
            self.causes.push(cause);
        }
    }

    /// True if `cause` is among this event's causes.
    #[must_use]
    pub fn caused_by(&self, cause: &EventId) -> bool {
        self.causes.contains(cause)
    }
}

/// Callback receiving every event delivered on an attached scope.
pub type Sink<T> = Arc<dyn Fn(&Event<T>) + Send + Sync>;

/// Registration handle for an attached sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

impl SinkId {
    /// Wrap a backend-assigned registration number.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Backend-assigned registration number.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Minimal publish/subscribe backend.
///
/// Implementations must deliver an event to every sink whose scope
/// contains the event's scope, and must preserve publish order per
/// publishing thread.
pub trait Transport<T>: Send + Sync {
    /// Register `sink` for events on `scope` and its sub-scopes.
    ///
    /// # Errors
    ///
    /// Backend failure or a closed transport.
    fn attach(&self, scope: &Scope, sink: Sink<T>) -> Result<SinkId, TransportError>;

    /// Remove a sink. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Backend failure.
    fn detach(&self, id: SinkId) -> Result<(), TransportError>;

    /// Deliver `event` to all matching sinks.
    ///
    /// # Errors
    ///
    /// Backend failure or a closed transport.
    fn deliver(&self, event: &Event<T>) -> Result<(), TransportError>;
}
