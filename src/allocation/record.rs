//! Allocation records exchanged with the arbiter.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::util::now_ms;

/// Half-open time slot `[begin, end)` in epoch milliseconds.
///
/// Decoding goes through [`Interval::new`], so an inverted slot from the
/// wire collapses to an empty one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "WireInterval")]
pub struct Interval {
    /// Inclusive start.
    pub begin: u64,
    /// Exclusive end.
    pub end: u64,
}

#[derive(Deserialize)]
struct WireInterval {
    begin: u64,
    end: u64,
}

impl From<WireInterval> for Interval {
    fn from(raw: WireInterval) -> Self {
        Self::new(raw.begin, raw.end)
    }
}

impl Interval {
    /// Slot from `begin` to `end`; an `end` before `begin` collapses to an empty slot.
    #[must_use]
    pub const fn new(begin: u64, end: u64) -> Self {
        Self {
            begin,
            end: if end < begin { begin } else { end },
        }
    }

    /// Slot starting `delay` from now and lasting `duration`.
    #[must_use]
    pub fn starting_in(delay: Duration, duration: Duration) -> Self {
        let begin = now_ms().saturating_add(millis(delay));
        Self::new(begin, begin.saturating_add(millis(duration)))
    }

    /// Slot length.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        Duration::from_millis(self.end.saturating_sub(self.begin))
    }

    /// Same length, moved by `amount` milliseconds.
    #[must_use]
    pub const fn shifted(&self, amount: i64) -> Self {
        Self::new(
            self.begin.saturating_add_signed(amount),
            self.end.saturating_add_signed(amount),
        )
    }

    /// Same length, starting at `begin`.
    #[must_use]
    pub const fn moved_to(&self, begin: u64) -> Self {
        Self::new(begin, begin.saturating_add(self.end.saturating_sub(self.begin)))
    }

    /// Same start, end moved by `amount` milliseconds.
    #[must_use]
    pub const fn extended(&self, amount: i64) -> Self {
        Self::new(self.begin, self.end.saturating_add_signed(amount))
    }

    /// Same start, ending at `end`.
    #[must_use]
    pub const fn extended_to(&self, end: u64) -> Self {
        Self::new(self.begin, end)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// How the arbiter may adjust a requested slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Policy {
    /// Keep the requested slot or reject.
    #[default]
    Preserve,
    /// Grant as much of the slot as possible.
    Maximum,
    /// Grant the first free slot of the requested length.
    First,
}

/// Arbiter priority hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// No priority.
    No,
    /// Low.
    Low,
    /// Normal.
    #[default]
    Normal,
    /// High.
    High,
    /// Urgent.
    Urgent,
    /// Emergency.
    Emergency,
}

/// Who asked for the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Initiator {
    /// An automated component.
    #[default]
    System,
    /// A person.
    Human,
}

/// Lifecycle state of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationState {
    /// Sent, not yet acknowledged.
    #[default]
    Requested,
    /// Accepted for a future slot.
    Scheduled,
    /// Granted; the slot is active.
    Allocated,
    /// Revoked or given up while granted.
    Aborted,
    /// Withdrawn before the grant.
    Cancelled,
    /// Refused by the arbiter.
    Rejected,
    /// Returned after use.
    Released,
}

impl AllocationState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Requested,
        Self::Scheduled,
        Self::Allocated,
        Self::Aborted,
        Self::Cancelled,
        Self::Rejected,
        Self::Released,
    ];

    /// True for `ABORTED`, `CANCELLED`, `REJECTED` and `RELEASED`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Aborted | Self::Cancelled | Self::Rejected | Self::Released
        )
    }

    /// Opposite of [`AllocationState::is_terminal`].
    #[must_use]
    pub const fn is_alive(self) -> bool {
        !self.is_terminal()
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Scheduled => "SCHEDULED",
            Self::Allocated => "ALLOCATED",
            Self::Aborted => "ABORTED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
            Self::Released => "RELEASED",
        }
    }
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named set of resources reserved for a time slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Immutable identifier.
    pub id: String,
    /// Resource names covered.
    pub resource_ids: Vec<String>,
    /// Requested or granted slot.
    pub slot: Interval,
    /// Slot adjustment hint.
    pub policy: Policy,
    /// Priority hint.
    pub priority: Priority,
    /// Who asked.
    pub initiator: Initiator,
    /// Free text.
    pub description: String,
    /// Lifecycle state.
    pub state: AllocationState,
}

impl Allocation {
    /// Start building an allocation over `resources`.
    pub fn builder<I, S>(resources: I) -> AllocationBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AllocationBuilder {
            resource_ids: resources.into_iter().map(Into::into).collect(),
            ..AllocationBuilder::default()
        }
    }

    /// Copy with a different state.
    #[must_use]
    pub fn with_state(&self, state: AllocationState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Copy with a different slot.
    #[must_use]
    pub fn with_slot(&self, slot: Interval) -> Self {
        Self {
            slot,
            ..self.clone()
        }
    }

    /// True if this allocation covers any of `resources`.
    #[must_use]
    pub fn covers_any(&self, resources: &[String]) -> bool {
        self.resource_ids.iter().any(|r| resources.contains(r))
    }
}

/// Builder for [`Allocation`].
#[derive(Debug, Clone, Default)]
pub struct AllocationBuilder {
    id: Option<String>,
    resource_ids: Vec<String>,
    slot: Option<Interval>,
    policy: Policy,
    priority: Priority,
    initiator: Initiator,
    description: String,
    state: Option<AllocationState>,
}

impl AllocationBuilder {
    /// Fixed id instead of a generated one.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Absolute slot.
    #[must_use]
    pub const fn slot(mut self, slot: Interval) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Slot starting `delay` from now and lasting `duration`.
    #[must_use]
    pub fn slot_in(mut self, delay: Duration, duration: Duration) -> Self {
        self.slot = Some(Interval::starting_in(delay, duration));
        self
    }

    /// Slot adjustment hint.
    #[must_use]
    pub const fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Priority hint.
    #[must_use]
    pub const fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Initiator hint.
    #[must_use]
    pub const fn initiator(mut self, initiator: Initiator) -> Self {
        self.initiator = initiator;
        self
    }

    /// Free text.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Initial state. Anything but `REQUESTED` is replaced at build time.
    #[must_use]
    pub const fn state(mut self, state: AllocationState) -> Self {
        self.state = Some(state);
        self
    }

    /// Finish the record. Without an id, the first 12 characters of a
    /// random v4 UUID are used; without a slot, an empty slot at now.
    #[must_use]
    pub fn build(self) -> Allocation {
        let id = self
            .id
            .unwrap_or_else(|| Uuid::new_v4().to_string().chars().take(12).collect());
        if let Some(state) = self.state.filter(|s| *s != AllocationState::Requested) {
            warn!(
                allocation_id = %id,
                state = %state,
                "invalid initial state, altering to REQUESTED"
            );
        }
        let slot = self.slot.unwrap_or_else(|| {
            let now = now_ms();
            Interval::new(now, now)
        });
        Allocation {
            id,
            resource_ids: self.resource_ids,
            slot,
            policy: self.policy,
            priority: self.priority,
            initiator: self.initiator,
            description: self.description,
            state: AllocationState::Requested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_generates_short_id_and_forces_requested() {
        let a = Allocation::builder(["arm"])
            .state(AllocationState::Allocated)
            .slot(Interval::new(10, 20))
            .build();
        assert_eq!(a.id.len(), 12);
        assert_eq!(a.state, AllocationState::Requested);
        assert_eq!(a.resource_ids, vec!["arm".to_string()]);
    }

    #[test]
    fn test_inverted_slot_from_the_wire_collapses() {
        let slot: Interval = serde_json::from_str(r#"{"begin": 1792434587800, "end": 1}"#).unwrap();
        assert_eq!(slot, Interval::new(1_792_434_587_800, 1_792_434_587_800));
        assert_eq!(slot.duration(), Duration::ZERO);
        assert_eq!(slot.moved_to(10), Interval::new(10, 10));
    }

    #[test]
    fn test_inverted_literal_slot_does_not_underflow() {
        let slot = Interval { begin: 50, end: 1 };
        assert_eq!(slot.duration(), Duration::ZERO);
        assert_eq!(slot.moved_to(10), Interval::new(10, 10));
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = AllocationState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                AllocationState::Aborted,
                AllocationState::Cancelled,
                AllocationState::Rejected,
                AllocationState::Released
            ]
        );
    }

    #[test]
    fn test_interval_arithmetic() {
        let slot = Interval::new(1_000, 2_000);
        assert_eq!(slot.shifted(500), Interval::new(1_500, 2_500));
        assert_eq!(slot.shifted(-500), Interval::new(500, 1_500));
        assert_eq!(slot.moved_to(5_000), Interval::new(5_000, 6_000));
        assert_eq!(slot.extended(250), Interval::new(1_000, 2_250));
        assert_eq!(slot.extended_to(3_000), Interval::new(1_000, 3_000));
        assert_eq!(slot.extended_to(500).duration(), Duration::ZERO);
    }

    #[test]
    fn test_state_wire_names() {
        let json = serde_json::to_string(&AllocationState::Allocated).unwrap();
        assert_eq!(json, "\"ALLOCATED\"");
        assert_eq!(AllocationState::Cancelled.to_string(), "CANCELLED");
    }
}
