//! Task state records exchanged between submitter and handler.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::payload::UTF8_SCHEMA;

/// Which side last wrote a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Origin {
    /// The side that asked for the task.
    Submitter,
    /// The side executing it.
    Handler,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Submitted, waiting for a handler.
    #[default]
    Initiated,
    /// A handler took the task.
    Accepted,
    /// No handler could take the task.
    Rejected,
    /// Submitter changes the task description.
    Update,
    /// Handler refused the change.
    UpdateRejected,
    /// A partial result is in the payload.
    ResultAvailable,
    /// Submitter asks to stop.
    Abort,
    /// Handler stopped the task.
    Aborted,
    /// Handler could not stop the task.
    AbortFailed,
    /// Finished; the result is in the payload.
    Completed,
    /// Failed; the reason is in the payload.
    Failed,
}

impl TaskStatus {
    /// True for `ABORTED`, `FAILED`, `REJECTED` and `COMPLETED`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Aborted | Self::Failed | Self::Rejected | Self::Completed
        )
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::Update => "UPDATE",
            Self::UpdateRejected => "UPDATE_REJECTED",
            Self::ResultAvailable => "RESULT_AVAILABLE",
            Self::Abort => "ABORT",
            Self::Aborted => "ABORTED",
            Self::AbortFailed => "ABORT_FAILED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task record carried on the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    /// Side that last wrote the record.
    pub origin: Origin,
    /// Lifecycle state.
    pub state: TaskStatus,
    /// Publish counter of the writing side.
    pub serial: u64,
    /// Encoded payload.
    pub payload: Vec<u8>,
    /// Codec tag of `payload`.
    pub wire_schema: String,
}

impl TaskState {
    /// Fresh submitter record in `INITIATED` with an empty payload.
    #[must_use]
    pub fn submitter() -> Self {
        Self {
            origin: Origin::Submitter,
            state: TaskStatus::Initiated,
            serial: 0,
            payload: Vec::new(),
            wire_schema: UTF8_SCHEMA.to_owned(),
        }
    }

    /// Take every field of `other`. The serial never goes backwards.
    pub fn merge(&mut self, other: &Self) {
        self.origin = other.origin;
        self.state = other.state;
        self.serial = self.serial.max(other.serial);
        self.payload.clone_from(&other.payload);
        self.wire_schema.clone_from(&other.wire_schema);
    }
}
