//! Error types for coordination operations.

use thiserror::Error;

use crate::infra::transport::TransportError;

/// Errors produced by allocation and task components.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Publish or subscribe could not complete.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// A state transition was requested that the protocol does not allow.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// A blocking wait was interrupted.
    #[error("interrupted")]
    Interrupted,
    /// A blocking wait ran out of time.
    #[error("timed out: {0}")]
    Timeout(String),
    /// A job was cancelled before it produced a result.
    #[error("cancelled")]
    Cancelled,
    /// User-supplied work failed.
    #[error("execution failed: {0}")]
    Execution(String),
    /// The handler refused the task.
    #[error("task rejected: {0}")]
    Rejected(String),
    /// The task ended in an error state after being accepted.
    #[error("task ended abnormally ({state}): {reason}")]
    Abnormal {
        /// Final task state name.
        state: String,
        /// Payload text sent along with the state.
        reason: String,
    },
    /// One or more resources could not be scheduled.
    #[error("resource unavailable: {0}")]
    Unavailable(String),
    /// Payload could not be encoded or decoded.
    #[error("payload error: {0}")]
    Payload(String),
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A thread could not be spawned.
    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

impl CoordinationError {
    /// True if this error (or the one wrapped by an `anyhow` chain) means interruption.
    #[must_use]
    pub fn is_interruption(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<Self>(), Some(Self::Interrupted))
    }
}

/// Application-facing result using anyhow for user-supplied work.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoordinationError::IllegalState("SCHEDULED".into());
        assert_eq!(err.to_string(), "illegal state: SCHEDULED");

        let err = CoordinationError::Abnormal {
            state: "FAILED".into(),
            reason: "boom".into(),
        };
        assert_eq!(err.to_string(), "task ended abnormally (FAILED): boom");
    }

    #[test]
    fn test_interruption_detection() {
        let err: anyhow::Error = CoordinationError::Interrupted.into();
        assert!(CoordinationError::is_interruption(&err));

        let err = anyhow::anyhow!("plain failure");
        assert!(!CoordinationError::is_interruption(&err));
    }
}
