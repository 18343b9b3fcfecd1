//! Coordination configuration: allocation scope and protocol timeouts.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::CoordinationError;
use crate::infra::transport::Scope;

/// Environment variable selecting the allocation scope.
pub const SCOPE_VAR: &str = "SCOPE_ALLOCATION";

/// Allocation scope used when [`SCOPE_VAR`] is unset.
pub const FALLBACK_SCOPE: &str = "/coordination/allocation/";

/// Timing and addressing settings shared by the allocation and task protocols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Scope carrying allocation records.
    pub allocation_scope: Scope,
    /// How long a request may stay unacknowledged before the fallback applies.
    pub ack_timeout_ms: u64,
    /// How long a task submitter waits for the handler to accept.
    pub accept_timeout_ms: u64,
    /// How long a resource group waits for every member to be scheduled.
    pub group_grace_ms: u64,
    /// Poll interval of dispatcher threads.
    pub dispatch_poll_ms: u64,
    /// Upper bound on joining a dedicated worker at shutdown.
    pub executor_shutdown_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            allocation_scope: default_scope(),
            ack_timeout_ms: 5_000,
            accept_timeout_ms: 1_000,
            group_grace_ms: 500,
            dispatch_poll_ms: 2_000,
            executor_shutdown_ms: 5_000,
        }
    }
}

fn default_scope() -> Scope {
    Scope::new(FALLBACK_SCOPE).unwrap_or_else(|_| Scope::root())
}

impl CoordinationConfig {
    /// Validate timing values.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Config`] naming the first zero-valued field.
    pub fn validate(&self) -> Result<(), CoordinationError> {
        let fields = [
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("accept_timeout_ms", self.accept_timeout_ms),
            ("dispatch_poll_ms", self.dispatch_poll_ms),
            ("executor_shutdown_ms", self.executor_shutdown_ms),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(CoordinationError::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate. Missing fields
    /// take their defaults.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Config`] on parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, CoordinationError> {
        let cfg: Self = serde_json::from_str(input)
            .map_err(|e| CoordinationError::Config(format!("parse error: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults with the allocation scope taken from the environment.
    ///
    /// A `.env` file is loaded first if present. When [`SCOPE_VAR`] is unset
    /// the scope falls back to [`FALLBACK_SCOPE`] with a warning.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Config`] if the variable holds an invalid scope.
    pub fn from_env() -> Result<Self, CoordinationError> {
        dotenvy::dotenv().ok();
        let raw = std::env::var(SCOPE_VAR).ok();
        Self::with_scope_var(raw.as_deref())
    }

    fn with_scope_var(raw: Option<&str>) -> Result<Self, CoordinationError> {
        let allocation_scope = match raw {
            Some(raw) => Scope::new(raw)
                .map_err(|e| CoordinationError::Config(format!("{SCOPE_VAR}: {e}")))?,
            None => {
                warn!(
                    var = SCOPE_VAR,
                    fallback = FALLBACK_SCOPE,
                    "allocation scope not configured, using fallback"
                );
                default_scope()
            }
        };
        debug!(scope = %allocation_scope, "allocation scope selected");
        Ok(Self {
            allocation_scope,
            ..Self::default()
        })
    }

    /// Acknowledgment timeout.
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Task acceptance timeout.
    #[must_use]
    pub const fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    /// Resource group grace period.
    #[must_use]
    pub const fn group_grace(&self) -> Duration {
        Duration::from_millis(self.group_grace_ms)
    }

    /// Dispatcher poll interval.
    #[must_use]
    pub const fn dispatch_poll(&self) -> Duration {
        Duration::from_millis(self.dispatch_poll_ms)
    }

    /// Worker join bound at shutdown.
    #[must_use]
    pub const fn executor_shutdown(&self) -> Duration {
        Duration::from_millis(self.executor_shutdown_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let cfg = CoordinationConfig::default();
        assert_eq!(cfg.allocation_scope.as_str(), FALLBACK_SCOPE);
        assert_eq!(cfg.ack_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.accept_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.group_grace(), Duration::from_millis(500));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_scope_var_fallback_and_override() {
        let cfg = CoordinationConfig::with_scope_var(None).unwrap();
        assert_eq!(cfg.allocation_scope.as_str(), FALLBACK_SCOPE);
        let cfg = CoordinationConfig::with_scope_var(Some("/site/alloc")).unwrap();
        assert_eq!(cfg.allocation_scope.as_str(), "/site/alloc/");
        assert!(CoordinationConfig::with_scope_var(Some("/bad scope/")).is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = CoordinationConfig::from_json_str(r#"{"ack_timeout_ms": 150}"#).unwrap();
        assert_eq!(cfg.ack_timeout_ms, 150);
        assert_eq!(cfg.accept_timeout_ms, 1_000);
        assert!(CoordinationConfig::from_json_str(r#"{"dispatch_poll_ms": 0}"#).is_err());
    }
}
