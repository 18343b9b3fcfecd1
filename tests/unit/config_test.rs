//! Tests for configuration validation

use resource_coordination::config::{CoordinationConfig, FALLBACK_SCOPE};
use std::time::Duration;

#[test]
fn test_default_config_is_valid() {
    let cfg = CoordinationConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.allocation_scope.as_str(), FALLBACK_SCOPE);
    assert_eq!(cfg.ack_timeout(), Duration::from_millis(5000));
    assert_eq!(cfg.dispatch_poll(), Duration::from_millis(2000));
}

#[test]
fn test_config_invalid_ack_timeout() {
    let invalid = CoordinationConfig {
        ack_timeout_ms: 0,
        ..CoordinationConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_config_invalid_poll() {
    let invalid = CoordinationConfig {
        dispatch_poll_ms: 0,
        ..CoordinationConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_config_from_json_fills_defaults() {
    let cfg = CoordinationConfig::from_json_str(
        r#"{ "allocation_scope": "/lab/allocation", "ack_timeout_ms": 250 }"#,
    )
    .unwrap();
    assert_eq!(cfg.allocation_scope.as_str(), "/lab/allocation/");
    assert_eq!(cfg.ack_timeout_ms, 250);
    assert_eq!(cfg.accept_timeout_ms, 1000);
}

#[test]
fn test_config_from_json_rejects_bad_scope() {
    assert!(CoordinationConfig::from_json_str(r#"{ "allocation_scope": "/a b/" }"#).is_err());
    assert!(CoordinationConfig::from_json_str(r#"{ "accept_timeout_ms": 0 }"#).is_err());
}
