//! Tests for error types

use resource_coordination::core::CoordinationError;
use resource_coordination::infra::TransportError;

#[test]
fn test_timeout_error() {
    let err = CoordinationError::Timeout("no handler".to_string());
    assert_eq!(format!("{}", err), "timed out: no handler");
}

#[test]
fn test_rejected_error() {
    let err = CoordinationError::Rejected("busy".to_string());
    assert_eq!(format!("{}", err), "task rejected: busy");
}

#[test]
fn test_transport_error_converts() {
    let err: CoordinationError = TransportError::Closed.into();
    assert!(matches!(err, CoordinationError::Transport(TransportError::Closed)));
}

#[test]
fn test_interruption_detected_through_anyhow() {
    let err = anyhow::Error::from(CoordinationError::Interrupted);
    assert!(CoordinationError::is_interruption(&err));
    let other = anyhow::anyhow!("plain failure");
    assert!(!CoordinationError::is_interruption(&other));
}
