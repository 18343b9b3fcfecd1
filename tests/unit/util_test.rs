//! Tests for utility functions

use resource_coordination::util::{init_tracing, now_ms, remaining_until};
use std::time::Duration;

#[test]
fn test_now_ms_is_monotonic_enough() {
    let a = now_ms();
    let b = now_ms();
    assert!(b >= a);
    assert!(a > 1_600_000_000_000);
}

#[test]
fn test_remaining_until() {
    assert_eq!(remaining_until(now_ms().saturating_sub(1000)), Duration::ZERO);
    assert!(remaining_until(now_ms() + 60_000) > Duration::from_secs(50));
}

#[test]
fn test_init_tracing_twice() {
    init_tracing();
    init_tracing();
}
