//! Tests for allocation and task records

use resource_coordination::allocation::{Allocation, AllocationState, Interval, Priority};
use resource_coordination::task::{Origin, TaskState, TaskStatus, UTF8_SCHEMA};

#[test]
fn test_interval_arithmetic() {
    let slot = Interval::new(1_000, 2_000);
    assert_eq!(slot.shifted(500), Interval::new(1_500, 2_500));
    assert_eq!(slot.shifted(-500), Interval::new(500, 1_500));
    assert_eq!(slot.moved_to(5_000), Interval::new(5_000, 6_000));
    assert_eq!(slot.extended(250), Interval::new(1_000, 2_250));
    assert_eq!(slot.extended_to(3_000), Interval::new(1_000, 3_000));
    assert_eq!(slot.to_string(), "[1000, 2000)");
}

#[test]
fn test_interval_never_inverts() {
    let slot = Interval::new(2_000, 1_000);
    assert_eq!(slot.begin, slot.end);
    assert_eq!(Interval::new(1_000, 2_000).extended(-5_000).end, 1_000);
}

#[test]
fn test_builder_forces_requested_state() {
    let allocation = Allocation::builder(["arm", "gripper"])
        .state(AllocationState::Allocated)
        .priority(Priority::High)
        .build();
    assert_eq!(allocation.state, AllocationState::Requested);
    assert_eq!(allocation.id.len(), 12);
    assert!(allocation.covers_any(&["gripper".to_string()]));
    assert!(!allocation.covers_any(&["camera".to_string()]));
}

#[test]
fn test_allocation_wire_names() {
    let allocation = Allocation::builder(["arm"]).id("a-1").build();
    let json = serde_json::to_value(&allocation).unwrap();
    assert_eq!(json["state"], "REQUESTED");
    assert_eq!(json["policy"], "PRESERVE");
    assert_eq!(json["priority"], "NORMAL");
}

#[test]
fn test_terminal_allocation_states() {
    let terminal: Vec<_> = AllocationState::ALL
        .iter()
        .copied()
        .filter(|s| s.is_terminal())
        .collect();
    assert_eq!(
        terminal,
        vec![
            AllocationState::Aborted,
            AllocationState::Cancelled,
            AllocationState::Rejected,
            AllocationState::Released,
        ]
    );
}

#[test]
fn test_task_state_merge() {
    let mut local = TaskState::submitter();
    assert_eq!(local.origin, Origin::Submitter);
    assert_eq!(local.wire_schema, UTF8_SCHEMA);

    let remote = TaskState {
        origin: Origin::Handler,
        state: TaskStatus::Completed,
        serial: 3,
        payload: b"done".to_vec(),
        wire_schema: UTF8_SCHEMA.to_string(),
    };
    local.serial = 5;
    local.merge(&remote);
    assert_eq!(local.state, TaskStatus::Completed);
    assert_eq!(local.payload, b"done");
    assert_eq!(local.serial, 5);
    assert!(local.state.is_terminal());
}
