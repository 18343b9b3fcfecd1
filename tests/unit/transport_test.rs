//! Tests for the transport contract

use std::sync::Arc;
use std::time::Duration;

use resource_coordination::infra::transport::{
    queue_adapter, InMemoryBus, Informer, Listener, ParticipantId, Scope, Transport, TransportError,
};

#[test]
fn test_scope_normalisation() {
    let scope = Scope::new("a//b").unwrap();
    assert_eq!(scope.as_str(), "/a/b/");
    assert_eq!(Scope::new("").unwrap(), Scope::root());
    assert!(Scope::new("/a b/").is_err());
}

#[test]
fn test_scope_containment() {
    let parent = Scope::new("/coordination/").unwrap();
    let child = parent.child("allocation").unwrap();
    assert!(parent.contains(&child));
    assert!(parent.contains(&parent));
    assert!(!child.contains(&parent));
    assert!(!Scope::new("/coord/").unwrap().contains(&parent));
}

#[test]
fn test_inactive_informer_refuses_to_send() {
    let bus: Arc<dyn Transport<u32>> = Arc::new(InMemoryBus::new());
    let informer = Informer::new(bus, Scope::root());
    assert!(matches!(informer.publish(1), Err(TransportError::Inactive(_))));
}

#[test]
fn test_sibling_scopes_do_not_see_each_other() {
    let bus: Arc<dyn Transport<u32>> = Arc::new(InMemoryBus::new());
    let listener = Listener::new(Arc::clone(&bus), Scope::new("/left/").unwrap());
    let (handler, rx) = queue_adapter();
    listener.add_handler(handler, true);
    listener.activate().unwrap();

    let informer = Informer::new(bus, Scope::new("/right/").unwrap());
    informer.activate();
    informer.publish(7).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn test_event_ids_increase_per_participant() {
    let bus: Arc<dyn Transport<u32>> = Arc::new(InMemoryBus::new());
    let informer = Informer::new(bus, Scope::root());
    let first = informer.prepare(1);
    let second = informer.prepare(2);
    assert_eq!(first.id.participant, second.id.participant);
    assert!(second.id.sequence > first.id.sequence);
}

#[test]
fn test_closed_bus_rejects_delivery() {
    let bus = Arc::new(InMemoryBus::<u32>::new());
    bus.close();
    let informer = Informer::new(Arc::clone(&bus) as Arc<dyn Transport<u32>>, Scope::root());
    informer.activate();
    assert!(matches!(informer.publish(1), Err(TransportError::Closed)));
}

#[test]
fn test_participant_id_serialises_as_uuid_string() {
    let id = ParticipantId::random();
    let encoded = serde_json::to_string(&id).unwrap();
    assert_eq!(encoded, format!("\"{id}\""));
    let decoded: ParticipantId = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, id);
}
