//! Shared fixtures: an in-process bus and a scripted arbiter.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use resource_coordination::allocation::{Allocation, AllocationService, AllocationState};
use resource_coordination::config::CoordinationConfig;
use resource_coordination::infra::transport::{queue_adapter, InMemoryBus, Informer, Listener, OriginFilter, Transport};

/// How the arbiter answers a new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// `SCHEDULED`, then `ALLOCATED` after the delay.
    Grant(Duration),
    /// `REJECTED`.
    Reject,
    /// Never answers anything.
    Silent,
}

/// Arbiter stand-in answering every allocation request per its script.
///
/// State requests (`RELEASED`, `CANCELLED`, `ABORTED`) and slot changes are
/// acknowledged by echoing them back, unless the script is `Silent`.
pub struct Arbiter {
    informer: Arc<Informer<Allocation>>,
    listener: Listener<Allocation>,
    received: Arc<Mutex<Vec<Allocation>>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Arbiter {
    pub fn start<F>(transport: Arc<dyn Transport<Allocation>>, config: &CoordinationConfig, script: F) -> Self
    where
        F: Fn(&Allocation) -> Script + Send + 'static,
    {
        let scope = config.allocation_scope.clone();
        let informer = Arc::new(Informer::new(Arc::clone(&transport), scope.clone()));
        informer.activate();
        let listener = Listener::new(transport, scope);
        listener.add_filter(OriginFilter::exclude(informer.id()));
        let (handler, rx) = queue_adapter();
        listener.add_handler(handler, true);
        listener.activate().unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let informer = Arc::clone(&informer);
            let received = Arc::clone(&received);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("scripted-arbiter".into())
                .spawn(move || {
                    while running.load(Ordering::Acquire) {
                        let event = match rx.recv_timeout(Duration::from_millis(20)) {
                            Ok(event) => event,
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => break,
                        };
                        let request = event.data;
                        received.lock().push(request.clone());
                        let script = script(&request);
                        if script == Script::Silent {
                            continue;
                        }
                        if request.state == AllocationState::Requested {
                            answer(&informer, &request, script);
                        } else {
                            let _ = informer.publish(request);
                        }
                    }
                })
                .unwrap()
        };

        Self {
            informer,
            listener,
            received,
            running,
            thread: Some(thread),
        }
    }

    /// Every request seen so far.
    pub fn received(&self) -> Vec<Allocation> {
        self.received.lock().clone()
    }

    /// Publish an arbitrary update, as an arbiter revoking a grant would.
    pub fn push(&self, allocation: Allocation) {
        self.informer.publish(allocation).unwrap();
    }
}

fn answer(informer: &Informer<Allocation>, request: &Allocation, script: Script) {
    match script {
        Script::Grant(delay) => {
            let _ = informer.publish(request.with_state(AllocationState::Scheduled));
            thread::sleep(delay);
            let _ = informer.publish(request.with_state(AllocationState::Allocated));
        }
        Script::Reject => {
            let _ = informer.publish(request.with_state(AllocationState::Rejected));
        }
        Script::Silent => {}
    }
}

impl Drop for Arbiter {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        let _ = self.listener.deactivate();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Config with short timings for tests.
pub fn fast_config(ack_ms: u64) -> CoordinationConfig {
    CoordinationConfig {
        ack_timeout_ms: ack_ms,
        dispatch_poll_ms: 20,
        group_grace_ms: 500,
        executor_shutdown_ms: 1000,
        ..CoordinationConfig::default()
    }
}

/// Bus, service and config wired together.
pub fn allocation_setup(ack_ms: u64) -> (Arc<dyn Transport<Allocation>>, Arc<AllocationService>, CoordinationConfig) {
    let bus: Arc<dyn Transport<Allocation>> = Arc::new(InMemoryBus::new());
    let config = fast_config(ack_ms);
    let service = AllocationService::new(Arc::clone(&bus), config.clone()).unwrap();
    (bus, service, config)
}
