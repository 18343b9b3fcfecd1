//! Tests for the single-thread worker and interrupt token

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use resource_coordination::core::{CoordinationError, Interrupt, SingleWorker};

#[test]
fn test_interrupt_from_another_thread() {
    let interrupt = Interrupt::new();
    let remote = interrupt.clone();
    let started = Instant::now();
    let waker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        remote.interrupt();
    });
    assert!(matches!(interrupt.sleep(Duration::from_secs(10)), Err(CoordinationError::Interrupted)));
    assert!(started.elapsed() < Duration::from_secs(5));
    waker.join().unwrap();
    assert!(interrupt.check().is_err());
}

#[test]
fn test_close_lets_queued_jobs_finish() {
    let worker = Arc::new(SingleWorker::new("closing-worker").unwrap());
    let first = worker.submit(|_| 1).unwrap();
    let second = worker.submit(|_| 2).unwrap();
    worker.close();
    assert!(worker.is_shutdown());
    assert_eq!(first.wait().unwrap(), 1);
    assert_eq!(second.wait().unwrap(), 2);
    assert!(worker.submit(|_| 3).is_err());
}

#[test]
fn test_result_can_be_taken_once() {
    let worker = SingleWorker::new("once-worker").unwrap();
    let handle = worker.submit(|_| "value").unwrap();
    let copy = handle.clone();
    assert_eq!(handle.wait().unwrap(), "value");
    assert!(matches!(copy.wait(), Err(CoordinationError::IllegalState(_))));
    assert!(worker.shutdown(Duration::from_secs(2)));
}
