//! Async adapters driven from a tokio runtime.

#![cfg(feature = "tokio-runtime")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use resource_coordination::core::{AppResult, CoordinationError};
use resource_coordination::infra::transport::{InMemoryBus, Scope, Transport};
use resource_coordination::runtime::call_async;
use resource_coordination::task::{
    ExecutorFactoryTaskHandler, FnTask, LocalTask, LocalTaskFactory, RemoteTask, TaskServer, TaskState,
};
use serde_json::{json, Value};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_async_returns_result() {
    let bus: Arc<dyn Transport<TaskState>> = Arc::new(InMemoryBus::new());
    let factory: Arc<dyn LocalTaskFactory> = Arc::new(|payload: &Value| -> AppResult<Option<Arc<dyn LocalTask>>> {
        let n = payload.get("n").and_then(Value::as_i64).unwrap_or_default();
        Ok(Some(FnTask::new(move |_| Ok(json!({ "double": n * 2 }))).shared()))
    });
    let handler = Arc::new(ExecutorFactoryTaskHandler::new(Arc::clone(&bus), factory));
    let server = Arc::new(TaskServer::new(Arc::clone(&bus), Scope::new("/async/").unwrap(), handler));
    server.activate().unwrap();
    let serving = Arc::clone(&server);
    thread::spawn(move || serving.listen());

    let task = RemoteTask::new(Arc::clone(&bus), Scope::new("/async/job").unwrap(), json!({ "n": 21 }));
    let result = call_async(task).await.unwrap();
    assert_eq!(result, json!({ "double": 42 }));
    server.deactivate();
}

#[tokio::test]
async fn test_call_async_surfaces_timeout() {
    let bus: Arc<dyn Transport<TaskState>> = Arc::new(InMemoryBus::new());
    let task = RemoteTask::new(bus, Scope::new("/async/nobody").unwrap(), json!("x"))
        .with_accept_timeout(Duration::from_millis(50));
    let outcome = call_async(task).await;
    assert!(matches!(outcome, Err(CoordinationError::Timeout(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_call_aborts_remote_task() {
    let bus: Arc<dyn Transport<TaskState>> = Arc::new(InMemoryBus::new());
    let hooked = Arc::new(AtomicBool::new(false));
    let hook_flag = Arc::clone(&hooked);
    let factory: Arc<dyn LocalTaskFactory> = Arc::new(move |_: &Value| -> AppResult<Option<Arc<dyn LocalTask>>> {
        let flag = Arc::clone(&hook_flag);
        let task = FnTask::new(|interrupt| {
            interrupt.sleep(Duration::from_secs(30))?;
            Ok(Value::Null)
        })
        .on_abort(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        Ok(Some(task.shared()))
    });
    let handler = Arc::new(ExecutorFactoryTaskHandler::new(Arc::clone(&bus), factory));
    let server = Arc::new(TaskServer::new(Arc::clone(&bus), Scope::new("/async/").unwrap(), handler));
    server.activate().unwrap();
    let serving = Arc::clone(&server);
    thread::spawn(move || serving.listen());

    let task = RemoteTask::new(Arc::clone(&bus), Scope::new("/async/hang").unwrap(), json!("x"));
    let outcome = tokio::time::timeout(Duration::from_millis(300), call_async(task)).await;
    assert!(outcome.is_err());

    for _ in 0..200 {
        if hooked.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(hooked.load(Ordering::SeqCst));
    server.deactivate();
}
