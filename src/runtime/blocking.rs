//! Async adapters over the blocking waits.
//!
//! Proxies wait on `parking_lot` condition variables. These helpers move
//! such waits onto tokio's blocking pool so async callers never park a
//! runtime worker.

use std::time::Duration;

use serde_json::Value;

use crate::allocation::{AllocationState, RemoteAllocation};
use crate::core::{CoordinationError, Interrupt};
use crate::task::RemoteTask;

fn join_error(e: &tokio::task::JoinError) -> CoordinationError {
    CoordinationError::Execution(format!("blocking wait did not complete: {e}"))
}

/// Wait up to `timeout` for `remote` to reach `target` or end. Returns the
/// state observed last.
///
/// # Errors
///
/// [`CoordinationError::Execution`] if the blocking task panicked or was
/// cancelled.
pub async fn await_state_async(
    remote: RemoteAllocation,
    timeout: Duration,
    target: AllocationState,
) -> Result<AllocationState, CoordinationError> {
    tokio::task::spawn_blocking(move || {
        remote.await_until(timeout, |state| state == target || state.is_terminal())
    })
    .await
    .map_err(|e| join_error(&e))
}

/// Fires its token when dropped.
struct InterruptOnDrop(Interrupt);

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        self.0.interrupt();
    }
}

/// Run [`RemoteTask::call`] on the blocking pool. Dropping the returned
/// future interrupts the call, which then asks the handler to abort.
///
/// # Errors
///
/// Whatever the call returns, or [`CoordinationError::Execution`] if the
/// blocking task panicked or was cancelled.
pub async fn call_async(task: RemoteTask) -> Result<Value, CoordinationError> {
    let interrupt = Interrupt::new();
    let _cancel_on_drop = InterruptOnDrop(interrupt.clone());
    tokio::task::spawn_blocking(move || task.call_with(&interrupt))
        .await
        .map_err(|e| join_error(&e))?
}
