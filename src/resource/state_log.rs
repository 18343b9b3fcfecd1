//! Ordered log of observed allocation states with blocking waits.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::allocation::AllocationState;
use crate::core::{CoordinationError, Interrupt};

/// How often an interruptible wait re-checks its token.
const INTERRUPT_SLICE: Duration = Duration::from_millis(50);

/// Append-only record of states, in the order they were observed.
#[derive(Debug, Default)]
pub struct StateLog {
    states: Mutex<Vec<AllocationState>>,
    cvar: Condvar,
}

impl StateLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `state` and wake all waiters.
    pub fn push(&self, state: AllocationState) {
        self.states.lock().push(state);
        self.cvar.notify_all();
    }

    /// Most recent state, if any.
    #[must_use]
    pub fn last(&self) -> Option<AllocationState> {
        self.states.lock().last().copied()
    }

    /// True if nothing has been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.lock().is_empty()
    }

    /// Copy of the whole log.
    #[must_use]
    pub fn history(&self) -> Vec<AllocationState> {
        self.states.lock().clone()
    }

    /// True if any of `states` has ever been logged.
    #[must_use]
    pub fn contains_any(&self, states: &[AllocationState]) -> bool {
        let log = self.states.lock();
        states.iter().any(|s| log.contains(s))
    }

    /// Block until any of `states` has been logged.
    pub fn await_any(&self, states: &[AllocationState]) {
        let mut log = self.states.lock();
        while !states.iter().any(|s| log.contains(s)) {
            self.cvar.wait(&mut log);
        }
    }

    /// Block until any of `states` has been logged or `interrupt` fires.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Interrupted`] once the token fires.
    pub fn await_any_interruptibly(
        &self,
        states: &[AllocationState],
        interrupt: &Interrupt,
    ) -> Result<(), CoordinationError> {
        let mut log = self.states.lock();
        while !states.iter().any(|s| log.contains(s)) {
            interrupt.check()?;
            self.cvar.wait_for(&mut log, INTERRUPT_SLICE);
        }
        Ok(())
    }

    /// Block up to `timeout` until any of `states` has been logged.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Timeout`] if none shows up in time.
    pub fn await_any_timeout(
        &self,
        states: &[AllocationState],
        timeout: Duration,
    ) -> Result<(), CoordinationError> {
        let deadline = Instant::now() + timeout;
        let mut log = self.states.lock();
        while !states.iter().any(|s| log.contains(s)) {
            if self.cvar.wait_until(&mut log, deadline).timed_out() {
                if states.iter().any(|s| log.contains(s)) {
                    return Ok(());
                }
                return Err(CoordinationError::Timeout(format!(
                    "waiting for {states:?} timed out after {}ms",
                    timeout.as_millis()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_await_sees_earlier_states() {
        let log = StateLog::new();
        log.push(AllocationState::Scheduled);
        log.push(AllocationState::Allocated);
        log.await_any(&[AllocationState::Scheduled]);
        assert_eq!(log.last(), Some(AllocationState::Allocated));
    }

    #[test]
    fn test_await_wakes_on_push() {
        let log = Arc::new(StateLog::new());
        let writer = Arc::clone(&log);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.push(AllocationState::Released);
        });
        log.await_any_timeout(&[AllocationState::Released], Duration::from_secs(2))
            .unwrap();
        t.join().unwrap();
    }

    #[test]
    fn test_interrupted_wait_returns_error() {
        let log = StateLog::new();
        let interrupt = Interrupt::new();
        let remote = interrupt.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.interrupt();
        });
        let outcome = log.await_any_interruptibly(&[AllocationState::Allocated], &interrupt);
        assert!(matches!(outcome, Err(CoordinationError::Interrupted)));
        t.join().unwrap();

        log.push(AllocationState::Allocated);
        assert!(log
            .await_any_interruptibly(&[AllocationState::Allocated], &Interrupt::new())
            .is_ok());
    }

    #[test]
    fn test_await_timeout() {
        let log = StateLog::new();
        let err = log
            .await_any_timeout(&[AllocationState::Allocated], Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Timeout(_)));
    }
}
