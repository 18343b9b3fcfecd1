//! Dedicated single-thread executor with condvar-backed job handles.
//!
//! Lifecycle wrappers and execution monitors each own one [`SingleWorker`]
//! so that user work never runs on a dispatcher or watchdog thread.
//!
//! # Design
//!
//! - **No polling**: the worker blocks on channel `recv`; handles wait on a `Condvar`
//! - **Graceful shutdown**: dropping the sender lets the worker drain and exit
//! - **Forced shutdown**: fires the running job's [`Interrupt`] and skips queued jobs
//! - **Per-job tokens**: interrupting one job never leaks into the next

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::{CoordinationError, Interrupt};

/// Job state inside a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    /// Queued, not yet picked up.
    Pending,
    /// Currently executing on the worker.
    Running,
    /// Result stored.
    Ready,
    /// Cancelled before a result was stored.
    Cancelled,
}

struct JobEntry<R> {
    result: Option<R>,
    state: JobState,
}

type JobSlot<R> = Arc<(Mutex<JobEntry<R>>, Condvar)>;

/// Unit of work queued on the worker; the flag tells it the worker was halted.
type JobFn = Box<dyn FnOnce(&Interrupt, bool) + Send + 'static>;

struct Job {
    interrupt: Interrupt,
    run: JobFn,
}

/// Handle to the outcome of a job submitted to a [`SingleWorker`].
pub struct JobHandle<R> {
    slot: JobSlot<R>,
    interrupt: Interrupt,
}

impl<R> Clone for JobHandle<R> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            interrupt: self.interrupt.clone(),
        }
    }
}

impl<R> JobHandle<R> {
    /// True once the job stored a result or was cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.slot.0.lock().state, JobState::Ready | JobState::Cancelled)
    }

    /// True if the job was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.slot.0.lock().state == JobState::Cancelled
    }

    /// Cancel the job. A queued job will never run. A running job keeps
    /// running unless `interrupt` is set, in which case this job's
    /// interrupt token is fired; its result is discarded either way.
    ///
    /// Returns false if the job had already finished.
    pub fn cancel(&self, interrupt: bool) -> bool {
        let (lock, cvar) = self.slot.as_ref();
        let mut entry = lock.lock();
        let was_running = match entry.state {
            JobState::Ready | JobState::Cancelled => return false,
            JobState::Running => true,
            JobState::Pending => false,
        };
        entry.state = JobState::Cancelled;
        cvar.notify_all();
        drop(entry);
        if interrupt && was_running {
            self.interrupt.interrupt();
        }
        true
    }

    /// Block until the job finishes and take its result.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Cancelled`] if the job was cancelled.
    pub fn wait(&self) -> Result<R, CoordinationError> {
        let (lock, cvar) = self.slot.as_ref();
        let mut entry = lock.lock();
        while matches!(entry.state, JobState::Pending | JobState::Running) {
            cvar.wait(&mut entry);
        }
        Self::take(&mut entry)
    }

    /// Block up to `timeout` for the job to finish and take its result.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Timeout`] if still running at the deadline,
    /// [`CoordinationError::Cancelled`] if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<R, CoordinationError> {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = self.slot.as_ref();
        let mut entry = lock.lock();
        while matches!(entry.state, JobState::Pending | JobState::Running) {
            if cvar.wait_until(&mut entry, deadline).timed_out() {
                break;
            }
        }
        if matches!(entry.state, JobState::Pending | JobState::Running) {
            return Err(CoordinationError::Timeout(format!(
                "job still running after {}ms",
                timeout.as_millis()
            )));
        }
        Self::take(&mut entry)
    }

    fn take(entry: &mut JobEntry<R>) -> Result<R, CoordinationError> {
        match entry.state {
            JobState::Ready => entry
                .result
                .take()
                .ok_or_else(|| CoordinationError::IllegalState("job result already taken".into())),
            _ => Err(CoordinationError::Cancelled),
        }
    }
}

/// Executor backed by exactly one named OS thread.
pub struct SingleWorker {
    name: String,
    task_tx: Mutex<Option<Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    /// Token of the job currently executing, if any.
    current: Arc<Mutex<Option<Interrupt>>>,
    halted: Arc<AtomicBool>,
}

impl SingleWorker {
    /// Spawn the worker thread.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Spawn`] if the OS refuses the thread.
    pub fn new(name: impl Into<String>) -> Result<Self, CoordinationError> {
        let name = name.into();
        let (task_tx, task_rx) = unbounded::<Job>();
        let current = Arc::new(Mutex::new(None));
        let halted = Arc::new(AtomicBool::new(false));

        let worker_current = Arc::clone(&current);
        let worker_halted = Arc::clone(&halted);
        let worker_name = name.clone();
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            debug!(worker = %worker_name, "worker thread started");
            // Exits once the sender is dropped and the queue is drained.
            while let Ok(job) = task_rx.recv() {
                *worker_current.lock() = Some(job.interrupt.clone());
                (job.run)(&job.interrupt, worker_halted.load(Ordering::Acquire));
                worker_current.lock().take();
            }
            debug!(worker = %worker_name, "worker thread exiting");
        })?;

        Ok(Self {
            name,
            task_tx: Mutex::new(Some(task_tx)),
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
            current,
            halted,
        })
    }

    /// Worker thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when called from the worker thread itself.
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// True after `shutdown` or `shutdown_now`.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.task_tx.lock().is_none()
    }

    /// Queue `work` for execution.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::IllegalState`] if the worker has been shut down.
    pub fn submit<R, F>(&self, work: F) -> Result<JobHandle<R>, CoordinationError>
    where
        R: Send + 'static,
        F: FnOnce(&Interrupt) -> R + Send + 'static,
    {
        let slot: JobSlot<R> = Arc::new((
            Mutex::new(JobEntry {
                result: None,
                state: JobState::Pending,
            }),
            Condvar::new(),
        ));
        let job_slot = Arc::clone(&slot);
        let interrupt = Interrupt::new();
        let run: JobFn = Box::new(move |interrupt, halted| {
            let (lock, cvar) = job_slot.as_ref();
            {
                let mut entry = lock.lock();
                if entry.state == JobState::Cancelled {
                    return;
                }
                if halted {
                    entry.state = JobState::Cancelled;
                    cvar.notify_all();
                    return;
                }
                entry.state = JobState::Running;
            }
            let result = work(interrupt);
            let mut entry = lock.lock();
            if entry.state == JobState::Running {
                entry.result = Some(result);
                entry.state = JobState::Ready;
            }
            cvar.notify_all();
        });

        let guard = self.task_tx.lock();
        let Some(task_tx) = guard.as_ref() else {
            return Err(CoordinationError::IllegalState(format!(
                "worker {} has been shut down",
                self.name
            )));
        };
        task_tx
            .send(Job {
                interrupt: interrupt.clone(),
                run,
            })
            .map_err(|_| {
                CoordinationError::IllegalState(format!("worker {} has exited", self.name))
            })?;
        Ok(JobHandle { slot, interrupt })
    }

    /// Stop accepting work, let queued jobs finish and wait up to `timeout`
    /// for the thread to exit. Returns true if it exited in time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.task_tx.lock().take();
        self.join(timeout)
    }

    /// Stop accepting work without waiting; queued jobs still run.
    pub fn close(&self) {
        if self.task_tx.lock().take().is_some() {
            debug!(worker = %self.name, "worker closed");
        }
    }

    /// Stop accepting work, skip queued jobs and fire the interrupt token
    /// for the running one. Does not wait for the thread.
    pub fn shutdown_now(&self) {
        self.halted.store(true, Ordering::Release);
        self.task_tx.lock().take();
        if let Some(running) = self.current.lock().as_ref() {
            running.interrupt();
        }
        debug!(worker = %self.name, "worker forced down");
    }

    fn join(&self, timeout: Duration) -> bool {
        if self.is_current() {
            // Joining ourselves would never return; the loop exits on its own.
            return false;
        }
        let Some(handle) = self.thread.lock().take() else {
            return true;
        };
        let (done_tx, done_rx) = bounded::<bool>(1);
        let joiner = thread::Builder::new()
            .name(format!("{}-join", self.name))
            .spawn(move || {
                let _ = done_tx.send(handle.join().is_ok());
            });
        if joiner.is_err() {
            warn!(worker = %self.name, "could not spawn join helper, detaching worker");
            return false;
        }
        match done_rx.recv_timeout(timeout) {
            Ok(true) => true,
            Ok(false) => {
                warn!(worker = %self.name, "worker panicked");
                true
            }
            Err(_) => {
                warn!(
                    worker = %self.name,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "worker did not exit within timeout - detaching"
                );
                false
            }
        }
    }
}

impl Drop for SingleWorker {
    fn drop(&mut self) {
        // Never join in Drop; an explicit shutdown is required for that.
        self.task_tx.get_mut().take();
    }
}
