//! Runs one script body on a dedicated worker thread.
//!
//! The driving thread blocks in [`ScriptTaskExecutor::wait`], optionally with a
//! timeout. Exactly one terminal outcome is delivered per task: the worker, a
//! timeout and a cancel race on a single state transition out of `RUNNING`,
//! and only the winner reports. A worker that loses (it finished after a
//! timeout, say) has its result dropped.
//!
//! The configuration overlay is held as an [`OverlayLease`] in a slot shared
//! with the worker. Whoever ends the task restores the overlay, so it is back
//! in place before `wait` returns on every path. The lease itself is dropped
//! only by the worker once the body has returned: an abandoned body keeps the
//! gate busy, and no other executor's body starts alongside it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::core::error::JobError;
use crate::core::task::{CancelFlag, ProgressSlot, TaskOutcome};
use crate::io::engine::{ScriptBinding, ScriptEngine, ScriptRequest};
use crate::io::overlay::{OverlayGate, OverlayLease};

const RUNNING: u8 = 0;
const FINISHED: u8 = 1;
const CANCELLED: u8 = 2;
const TIMED_OUT: u8 = 3;

enum Signal {
    Finished(Result<Option<Value>, JobError>),
    Cancelled,
}

/// Where the worker's overlay lease currently is.
enum LeaseSlot {
    /// The worker has not acquired the overlay yet.
    Pending,
    Held(OverlayLease),
    /// Released, or never acquired.
    Done,
}

struct TaskShared {
    state: AtomicU8,
    cancel: CancelFlag,
    lease: Mutex<LeaseSlot>,
    settled: Condvar,
}

impl TaskShared {
    fn new(cancel: CancelFlag) -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
            cancel,
            lease: Mutex::new(LeaseSlot::Pending),
            settled: Condvar::new(),
        }
    }

    /// Move out of `RUNNING`; true for the single caller that wins.
    fn finish_as(&self, state: u8) -> bool {
        self.state
            .compare_exchange(RUNNING, state, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Park a freshly acquired lease, unless the task already ended.
    fn hold(&self, lease: OverlayLease) {
        let Ok(mut slot) = self.lease.lock() else {
            return;
        };
        if self.is_running() {
            *slot = LeaseSlot::Held(lease);
        } else {
            drop(lease);
            *slot = LeaseSlot::Done;
        }
        self.settled.notify_all();
    }

    /// Restore the overlay for a task that ended before its body returned,
    /// waiting out a worker that is still acquiring it.
    ///
    /// The lease stays in the slot, so the gate remains busy until the worker
    /// releases it. Callers must have left `RUNNING`, so a pending worker sees
    /// the new state and gives the lease back.
    fn restore_early(&self) {
        let Ok(mut slot) = self.lease.lock() else {
            return;
        };
        while matches!(*slot, LeaseSlot::Pending) && !self.is_running() {
            slot = match self.settled.wait(slot) {
                Ok(slot) => slot,
                Err(_) => return,
            };
        }
        if let LeaseSlot::Held(lease) = &mut *slot {
            lease.restore();
        }
    }

    /// Drop the lease, restoring the overlay if needed and freeing the gate.
    fn release(&self) {
        let previous = match self.lease.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, LeaseSlot::Done),
            Err(_) => return,
        };
        drop(previous);
        self.settled.notify_all();
    }

    fn abandon(&self) {
        if let Ok(mut slot) = self.lease.lock() {
            *slot = LeaseSlot::Done;
        }
        self.settled.notify_all();
    }
}

/// Ownership of one submitted task's result channel.
pub struct TaskHandle {
    shared: Arc<TaskShared>,
    receiver: Receiver<Signal>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("state", &self.shared.state.load(Ordering::Acquire))
            .finish()
    }
}

struct TaskControl {
    shared: Arc<TaskShared>,
    sender: Sender<Signal>,
    progress: ProgressSlot,
}

/// Executes a single script task with timeout, cancellation and progress.
pub struct ScriptTaskExecutor {
    overlay: Arc<OverlayGate>,
    poll: Duration,
    task: OnceLock<TaskControl>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ScriptTaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptTaskExecutor")
            .field("submitted", &self.task.get().is_some())
            .field("progress", &self.progress())
            .finish()
    }
}

impl ScriptTaskExecutor {
    /// `poll` bounds how long a worker waiting on the overlay gate takes to
    /// notice cancellation.
    pub fn new(overlay: Arc<OverlayGate>, poll: Duration) -> Self {
        Self {
            overlay,
            poll,
            task: OnceLock::new(),
            worker: Mutex::new(None),
        }
    }

    /// Start `request` on a new worker thread.
    ///
    /// The binding's flattened configuration is installed as the overlay for
    /// the duration of the body. One executor runs at most one task.
    #[instrument(skip_all, fields(step = %binding.step, script = %request.script))]
    pub fn submit(
        &self,
        engine: Arc<dyn ScriptEngine>,
        request: ScriptRequest,
        binding: ScriptBinding,
    ) -> Result<TaskHandle, JobError> {
        if self.task.get().is_some() {
            return Err(JobError::illegal_state("a task was already submitted"));
        }

        let shared = Arc::new(TaskShared::new(binding.cancel.clone()));
        let (sender, receiver) = mpsc::channel();
        let progress = binding.progress.clone();
        let worker = Worker {
            shared: shared.clone(),
            sender: sender.clone(),
            overlay: self.overlay.clone(),
            poll: self.poll,
            engine,
            request,
            binding,
        };

        let name = format!("script-{}", worker.binding.step.step_id);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker.run())
            .map_err(|err| {
                error!(err = %err, "failed to spawn script worker");
                JobError::setup(format!("could not start script worker: {err}"))
            })?;

        let control = TaskControl {
            shared: shared.clone(),
            sender,
            progress,
        };
        if self.task.set(control).is_err() {
            shared.cancel.cancel();
            return Err(JobError::illegal_state("a task was already submitted"));
        }
        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(handle);
        }
        debug!("script worker started");
        Ok(TaskHandle { shared, receiver })
    }

    /// Block until the task ends or `timeout` elapses.
    ///
    /// On timeout the worker is flagged for cancellation and abandoned; the
    /// overlay is restored before this returns, while the gate stays held
    /// until the abandoned body exits.
    pub fn wait(&self, handle: TaskHandle, timeout: Option<Duration>) -> TaskOutcome {
        let signal = match timeout {
            None => handle.receiver.recv().ok(),
            Some(limit) => match handle.receiver.recv_timeout(limit) {
                Ok(signal) => Some(signal),
                Err(RecvTimeoutError::Timeout) => {
                    if handle.shared.finish_as(TIMED_OUT) {
                        warn!(timeout_ms = limit.as_millis() as u64, "script timed out, abandoning worker");
                        handle.shared.cancel.cancel();
                        handle.shared.restore_early();
                        return TaskOutcome::TimedOut;
                    }
                    // Lost the race: the winner's signal is on its way.
                    handle.receiver.recv().ok()
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
        };

        match signal {
            Some(Signal::Finished(Ok(value))) => TaskOutcome::Completed(value),
            Some(Signal::Finished(Err(err))) => TaskOutcome::Failed(err),
            Some(Signal::Cancelled) => TaskOutcome::Cancelled,
            None => TaskOutcome::Failed(JobError::ScriptExecution(
                "script worker exited without a result".to_string(),
            )),
        }
    }

    /// Request cooperative cancellation.
    ///
    /// Returns `Ok(true)` if the task was still running and is now cancelled,
    /// `Ok(false)` if it had already ended.
    pub fn cancel(&self) -> Result<bool, JobError> {
        let control = self
            .task
            .get()
            .ok_or_else(|| JobError::illegal_state("cancel called before a task was submitted"))?;
        if !control.shared.finish_as(CANCELLED) {
            debug!("cancel ignored, task already ended");
            return Ok(false);
        }
        info!("cancelling script task");
        control.shared.cancel.cancel();
        control.shared.restore_early();
        let _ = control.sender.send(Signal::Cancelled);
        Ok(true)
    }

    /// Live progress in `[0.0, 1.0]`; 0.0 before submission.
    pub fn progress(&self) -> f64 {
        self.task
            .get()
            .map(|control| control.progress.get())
            .unwrap_or(0.0)
    }

    /// Tear the worker down.
    ///
    /// A still-running task is cancelled. The worker thread is joined if it
    /// has already exited and detached otherwise.
    pub fn shutdown(&self) {
        if let Some(control) = self.task.get() {
            let cancelled = control.shared.finish_as(CANCELLED);
            control.shared.cancel.cancel();
            if cancelled {
                debug!("shutdown cancelled a running task");
                control.shared.restore_early();
                let _ = control.sender.send(Signal::Cancelled);
            }
        }

        let handle = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("script worker panicked outside the script body");
                }
            } else {
                debug!("detaching script worker that is still running");
            }
        }
    }
}

struct Worker {
    shared: Arc<TaskShared>,
    sender: Sender<Signal>,
    overlay: Arc<OverlayGate>,
    poll: Duration,
    engine: Arc<dyn ScriptEngine>,
    request: ScriptRequest,
    binding: ScriptBinding,
}

impl Worker {
    fn run(self) {
        let lease = match self
            .overlay
            .acquire(&self.binding.config, &self.shared.cancel, self.poll)
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!("task ended while waiting for the overlay");
                self.shared.abandon();
                return;
            }
            Err(err) => {
                self.shared.abandon();
                self.report(Err(JobError::setup(format!("{err:#}"))));
                return;
            }
        };
        self.shared.hold(lease);
        if !self.shared.is_running() {
            self.shared.release();
            return;
        }

        debug!("running script body");
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.engine.run(&self.request, &self.binding)
        }));
        let result = match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(JobError::ScriptExecution(format!("{err:#}"))),
            Err(payload) => {
                error!("script body panicked");
                Err(JobError::ScriptExecution(panic_message(payload.as_ref())))
            }
        };

        self.shared.release();
        self.report(result);
    }

    fn report(&self, result: Result<Option<Value>, JobError>) {
        if !self.shared.finish_as(FINISHED) {
            debug!("discarding result of an abandoned task");
            return;
        }
        if result.is_ok() {
            self.binding.progress.set(1.0);
        }
        let _ = self.sender.send(Signal::Finished(result));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("script panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("script panicked: {msg}")
    } else {
        "script panicked".to_string()
    }
}
