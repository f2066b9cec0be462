//! [`RepeatingTask`] – the cooperative start/tick/stop thread primitive.
//!
//! Every long-lived subsystem (listener, session, PWM signal generators,
//! the motor watchdog, routine producers) is a [`Phases`] implementation run
//! by a [`RepeatingTask`] on its own OS thread:
//!
//! ```text
//! start() ──► on_start() ──► ┌─ wait(interval) for stop ─┐
//!                            │   not stopped → on_tick() │
//!                            └───────────◄───────────────┘
//!                                stopped → on_stop() ──► thread exits
//! ```
//!
//! [`RepeatingTask::close`] only raises the stop signal; it never blocks.
//! [`RepeatingTask::join`] waits for the thread and hands the phases back so
//! the task can be started again.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use teleop_types::TeleopError;
use tracing::{debug, warn};

const TASK_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::task");

// ────────────────────────────────────────────────────────────────────────────
// StopSignal
// ────────────────────────────────────────────────────────────────────────────

/// Shared, cloneable stop flag that can be waited on with a timeout.
///
/// All clones observe the same flag.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    /// Create a signal in the *running* (not stopped) state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every waiter.  Idempotent.
    pub fn stop(&self) {
        let (lock, cvar) = &*self.inner;
        *lock_recover(lock) = true;
        cvar.notify_all();
    }

    /// Whether the signal has been raised.
    pub fn is_stopped(&self) -> bool {
        *lock_recover(&self.inner.0)
    }

    /// Block for at most `timeout` or until the signal is raised.
    ///
    /// Returns `true` when the signal is raised.  A zero timeout only samples
    /// the flag.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut stopped = lock_recover(lock);
        if timeout.is_zero() {
            return *stopped;
        }
        let deadline = Instant::now() + timeout;
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            stopped = match cvar.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *stopped
    }

    fn reset(&self) {
        *lock_recover(&self.inner.0) = false;
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Everything guarded in this workspace is plain data that stays consistent
/// across a panic, so poisoning carries no information worth propagating.
pub fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ────────────────────────────────────────────────────────────────────────────
// Phases
// ────────────────────────────────────────────────────────────────────────────

/// The three lifecycle callbacks of a repeating task.
///
/// Each callback receives the task's [`StopSignal`] so that a phase can end
/// its own task (e.g. a session whose peer disconnected) or use it for
/// interruptible pacing.
pub trait Phases: Send + 'static {
    /// Runs once on the task thread before the first tick.
    fn on_start(&mut self, _stop: &StopSignal) {}

    /// Runs once per interval until the stop signal is raised.
    fn on_tick(&mut self, stop: &StopSignal);

    /// Runs once on the task thread after the stop signal is observed.
    fn on_stop(&mut self) {}
}

/// Adapter running an external callback as the tick phase.
struct Callback<F>(F);

impl<F> Phases for Callback<F>
where
    F: FnMut() + Send + 'static,
{
    fn on_tick(&mut self, _stop: &StopSignal) {
        (self.0)();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RepeatingTask
// ────────────────────────────────────────────────────────────────────────────

enum TaskState {
    Idle(Box<dyn Phases>),
    Running(JoinHandle<Box<dyn Phases>>),
    /// The phases panicked and could not be recovered.
    Lost,
}

/// Runs a [`Phases`] implementation on a dedicated, named thread.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::time::Duration;
/// use teleop_kernel::task::RepeatingTask;
///
/// let ticks = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&ticks);
/// let task = RepeatingTask::from_fn("counter", Duration::from_millis(1), move || {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
///
/// task.start().unwrap();
/// while ticks.load(Ordering::SeqCst) < 3 {
///     std::thread::sleep(Duration::from_millis(1));
/// }
/// task.close();
/// task.join().unwrap();
/// assert!(!task.is_running());
/// ```
pub struct RepeatingTask {
    name: String,
    interval: Duration,
    stop: StopSignal,
    state: Mutex<TaskState>,
}

impl RepeatingTask {
    /// Wrap `phases` in a task ticking every `interval`.
    ///
    /// An interval of zero ticks back-to-back; the phases are then
    /// responsible for their own pacing.
    pub fn new(name: impl Into<String>, interval: Duration, phases: impl Phases) -> Self {
        Self {
            name: name.into(),
            interval,
            stop: StopSignal::new(),
            state: Mutex::new(TaskState::Idle(Box::new(phases))),
        }
    }

    /// Like [`RepeatingTask::new`], but driven by an existing stop signal so
    /// that other parties holding a clone can end the task.
    pub fn with_stop_signal(
        name: impl Into<String>,
        interval: Duration,
        stop: StopSignal,
        phases: impl Phases,
    ) -> Self {
        Self {
            name: name.into(),
            interval,
            stop,
            state: Mutex::new(TaskState::Idle(Box::new(phases))),
        }
    }

    /// Build a task whose tick phase calls `callback`.
    pub fn from_fn<F>(name: impl Into<String>, interval: Duration, callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::new(name, interval, Callback(callback))
    }

    /// Task name; also used as the thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tick interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// A clone of this task's stop signal.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Spawn the task thread.
    ///
    /// Calling `start` on a task that is already running is a no-op.  A task
    /// that has been closed and joined can be started again.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::TaskFault`] if the OS refuses to spawn the
    /// thread or the phases were lost to an earlier panic.
    pub fn start(&self) -> Result<(), TeleopError> {
        let mut state = lock_recover(&self.state);
        let phases = match std::mem::replace(&mut *state, TaskState::Lost) {
            TaskState::Idle(phases) => phases,
            running @ TaskState::Running(_) => {
                *state = running;
                debug!(target: TASK_TARGET, task = %self.name, "start ignored: already running");
                return Ok(());
            }
            TaskState::Lost => {
                return Err(TeleopError::TaskFault {
                    name: self.name.clone(),
                    details: "phases lost after a panic".to_string(),
                });
            }
        };

        self.stop.reset();
        let stop = self.stop.clone();
        let interval = self.interval;
        let name = self.name.clone();
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_phases(phases, &stop, interval, &name));

        match spawned {
            Ok(handle) => {
                *state = TaskState::Running(handle);
                Ok(())
            }
            Err(e) => Err(TeleopError::TaskFault {
                name: self.name.clone(),
                details: format!("thread spawn failed: {e}"),
            }),
        }
    }

    /// Raise the stop signal.  Non-blocking and idempotent.
    pub fn close(&self) {
        self.stop.stop();
    }

    /// Block until the task thread has exited.
    ///
    /// Joining a task that was never started, or was already joined, returns
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::TaskFault`] if the task thread panicked.
    pub fn join(&self) -> Result<(), TeleopError> {
        let mut state = lock_recover(&self.state);
        match std::mem::replace(&mut *state, TaskState::Lost) {
            TaskState::Running(handle) => match handle.join() {
                Ok(phases) => {
                    *state = TaskState::Idle(phases);
                    Ok(())
                }
                Err(_) => Err(TeleopError::TaskFault {
                    name: self.name.clone(),
                    details: "task thread panicked".to_string(),
                }),
            },
            other => {
                *state = other;
                Ok(())
            }
        }
    }

    /// Signal stop and wait for the thread in one call.
    ///
    /// # Errors
    ///
    /// See [`RepeatingTask::join`].
    pub fn shutdown(&self) -> Result<(), TeleopError> {
        self.close();
        self.join()
    }

    /// Whether the stop signal is still down.
    pub fn is_running(&self) -> bool {
        !self.stop.is_stopped()
    }

    /// Whether a task thread exists and has not finished yet.
    pub fn is_alive(&self) -> bool {
        match &*lock_recover(&self.state) {
            TaskState::Running(handle) => !handle.is_finished(),
            _ => false,
        }
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

impl std::fmt::Debug for RepeatingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatingTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

fn run_phases(
    mut phases: Box<dyn Phases>,
    stop: &StopSignal,
    interval: Duration,
    name: &str,
) -> Box<dyn Phases> {
    debug!(target: TASK_TARGET, task = %name, ?interval, "task started");
    phases.on_start(stop);
    while !stop.wait(interval) {
        phases.on_tick(stop);
    }
    phases.on_stop();
    debug!(target: TASK_TARGET, task = %name, "task stopped");
    phases
}

/// Close every task, then join them all, logging join failures.
///
/// Closing first lets the threads wind down in parallel.
pub fn shutdown_all<'a>(tasks: impl IntoIterator<Item = &'a RepeatingTask> + Clone) {
    for task in tasks.clone() {
        task.close();
    }
    for task in tasks {
        if let Err(e) = task.join() {
            warn!(target: TASK_TARGET, task = %task.name(), error = %e, "task join failed");
        }
    }
}
