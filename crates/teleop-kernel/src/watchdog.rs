//! Fail-safe watchdog.
//!
//! A [`RefreshTimer`] records when a controlled subsystem last received a
//! fresh command.  [`FailSafeWatchdog`] is a [`Phases`] implementation that
//! checks every registered [`FailSafe`] on each tick and calls
//! [`FailSafe::engage`] on those whose refresh deadline has expired.
//!
//! The watchdog runs on its own [`RepeatingTask`], independent of whatever
//! network session is feeding commands, so outputs reach their safe state
//! even if the session has not noticed a dead link yet.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::task::{Phases, RepeatingTask, StopSignal};

const WATCHDOG_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::watchdog");

// ────────────────────────────────────────────────────────────────────────────
// RefreshTimer
// ────────────────────────────────────────────────────────────────────────────

/// Last-refresh timestamp plus the window after which it is considered stale.
#[derive(Debug, Clone, Copy)]
pub struct RefreshTimer {
    last_refresh: Instant,
    timeout: Duration,
}

impl RefreshTimer {
    /// A timer that was refreshed just now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_refresh: Instant::now(),
            timeout,
        }
    }

    /// Reset the deadline.
    pub fn refresh(&mut self) {
        self.last_refresh = Instant::now();
    }

    /// Refresh window.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time since the last refresh, as seen at `now`.
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_refresh)
    }

    /// Whether `now − last_refresh ≥ timeout`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.elapsed_at(now) >= self.timeout
    }

    /// [`RefreshTimer::is_expired_at`] evaluated at the current instant.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FailSafe
// ────────────────────────────────────────────────────────────────────────────

/// A subsystem that can be forced into a safe state.
///
/// `engage` must be infallible: it only ever writes a bounded, always-valid
/// state.
pub trait FailSafe: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Whether the subsystem's commands have gone stale.
    fn is_stale(&self) -> bool;

    /// Whether the subsystem is already in its safe state.
    fn is_safe(&self) -> bool;

    /// Drive the subsystem to its safe state.
    fn engage(&self);
}

/// Checks a set of [`FailSafe`] targets once per tick.
pub struct FailSafeWatchdog {
    targets: Vec<Arc<dyn FailSafe>>,
}

impl FailSafeWatchdog {
    /// Watch `targets`.
    pub fn new(targets: Vec<Arc<dyn FailSafe>>) -> Self {
        Self { targets }
    }

    /// Run one check over every target; returns how many were engaged.
    pub fn check(&self) -> usize {
        let mut engaged = 0;
        for target in &self.targets {
            if target.is_stale() {
                if !target.is_safe() {
                    warn!(
                        target: WATCHDOG_TARGET,
                        component = %target.name(),
                        "command refresh deadline missed, forcing safe state"
                    );
                }
                target.engage();
                engaged += 1;
            }
        }
        engaged
    }

    /// Wrap this watchdog in a [`RepeatingTask`] ticking every `tick`.
    pub fn into_task(self, name: impl Into<String>, tick: Duration) -> RepeatingTask {
        RepeatingTask::new(name, tick, self)
    }
}

impl Phases for FailSafeWatchdog {
    fn on_tick(&mut self, _stop: &StopSignal) {
        self.check();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct MockOutput {
        timer: Mutex<RefreshTimer>,
        level: Mutex<f64>,
        engaged: AtomicUsize,
    }

    impl MockOutput {
        fn new(timeout: Duration) -> Arc<Self> {
            Arc::new(Self {
                timer: Mutex::new(RefreshTimer::new(timeout)),
                level: Mutex::new(0.0),
                engaged: AtomicUsize::new(0),
            })
        }

        fn command(&self, level: f64) {
            *self.level.lock().unwrap() = level;
            self.timer.lock().unwrap().refresh();
        }
    }

    impl FailSafe for MockOutput {
        fn name(&self) -> &str {
            "mock"
        }
        fn is_stale(&self) -> bool {
            self.timer.lock().unwrap().is_expired()
        }
        fn is_safe(&self) -> bool {
            *self.level.lock().unwrap() == 0.0
        }
        fn engage(&self) {
            *self.level.lock().unwrap() = 0.0;
            self.engaged.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn refresh_timer_expires_after_timeout() {
        let timer = RefreshTimer::new(Duration::from_millis(100));
        let now = Instant::now();
        assert!(!timer.is_expired_at(now));
        assert!(timer.is_expired_at(now + Duration::from_millis(100)));
        assert!(timer.is_expired_at(now + Duration::from_secs(1)));
    }

    #[test]
    fn refresh_resets_deadline() {
        let mut timer = RefreshTimer::new(Duration::from_millis(20));
        thread::sleep(Duration::from_millis(30));
        assert!(timer.is_expired());
        timer.refresh();
        assert!(!timer.is_expired());
    }

    #[test]
    fn check_engages_only_stale_targets() {
        let fresh = MockOutput::new(Duration::from_secs(60));
        let stale = MockOutput::new(Duration::from_millis(10));
        fresh.command(0.5);
        stale.command(0.5);
        thread::sleep(Duration::from_millis(20));

        let watchdog = FailSafeWatchdog::new(vec![
            fresh.clone() as Arc<dyn FailSafe>,
            stale.clone() as Arc<dyn FailSafe>,
        ]);
        assert_eq!(watchdog.check(), 1);
        assert!(!fresh.is_safe());
        assert!(stale.is_safe());
    }

    #[test]
    fn watchdog_task_forces_safe_state_within_a_tick() {
        let output = MockOutput::new(Duration::from_millis(30));
        output.command(1.0);
        let task = FailSafeWatchdog::new(vec![output.clone() as Arc<dyn FailSafe>])
            .into_task("watchdog", Duration::from_millis(10));
        task.start().unwrap();

        thread::sleep(Duration::from_millis(80));
        assert!(output.is_safe());
        assert!(output.engaged.load(Ordering::SeqCst) >= 1);

        task.shutdown().unwrap();
    }

    #[test]
    fn commands_keep_the_output_alive() {
        let output = MockOutput::new(Duration::from_millis(60));
        let task = FailSafeWatchdog::new(vec![output.clone() as Arc<dyn FailSafe>])
            .into_task("watchdog", Duration::from_millis(5));
        output.command(1.0);
        task.start().unwrap();
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(15));
            output.command(1.0);
        }
        assert!(!output.is_safe());
        task.shutdown().unwrap();
    }
}
