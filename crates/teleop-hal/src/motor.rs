//! Differential-drive motor controller.
//!
//! Three PWM outputs (left speed, right speed, steering angle) share one
//! [`OutputBank`], so a [`MotorController::set`] call replaces all three
//! duty cycles atomically.  Each output is regenerated by its own
//! [`SignalGenerator`] task, and a [`FailSafeWatchdog`] task forces the
//! neutral setpoint when `set` has not been called within the reset
//! interval.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use teleop_hal::motor::{DriveGeometry, MotorController};
//! use teleop_hal::pwm::PwmPin;
//! use teleop_hal::sim::SimPin;
//!
//! let pins: [Arc<dyn PwmPin>; 3] = [
//!     Arc::new(SimPin::new(32)),
//!     Arc::new(SimPin::new(35)),
//!     Arc::new(SimPin::new(33)),
//! ];
//! let motor = MotorController::new(pins, DriveGeometry::default()).unwrap();
//! motor.set(0.5, 90.0).unwrap();
//! let duties = motor.duties();
//! assert_eq!((duties.left, duties.right, duties.angle), (50.0, 50.0, 50.0));
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use teleop_kernel::{FailSafe, FailSafeWatchdog, RepeatingTask, lock_recover, shutdown_all};
use teleop_types::TeleopError;
use tracing::{debug, info};

use crate::pwm::{OutputBank, ProbeTraces, PwmOutput, PwmPin, SignalGenerator, SignalProbe};

const MOTOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::motor");

const LEFT: usize = 0;
const RIGHT: usize = 1;
const ANGLE: usize = 2;

/// Heading that brings the platform to a stop.
const STOP_HEADING: f64 = 270.0;

/// Steering limits and timing for a [`MotorController`].
#[derive(Debug, Clone, PartialEq)]
pub struct DriveGeometry {
    /// Smallest steering angle in degrees.
    pub min_angle: f64,
    /// Largest steering angle in degrees.
    pub max_angle: f64,
    /// Straight-ahead heading in degrees.
    pub neutral_angle: f64,
    /// PWM period of every output.
    pub period: Duration,
    /// Window after which a setpoint is considered stale.
    pub reset_interval: Duration,
    /// How often the watchdog checks the window.
    pub watchdog_tick: Duration,
}

impl Default for DriveGeometry {
    fn default() -> Self {
        Self {
            min_angle: 45.0,
            max_angle: 135.0,
            neutral_angle: 90.0,
            period: Duration::from_millis(20),
            reset_interval: Duration::from_secs(1),
            watchdog_tick: Duration::from_millis(250),
        }
    }
}

impl DriveGeometry {
    /// Validate `min ≤ neutral ≤ max` within `[0, 180]`.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::Config`] describing the violated bound.
    pub fn validate(&self) -> Result<(), TeleopError> {
        let ordered = 0.0 <= self.min_angle
            && self.min_angle < self.neutral_angle
            && self.neutral_angle < self.max_angle
            && self.max_angle <= 180.0;
        if !ordered {
            return Err(TeleopError::Config(format!(
                "steering angles must satisfy 0 <= min < neutral < max <= 180, got {}/{}/{}",
                self.min_angle, self.neutral_angle, self.max_angle
            )));
        }
        if self.period.is_zero() || self.reset_interval.is_zero() || self.watchdog_tick.is_zero() {
            return Err(TeleopError::Config(
                "PWM period, reset interval and watchdog tick must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve a raw `(r, theta)` command into the clamped magnitude and
    /// steering heading actually applied.
    pub fn resolve(&self, r: f64, theta: f64) -> (f64, f64) {
        let r = if r.is_nan() { 0.0 } else { r.clamp(0.0, 1.0) };
        if r == 0.0 || !theta.is_finite() {
            return (0.0, self.neutral_angle);
        }
        let theta = theta.abs() % 360.0;
        let theta = if theta == STOP_HEADING {
            return (0.0, self.neutral_angle);
        } else if theta > STOP_HEADING {
            self.min_angle
        } else if theta > 180.0 {
            self.max_angle
        } else {
            theta
        };
        (r, theta.clamp(self.min_angle, self.max_angle))
    }

    /// Duty cycles for a resolved `(r, theta)` pair.
    pub fn duties(&self, r: f64, theta: f64) -> DriveDuties {
        let steer = if theta >= self.neutral_angle {
            (theta - self.neutral_angle) / (self.max_angle - self.neutral_angle)
        } else {
            (theta - self.neutral_angle) / (self.neutral_angle - self.min_angle)
        };
        DriveDuties {
            left: r * (1.0 - steer.max(0.0)) * 100.0,
            right: r * (1.0 + steer.min(0.0)) * 100.0,
            angle: theta / 180.0 * 100.0,
        }
    }

    /// Duty cycles of the stopped, centred state.
    pub fn neutral(&self) -> DriveDuties {
        self.duties(0.0, self.neutral_angle)
    }
}

/// Duty-cycle percentages of the three drive outputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveDuties {
    pub left: f64,
    pub right: f64,
    pub angle: f64,
}

impl DriveDuties {
    fn to_vec(self) -> Vec<f64> {
        vec![self.left, self.right, self.angle]
    }
}

/// Shared half of the controller: the bank plus the geometry needed to map
/// commands onto it.  This is what the watchdog holds.
struct Drive {
    geometry: DriveGeometry,
    bank: Arc<OutputBank>,
}

impl FailSafe for Drive {
    fn name(&self) -> &str {
        "motor"
    }

    fn is_stale(&self) -> bool {
        self.bank.is_stale()
    }

    fn is_safe(&self) -> bool {
        self.bank.is_neutral()
    }

    fn engage(&self) {
        self.bank.force_neutral();
    }
}

/// Left/right speed plus steering servo, with a command-refresh watchdog.
pub struct MotorController {
    drive: Arc<Drive>,
    pins: [Arc<dyn PwmPin>; 3],
    tasks: Mutex<Vec<RepeatingTask>>,
    probe: Mutex<Option<(RepeatingTask, ProbeTraces)>>,
}

impl MotorController {
    /// Build a stopped controller driving `[left, right, angle]` pins.
    ///
    /// No thread runs until [`MotorController::start`].
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::Config`] for invalid geometry.
    pub fn new(pins: [Arc<dyn PwmPin>; 3], geometry: DriveGeometry) -> Result<Self, TeleopError> {
        geometry.validate()?;
        let outputs = vec![
            PwmOutput::new("pwm_left", pins[LEFT].channel(), geometry.period)?,
            PwmOutput::new("pwm_right", pins[RIGHT].channel(), geometry.period)?,
            PwmOutput::new("pwm_angle", pins[ANGLE].channel(), geometry.period)?,
        ];
        let bank = OutputBank::new(outputs, geometry.neutral().to_vec(), geometry.reset_interval)?;
        Ok(Self {
            drive: Arc::new(Drive {
                geometry,
                bank: Arc::new(bank),
            }),
            pins,
            tasks: Mutex::new(Vec::new()),
            probe: Mutex::new(None),
        })
    }

    pub fn geometry(&self) -> &DriveGeometry {
        &self.drive.geometry
    }

    /// Apply a movement command.
    ///
    /// `r` is the speed magnitude in `[0, 1]` and `theta` the heading in
    /// degrees; both are normalized, see [`DriveGeometry::resolve`].
    /// Refreshes the watchdog deadline.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::HardwareFault`] only if the mapping produced
    /// an out-of-range duty, which a validated geometry cannot do.
    pub fn set(&self, r: f64, theta: f64) -> Result<(), TeleopError> {
        let geometry = &self.drive.geometry;
        let (r, theta) = geometry.resolve(r, theta);
        let duties = geometry.duties(r, theta);
        self.drive.bank.update(&duties.to_vec())?;
        debug!(
            target: MOTOR_TARGET,
            r, theta, left = duties.left, right = duties.right, angle = duties.angle,
            "motor setpoint updated"
        );
        Ok(())
    }

    /// Stop and centre.
    pub fn reset(&self) {
        self.drive.bank.force_neutral();
    }

    /// Current stored duty cycles.
    pub fn duties(&self) -> DriveDuties {
        let d = self.drive.bank.duties();
        DriveDuties {
            left: d[LEFT],
            right: d[RIGHT],
            angle: d[ANGLE],
        }
    }

    /// Snapshot of the three outputs.
    pub fn outputs(&self) -> Vec<PwmOutput> {
        self.drive.bank.outputs()
    }

    /// The controller as a [`FailSafe`] target for an external watchdog.
    pub fn fail_safe(&self) -> Arc<dyn FailSafe> {
        self.drive.clone()
    }

    /// Spawn the three signal generators and the watchdog, plus the probe
    /// when `probe_depth` is given.  Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::TaskFault`] if a thread cannot be spawned; any
    /// task already started is shut down again.
    pub fn start(&self, probe_depth: Option<usize>) -> Result<(), TeleopError> {
        let mut tasks = lock_recover(&self.tasks);
        if !tasks.is_empty() {
            return Ok(());
        }
        self.reset();

        let names = ["pwm_left", "pwm_right", "pwm_angle"];
        for (index, (pin, name)) in self.pins.iter().zip(names).enumerate() {
            tasks.push(RepeatingTask::new(
                name,
                Duration::ZERO,
                SignalGenerator::new(name, Arc::clone(pin), Arc::clone(&self.drive.bank), index),
            ));
        }
        tasks.push(
            FailSafeWatchdog::new(vec![self.fail_safe()])
                .into_task("pwm_reset", self.drive.geometry.watchdog_tick),
        );

        for task in tasks.iter() {
            if let Err(e) = task.start() {
                shutdown_all(tasks.iter());
                tasks.clear();
                return Err(e);
            }
        }

        if let Some(depth) = probe_depth {
            let probe = SignalProbe::new(
                names
                    .iter()
                    .zip(&self.pins)
                    .map(|(n, p)| (n.to_string(), Arc::clone(p)))
                    .collect(),
                depth,
            );
            let traces = probe.traces();
            let task = RepeatingTask::new("pwm_probe", self.drive.geometry.period / 10, probe);
            task.start()?;
            *lock_recover(&self.probe) = Some((task, traces));
        }

        info!(
            target: MOTOR_TARGET,
            reset_interval_ms = self.drive.geometry.reset_interval.as_millis() as u64,
            "motor controller started"
        );
        Ok(())
    }

    /// Rendered probe traces, if the probe is running.
    pub fn probe_traces(&self) -> Option<String> {
        lock_recover(&self.probe).as_ref().map(|(_, t)| t.render())
    }

    /// Whether the generator and watchdog tasks are running.
    pub fn is_running(&self) -> bool {
        let tasks = lock_recover(&self.tasks);
        !tasks.is_empty() && tasks.iter().all(RepeatingTask::is_running)
    }

    /// Stop every task, join it and drive the pins low.
    pub fn close(&self) {
        if let Some((task, _)) = lock_recover(&self.probe).take() {
            shutdown_all([&task]);
        }
        let mut tasks = lock_recover(&self.tasks);
        if tasks.is_empty() {
            return;
        }
        shutdown_all(tasks.iter());
        tasks.clear();
        self.reset();
        info!(target: MOTOR_TARGET, "motor controller stopped");
    }
}

impl Drop for MotorController {
    fn drop(&mut self) {
        self.close();
    }
}
