//! Software-timed PWM.
//!
//! - [`PwmPin`] – a digital output line a signal can be toggled on.
//! - [`PwmOutput`] – one pulse channel: period and duty-cycle percent.
//! - [`OutputBank`] – a group of outputs whose setpoints are replaced
//!   atomically under a single mutex, with a refresh deadline after which
//!   readers see the neutral values instead.
//! - [`SignalGenerator`] – the per-output [`Phases`] that drives a pin high
//!   for `period × duty / 100` and low for the remainder, forever.
//! - [`SignalProbe`] – samples pin levels into a fixed-size trace per pin.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use teleop_kernel::{Phases, RefreshTimer, StopSignal, lock_recover};
use teleop_types::TeleopError;
use tracing::{debug, info, warn};

const PWM_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::pwm");

// ────────────────────────────────────────────────────────────────────────────
// PwmPin
// ────────────────────────────────────────────────────────────────────────────

/// A digital output line (GPIO pin or simulated equivalent).
///
/// Pins are shared between the generator thread that drives them and
/// observers such as [`SignalProbe`], so every method takes `&self`.
pub trait PwmPin: Send + Sync {
    /// Physical pin / channel number.
    fn channel(&self) -> u32;

    /// Drive the line high (`true`) or low (`false`).
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::HardwareFault`] if the line cannot be driven.
    fn set_level(&self, high: bool) -> Result<(), TeleopError>;

    /// Current line level.
    fn level(&self) -> bool;

    /// Return the line to the platform.  Called once when the generator
    /// stops.
    fn release(&self) {}
}

// ────────────────────────────────────────────────────────────────────────────
// PwmOutput
// ────────────────────────────────────────────────────────────────────────────

/// One pulse channel.  Invariants: `period > 0`, `duty ∈ [0, 100]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PwmOutput {
    name: String,
    channel: u32,
    period: Duration,
    duty_percent: f64,
}

impl PwmOutput {
    /// A new output at 0 % duty.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::HardwareFault`] for a zero period.
    pub fn new(name: impl Into<String>, channel: u32, period: Duration) -> Result<Self, TeleopError> {
        let name = name.into();
        if period.is_zero() {
            return Err(TeleopError::HardwareFault {
                component: name,
                details: "PWM period must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            name,
            channel,
            period,
            duty_percent: 0.0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn duty_percent(&self) -> f64 {
        self.duty_percent
    }

    /// Change the duty cycle.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::HardwareFault`] when `percent` is outside
    /// `[0, 100]` or not a number.
    pub fn set_duty_percent(&mut self, percent: f64) -> Result<(), TeleopError> {
        check_duty(&self.name, percent)?;
        self.duty_percent = percent;
        Ok(())
    }

    /// Time spent high per period at `duty_percent`.
    pub fn high_time(period: Duration, duty_percent: f64) -> Duration {
        period.mul_f64(duty_percent.clamp(0.0, 100.0) / 100.0)
    }
}

impl std::fmt::Display for PwmOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "name: {} ch: {} period: {:.3}s duty_cycle: {:5.2}%",
            self.name,
            self.channel,
            self.period.as_secs_f64(),
            self.duty_percent
        )
    }
}

fn check_duty(component: &str, percent: f64) -> Result<(), TeleopError> {
    if (0.0..=100.0).contains(&percent) {
        Ok(())
    } else {
        Err(TeleopError::HardwareFault {
            component: component.to_string(),
            details: format!("duty cycle {percent} outside [0, 100]"),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// OutputBank
// ────────────────────────────────────────────────────────────────────────────

struct BankState {
    outputs: Vec<PwmOutput>,
    neutral: Vec<f64>,
    timer: RefreshTimer,
}

/// A group of [`PwmOutput`]s updated together under one mutex.
pub struct OutputBank {
    state: Mutex<BankState>,
}

impl OutputBank {
    /// Create a bank starting in the neutral state.
    ///
    /// `neutral` holds the safe duty for each output, index for index.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::HardwareFault`] when the lengths differ or a
    /// neutral duty is out of range.
    pub fn new(
        mut outputs: Vec<PwmOutput>,
        neutral: Vec<f64>,
        reset_interval: Duration,
    ) -> Result<Self, TeleopError> {
        if outputs.len() != neutral.len() {
            return Err(TeleopError::HardwareFault {
                component: "output_bank".to_string(),
                details: format!(
                    "{} outputs but {} neutral values",
                    outputs.len(),
                    neutral.len()
                ),
            });
        }
        for (output, duty) in outputs.iter_mut().zip(&neutral) {
            output.set_duty_percent(*duty)?;
        }
        Ok(Self {
            state: Mutex::new(BankState {
                outputs,
                neutral,
                timer: RefreshTimer::new(reset_interval),
            }),
        })
    }

    /// Number of outputs in the bank.
    pub fn len(&self) -> usize {
        lock_recover(&self.state).outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace every duty cycle at once and refresh the deadline.
    ///
    /// All values are validated before any is written.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::HardwareFault`] on a length mismatch or an
    /// out-of-range duty; the bank is left untouched.
    pub fn update(&self, duties: &[f64]) -> Result<(), TeleopError> {
        let mut state = lock_recover(&self.state);
        if duties.len() != state.outputs.len() {
            return Err(TeleopError::HardwareFault {
                component: "output_bank".to_string(),
                details: format!(
                    "expected {} duty values, got {}",
                    state.outputs.len(),
                    duties.len()
                ),
            });
        }
        for (output, duty) in state.outputs.iter().zip(duties) {
            check_duty(output.name(), *duty)?;
        }
        for (output, duty) in state.outputs.iter_mut().zip(duties) {
            output.duty_percent = *duty;
        }
        state.timer.refresh();
        Ok(())
    }

    /// Write the neutral duties and refresh the deadline.  Cannot fail.
    pub fn force_neutral(&self) {
        let mut state = lock_recover(&self.state);
        let BankState {
            outputs,
            neutral,
            timer,
        } = &mut *state;
        for (output, duty) in outputs.iter_mut().zip(neutral.iter()) {
            output.duty_percent = *duty;
        }
        timer.refresh();
    }

    /// Current duty cycle of every output.
    pub fn duties(&self) -> Vec<f64> {
        lock_recover(&self.state)
            .outputs
            .iter()
            .map(PwmOutput::duty_percent)
            .collect()
    }

    /// Snapshot of every output.
    pub fn outputs(&self) -> Vec<PwmOutput> {
        lock_recover(&self.state).outputs.clone()
    }

    /// Period and duty a generator should emit for `index` right now.
    ///
    /// Once the refresh deadline has passed this reports the neutral duty
    /// even if the watchdog has not rewritten the setpoints yet.
    pub fn effective(&self, index: usize) -> Option<(Duration, f64)> {
        let state = lock_recover(&self.state);
        let output = state.outputs.get(index)?;
        let duty = if state.timer.is_expired_at(Instant::now()) {
            state.neutral[index]
        } else {
            output.duty_percent
        };
        Some((output.period, duty))
    }

    /// Whether the refresh deadline has passed.
    pub fn is_stale(&self) -> bool {
        lock_recover(&self.state).timer.is_expired()
    }

    /// Whether every output sits at its neutral duty.
    pub fn is_neutral(&self) -> bool {
        let state = lock_recover(&self.state);
        state
            .outputs
            .iter()
            .zip(&state.neutral)
            .all(|(o, n)| (o.duty_percent - n).abs() < f64::EPSILON)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SignalGenerator
// ────────────────────────────────────────────────────────────────────────────

/// Drives one pin from one bank output.  Run it with a zero interval; each
/// tick emits exactly one period.
pub struct SignalGenerator {
    name: String,
    pin: Arc<dyn PwmPin>,
    bank: Arc<OutputBank>,
    index: usize,
}

impl SignalGenerator {
    pub fn new(name: impl Into<String>, pin: Arc<dyn PwmPin>, bank: Arc<OutputBank>, index: usize) -> Self {
        Self {
            name: name.into(),
            pin,
            bank,
            index,
        }
    }

    fn drive(&self, high: bool) {
        if let Err(e) = self.pin.set_level(high) {
            warn!(target: PWM_TARGET, output = %self.name, error = %e, "pin write failed");
        }
    }
}

impl Phases for SignalGenerator {
    fn on_start(&mut self, _stop: &StopSignal) {
        info!(target: PWM_TARGET, output = %self.name, channel = self.pin.channel(), "signal generator started");
    }

    fn on_tick(&mut self, stop: &StopSignal) {
        let Some((period, duty)) = self.bank.effective(self.index) else {
            warn!(target: PWM_TARGET, output = %self.name, index = self.index, "no such output, stopping");
            stop.stop();
            return;
        };
        let high = PwmOutput::high_time(period, duty);
        let low = period.saturating_sub(high);

        if !high.is_zero() {
            self.drive(true);
            if stop.wait(high) {
                return;
            }
        }
        self.drive(false);
        stop.wait(low);
    }

    fn on_stop(&mut self) {
        self.drive(false);
        self.pin.release();
        debug!(target: PWM_TARGET, output = %self.name, "signal generator released pin");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SignalProbe
// ────────────────────────────────────────────────────────────────────────────

/// Samples pin levels into a rolling trace per pin.
///
/// The trace renders as one line per pin, `#` for high and `_` for low,
/// oldest sample first.
pub struct SignalProbe {
    pins: Vec<(String, Arc<dyn PwmPin>)>,
    traces: Arc<Mutex<Vec<VecDeque<bool>>>>,
    depth: usize,
    samples: usize,
}

impl SignalProbe {
    /// Probe `pins`, keeping the last `depth` samples of each.
    pub fn new(pins: Vec<(String, Arc<dyn PwmPin>)>, depth: usize) -> Self {
        let traces = pins.iter().map(|_| VecDeque::from(vec![false; depth])).collect();
        Self {
            pins,
            traces: Arc::new(Mutex::new(traces)),
            depth,
            samples: 0,
        }
    }

    /// Shared handle to the traces, for rendering from another thread.
    pub fn traces(&self) -> ProbeTraces {
        ProbeTraces {
            names: self.pins.iter().map(|(n, _)| n.clone()).collect(),
            traces: Arc::clone(&self.traces),
        }
    }

    /// Take one sample of every pin.
    pub fn sample(&self) {
        let mut traces = lock_recover(&self.traces);
        for ((_, pin), trace) in self.pins.iter().zip(traces.iter_mut()) {
            if trace.len() >= self.depth {
                trace.pop_front();
            }
            trace.push_back(pin.level());
        }
    }
}

impl Phases for SignalProbe {
    fn on_tick(&mut self, _stop: &StopSignal) {
        self.sample();
        self.samples += 1;
        // Once per full ring, so every sample is logged exactly once.
        if self.samples % self.depth.max(1) == 0 {
            debug!(target: PWM_TARGET, "\n{}", self.traces().render());
        }
    }
}

/// Read side of a [`SignalProbe`].
#[derive(Clone)]
pub struct ProbeTraces {
    names: Vec<String>,
    traces: Arc<Mutex<Vec<VecDeque<bool>>>>,
}

impl ProbeTraces {
    /// Render every trace as `name || ##__##__`.
    pub fn render(&self) -> String {
        let traces = lock_recover(&self.traces);
        self.names
            .iter()
            .zip(traces.iter())
            .map(|(name, trace)| {
                let line: String = trace.iter().map(|high| if *high { '#' } else { '_' }).collect();
                format!("{name} || {line}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPin;
    use std::thread;
    use teleop_kernel::RepeatingTask;

    fn bank(reset: Duration) -> Arc<OutputBank> {
        let outputs = vec![
            PwmOutput::new("a", 1, Duration::from_millis(20)).unwrap(),
            PwmOutput::new("b", 2, Duration::from_millis(20)).unwrap(),
        ];
        Arc::new(OutputBank::new(outputs, vec![0.0, 50.0], reset).unwrap())
    }

    #[test]
    fn zero_period_is_rejected() {
        assert!(PwmOutput::new("x", 1, Duration::ZERO).is_err());
    }

    #[test]
    fn duty_outside_range_is_rejected() {
        let mut out = PwmOutput::new("x", 1, Duration::from_millis(10)).unwrap();
        assert!(out.set_duty_percent(-0.1).is_err());
        assert!(out.set_duty_percent(100.1).is_err());
        assert!(out.set_duty_percent(f64::NAN).is_err());
        out.set_duty_percent(100.0).unwrap();
        assert_eq!(out.duty_percent(), 100.0);
    }

    #[test]
    fn high_time_scales_period() {
        let high = PwmOutput::high_time(Duration::from_millis(200), 25.0);
        assert_eq!(high, Duration::from_millis(50));
    }

    #[test]
    fn bank_starts_neutral() {
        let bank = bank(Duration::from_secs(60));
        assert_eq!(bank.duties(), vec![0.0, 50.0]);
        assert!(bank.is_neutral());
    }

    #[test]
    fn update_is_all_or_nothing() {
        let bank = bank(Duration::from_secs(60));
        assert!(bank.update(&[10.0, 150.0]).is_err());
        assert_eq!(bank.duties(), vec![0.0, 50.0]);
        assert!(bank.update(&[10.0]).is_err());
        bank.update(&[10.0, 60.0]).unwrap();
        assert_eq!(bank.duties(), vec![10.0, 60.0]);
        assert!(!bank.is_neutral());
    }

    #[test]
    fn effective_duty_falls_back_to_neutral_after_deadline() {
        let bank = bank(Duration::from_millis(20));
        bank.update(&[80.0, 90.0]).unwrap();
        assert_eq!(bank.effective(0).map(|(_, d)| d), Some(80.0));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(bank.effective(0).map(|(_, d)| d), Some(0.0));
        assert_eq!(bank.effective(1).map(|(_, d)| d), Some(50.0));
        assert!(bank.effective(2).is_none());
        // Readers never write: the stored setpoint is unchanged.
        assert_eq!(bank.duties(), vec![80.0, 90.0]);
    }

    #[test]
    fn force_neutral_restores_safe_duties() {
        let bank = bank(Duration::from_secs(60));
        bank.update(&[70.0, 20.0]).unwrap();
        bank.force_neutral();
        assert!(bank.is_neutral());
        assert!(!bank.is_stale());
    }

    #[test]
    fn generator_toggles_pin_and_releases_on_stop() {
        let bank = bank(Duration::from_secs(60));
        bank.update(&[50.0, 50.0]).unwrap();
        let pin = Arc::new(SimPin::new(1));
        let task = RepeatingTask::new(
            "pwm-a",
            Duration::ZERO,
            SignalGenerator::new("a", pin.clone(), Arc::clone(&bank), 0),
        );
        task.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        task.shutdown().unwrap();

        assert!(pin.rising_edges() >= 2, "expected several pulses");
        assert!(!pin.level());
        assert!(pin.is_released());
    }

    #[test]
    fn generator_at_zero_duty_never_goes_high() {
        let bank = bank(Duration::from_secs(60));
        let pin = Arc::new(SimPin::new(1));
        let task = RepeatingTask::new(
            "pwm-a",
            Duration::ZERO,
            SignalGenerator::new("a", pin.clone(), Arc::clone(&bank), 0),
        );
        task.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        task.shutdown().unwrap();
        assert_eq!(pin.rising_edges(), 0);
    }

    #[test]
    fn probe_renders_fixed_depth_traces() {
        let pin = Arc::new(SimPin::new(3));
        let probe = SignalProbe::new(vec![("speed".to_string(), pin.clone() as Arc<dyn PwmPin>)], 4);
        let traces = probe.traces();
        pin.set_level(true).unwrap();
        probe.sample();
        probe.sample();
        pin.set_level(false).unwrap();
        probe.sample();
        assert_eq!(traces.render(), "speed || _##_");
    }
}
