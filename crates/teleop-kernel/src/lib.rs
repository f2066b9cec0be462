//! `teleop-kernel` – Scheduling & Safety
//!
//! The brainstem of the controller: it owns no protocol or hardware
//! knowledge, only the rules for running threads and for falling back to a
//! safe state.
//!
//! # Modules
//!
//! - [`task`] – [`RepeatingTask`][task::RepeatingTask]: the start/tick/stop
//!   thread primitive every long-lived subsystem is built on, with the
//!   cloneable [`StopSignal`][task::StopSignal] used for cooperative,
//!   idempotent cancellation.
//! - [`watchdog`] – [`FailSafeWatchdog`][watchdog::FailSafeWatchdog]:
//!   forces registered [`FailSafe`][watchdog::FailSafe] subsystems into
//!   their safe state when their [`RefreshTimer`][watchdog::RefreshTimer]
//!   expires.

pub mod task;
pub mod watchdog;

pub use task::{Phases, RepeatingTask, StopSignal, lock_recover, shutdown_all};
pub use watchdog::{FailSafe, FailSafeWatchdog, RefreshTimer};
