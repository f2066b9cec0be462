//! `teleop-hal` – hardware abstraction for the teleop controller.
//!
//! # Modules
//!
//! - [`pwm`] – software-timed PWM: pins, outputs, the per-output signal
//!   generator task and the signal probe.
//! - [`motor`] – differential-drive [`MotorController`] with a
//!   command-refresh watchdog.
//! - [`camera`], [`detector`], [`display`] – narrow traits for the camera,
//!   object-detection engine and status display collaborators.
//! - [`sim`] – simulated drivers so the full stack runs without hardware.

pub mod camera;
pub mod detector;
pub mod display;
pub mod motor;
pub mod pwm;
pub mod sim;

pub use camera::{Camera, CameraFrame};
pub use detector::Detector;
pub use display::StatusDisplay;
pub use motor::{DriveDuties, DriveGeometry, MotorController};
pub use pwm::{OutputBank, PwmOutput, PwmPin, SignalGenerator, SignalProbe};
