//! `teleop-runtime` – application wiring for the teleop controller.
//!
//! # Modules
//!
//! - [`streamer`] – [`Streamer`][streamer::Streamer]: camera + detector
//!   producer registered as the session routine that pushes `FRAME`
//!   telemetry.
//! - [`handlers`] – [`Controller`][handlers::Controller]: owns the
//!   streamer, motor controller and status display, and builds the
//!   [`HandlerRegistry`][teleop_middleware::HandlerRegistry] covering every
//!   client opcode plus the login, enter and exit hooks.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs
//!   the global `tracing` subscriber with an optional OTLP span exporter.

pub mod handlers;
pub mod streamer;
pub mod telemetry;

pub use handlers::{CLIENT_ROW, Controller, SERVER_ROW};
pub use streamer::{Streamer, StreamerConfig};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
