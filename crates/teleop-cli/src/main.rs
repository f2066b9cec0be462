//! `teleopd` – teleop controller daemon.
//!
//! 1. Loads `~/.teleop/config.toml` (or the path given as the first
//!    argument), writing the defaults on first run.
//! 2. Builds the simulated hardware, starts the motor controller and its
//!    watchdog, and serves one operator at a time on the configured port.
//! 3. Ctrl-C closes the listener; the motors are released before exit.
//!
//! Exits with status 3 when a client requested `SHUTDOWN`, so a service
//! supervisor can act on it.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use teleop_hal::pwm::PwmPin;
use teleop_hal::sim::{MemoryDisplay, SimCamera, SimDetector, SimPin};
use teleop_hal::{MotorController, StatusDisplay};
use teleop_middleware::{Listener, ListenerExit};
use teleop_runtime::{Controller, Streamer, init_tracing};
use teleop_types::TeleopError;
use tracing::{debug, error, info, warn};

/// Exit status reported when a client asked for a host shutdown.
const SHUTDOWN_STATUS: u8 = 3;

const DISPLAY_ROWS: usize = 2;

fn main() -> ExitCode {
    let _guard = init_tracing("teleopd");

    match run() {
        Ok(ListenerExit::Shutdown) => {
            warn!("shutdown requested by client");
            ExitCode::from(SHUTDOWN_STATUS)
        }
        Ok(reason) => {
            info!(?reason, "teleopd stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "teleopd failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ListenerExit, TeleopError> {
    let path = match std::env::args().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => {
            let path = config::config_path();
            if !path.exists() {
                config::save_to(&config::Config::default(), &path)?;
                info!(path = %path.display(), "wrote default configuration");
            }
            path
        }
    };
    let cfg = config::load(&path)?;
    info!(path = %path.display(), config = ?cfg, "configuration loaded");

    let pins: [Arc<dyn PwmPin>; 3] = [
        Arc::new(SimPin::new(cfg.pwm.speed_left_channel)),
        Arc::new(SimPin::new(cfg.pwm.speed_right_channel)),
        Arc::new(SimPin::new(cfg.pwm.angle_channel)),
    ];
    let motor = Arc::new(MotorController::new(pins, cfg.geometry()?)?);
    motor.start(cfg.probe_depth())?;

    let streamer = Arc::new(Streamer::new(
        Box::new(SimCamera::new("front", cfg.streamer.width, cfg.streamer.height)),
        Box::new(SimDetector::new(&cfg.detector.configs)),
        cfg.streamer()?,
    ));
    let display: Arc<dyn StatusDisplay> = Arc::new(MemoryDisplay::new(DISPLAY_ROWS));
    let controller = Controller::new(streamer.clone(), motor.clone(), display.clone());

    let listener = Arc::new(Listener::bind(
        cfg.listener()?,
        controller.registry(&cfg.server.password),
    )?);
    controller.show_server(listener.local_addr());

    let on_ctrlc = listener.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Ctrl-C received, closing listener");
        on_ctrlc.close();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; stop with SIGKILL");
    }

    listener.start()?;
    info!(addr = %listener.local_addr(), login = !cfg.server.password.is_empty(), "serving");
    let joined = listener.join();

    streamer.close();
    if let Some(traces) = motor.probe_traces() {
        debug!(%traces, "final pwm traces");
    }
    motor.close();
    for row in 0..display.rows() {
        display.set_row(row, None);
    }

    joined?;
    Ok(listener.exit_reason().unwrap_or(ListenerExit::Closed))
}
