//! Controller configuration – reads/writes `~/.teleop/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use teleop_hal::motor::DriveGeometry;
use teleop_middleware::{ListenerConfig, Mode, SessionConfig};
use teleop_runtime::StreamerConfig;
use teleop_types::TeleopError;

/// Persisted configuration.  Every field has a default, so a partial file
/// (or none at all) is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub pwm: PwmSection,
    pub streamer: StreamerSection,
    pub detector: DetectorSection,
}

/// `[server]`
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Stop after this long without a client; 0 waits forever.
    pub accept_timeout_secs: f64,
    /// Socket read/write timeout; 0 disables it.
    pub client_timeout_secs: f64,
    /// `async` or `sync`.
    pub mode: String,
    pub queue_capacity: usize,
    pub queue_timeout_ms: u64,
    /// Shared secret for the login exchange; empty disables login.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5050,
            accept_timeout_secs: 0.0,
            client_timeout_secs: 30.0,
            mode: Mode::Async.to_string(),
            queue_capacity: 64,
            queue_timeout_ms: 200,
            password: String::new(),
        }
    }
}

impl std::fmt::Debug for ServerSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("accept_timeout_secs", &self.accept_timeout_secs)
            .field("client_timeout_secs", &self.client_timeout_secs)
            .field("mode", &self.mode)
            .field("queue_capacity", &self.queue_capacity)
            .field("queue_timeout_ms", &self.queue_timeout_ms)
            .field(
                "password",
                if self.password.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .finish()
    }
}

/// `[pwm]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PwmSection {
    pub speed_left_channel: u32,
    pub speed_right_channel: u32,
    pub angle_channel: u32,
    pub period_secs: f64,
    pub min_angle: f64,
    pub max_angle: f64,
    pub neutral_angle: f64,
    pub reset_interval_secs: f64,
    pub watchdog_tick_secs: f64,
    /// Sample pin levels and log them as traces.
    pub probe: bool,
    pub probe_depth: usize,
}

impl Default for PwmSection {
    fn default() -> Self {
        Self {
            speed_left_channel: 32,
            speed_right_channel: 35,
            angle_channel: 33,
            period_secs: 0.02,
            min_angle: 45.0,
            max_angle: 135.0,
            neutral_angle: 90.0,
            reset_interval_secs: 1.0,
            watchdog_tick_secs: 0.25,
            probe: false,
            probe_depth: 40,
        }
    }
}

/// `[streamer]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerSection {
    pub max_fps: u32,
    pub idle_interval_secs: f64,
    pub width: u32,
    pub height: u32,
}

impl Default for StreamerSection {
    fn default() -> Self {
        Self {
            max_fps: 20,
            idle_interval_secs: 0.05,
            width: 640,
            height: 480,
        }
    }
}

/// `[detector]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSection {
    /// Model configurations offered to clients.
    pub configs: Vec<String>,
}

impl Default for DetectorSection {
    fn default() -> Self {
        Self {
            configs: vec!["yolov4-tiny-416".to_string(), "yolov4-608".to_string()],
        }
    }
}

fn seconds(field: &str, secs: f64) -> Result<Duration, TeleopError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| TeleopError::Config(format!("{field} = {secs}: {e}")))
}

/// `None` for zero, which disables the timeout.
fn optional_seconds(field: &str, secs: f64) -> Result<Option<Duration>, TeleopError> {
    let d = seconds(field, secs)?;
    Ok((!d.is_zero()).then_some(d))
}

impl Config {
    /// Listener and session settings.
    pub fn listener(&self) -> Result<ListenerConfig, TeleopError> {
        let s = &self.server;
        Ok(ListenerConfig {
            host: s.host.clone(),
            port: s.port,
            accept_timeout: optional_seconds("server.accept_timeout_secs", s.accept_timeout_secs)?,
            session: SessionConfig {
                mode: s.mode.parse()?,
                queue_capacity: s.queue_capacity,
                queue_timeout: Duration::from_millis(s.queue_timeout_ms),
                io_timeout: optional_seconds(
                    "server.client_timeout_secs",
                    s.client_timeout_secs,
                )?,
            },
        })
    }

    /// Steering limits and timing for the motor controller.
    pub fn geometry(&self) -> Result<DriveGeometry, TeleopError> {
        let p = &self.pwm;
        let geometry = DriveGeometry {
            min_angle: p.min_angle,
            max_angle: p.max_angle,
            neutral_angle: p.neutral_angle,
            period: seconds("pwm.period_secs", p.period_secs)?,
            reset_interval: seconds("pwm.reset_interval_secs", p.reset_interval_secs)?,
            watchdog_tick: seconds("pwm.watchdog_tick_secs", p.watchdog_tick_secs)?,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn streamer(&self) -> Result<StreamerConfig, TeleopError> {
        Ok(StreamerConfig {
            max_fps: self.streamer.max_fps,
            idle_interval: seconds("streamer.idle_interval_secs", self.streamer.idle_interval_secs)?,
        })
    }

    /// Probe ring depth when probing is enabled.
    pub fn probe_depth(&self) -> Option<usize> {
        self.pwm.probe.then_some(self.pwm.probe_depth.max(1))
    }
}

/// Return the path to `~/.teleop/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".teleop").join("config.toml")
}

/// Load the config from `path` and apply environment overrides.
///
/// A missing file yields the defaults.
pub fn load(path: &Path) -> Result<Config, TeleopError> {
    let mut cfg = read_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Parse the file at `path`.  Returns `None` if it does not exist.
pub(crate) fn read_from(path: &Path) -> Result<Option<Config>, TeleopError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        TeleopError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| TeleopError::Config(format!("failed to parse config: {e}")))?;
    Ok(Some(cfg))
}

/// Apply `TELEOP_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TELEOP_HOST` | `server.host` |
/// | `TELEOP_PORT` | `server.port` |
/// | `TELEOP_PASSWORD` | `server.password` |
/// | `TELEOP_MODE` | `server.mode` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TELEOP_HOST") {
        cfg.server.host = v;
    }
    if let Ok(v) = std::env::var("TELEOP_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.server.port = port;
    }
    if let Ok(v) = std::env::var("TELEOP_PASSWORD") {
        cfg.server.password = v;
    }
    if let Ok(v) = std::env::var("TELEOP_MODE")
        && let Ok(mode) = v.parse::<Mode>()
    {
        cfg.server.mode = mode.to_string();
    }
}

/// Save the config to `path`, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), TeleopError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            TeleopError::Config(format!("failed to create config directory: {e}"))
        })?;
        // Owner only (rwx------): the file may hold the login password.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                TeleopError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| TeleopError::Config(format!("failed to serialize config: {e}")))?;
    let write_err =
        |e: std::io::Error| TeleopError::Config(format!("failed to write config at {}: {e}", path.display()));
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
