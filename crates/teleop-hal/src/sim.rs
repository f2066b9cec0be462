//! In-process simulated drivers for running without physical hardware.
//!
//! - [`SimPin`] – a PWM line that counts rising edges.
//! - [`SimCamera`] – produces small placeholder JPEG frames at the
//!   configured resolution.
//! - [`SimDetector`] – offers named model configurations and reports one
//!   centred detection per frame once a configuration is loaded.
//! - [`MemoryDisplay`] – keeps display rows in memory and logs changes.
//!
//! # Example
//!
//! ```rust
//! use teleop_hal::camera::Camera;
//! use teleop_hal::detector::Detector;
//! use teleop_hal::sim::{SimCamera, SimDetector};
//!
//! let mut camera = SimCamera::new("front", 640, 480);
//! let frame = camera.capture().unwrap().unwrap();
//!
//! let mut detector = SimDetector::new(["yolov4-tiny-416"]);
//! detector.load_config("yolov4-tiny-416").unwrap();
//! let found = detector.detect(&frame).unwrap();
//! assert_eq!(found.len(), 1);
//! ```

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use teleop_kernel::lock_recover;
use teleop_types::{Detection, ModelConfig, TeleopError};
use tracing::info;

use crate::camera::{Camera, CameraFrame};
use crate::detector::Detector;
use crate::display::StatusDisplay;
use crate::pwm::PwmPin;

const SIM_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::sim");

// ────────────────────────────────────────────────────────────────────────────
// SimPin
// ────────────────────────────────────────────────────────────────────────────

/// A simulated output line.  Always succeeds.
pub struct SimPin {
    channel: u32,
    level: AtomicBool,
    rising_edges: AtomicUsize,
    released: AtomicBool,
}

impl SimPin {
    pub fn new(channel: u32) -> Self {
        Self {
            channel,
            level: AtomicBool::new(false),
            rising_edges: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }
    }

    /// Number of low→high transitions seen so far.
    pub fn rising_edges(&self) -> usize {
        self.rising_edges.load(Ordering::SeqCst)
    }

    /// Whether [`PwmPin::release`] has been called.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl PwmPin for SimPin {
    fn channel(&self) -> u32 {
        self.channel
    }

    fn set_level(&self, high: bool) -> Result<(), TeleopError> {
        let was = self.level.swap(high, Ordering::SeqCst);
        if high && !was {
            self.rising_edges.fetch_add(1, Ordering::SeqCst);
        }
        self.released.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn level(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimCamera
// ────────────────────────────────────────────────────────────────────────────

/// A simulated camera that always has a frame ready.
///
/// Frames are a JPEG start/end marker pair around the resolution and a
/// sequence number, enough for clients that only forward the bytes.
pub struct SimCamera {
    id: String,
    width: u32,
    height: u32,
    sequence: AtomicU64,
}

impl SimCamera {
    pub fn new(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            sequence: AtomicU64::new(0),
        }
    }
}

impl Camera for SimCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn capture(&mut self) -> Result<Option<CameraFrame>, TeleopError> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut data = vec![0xff, 0xd8];
        data.extend_from_slice(&self.width.to_be_bytes());
        data.extend_from_slice(&self.height.to_be_bytes());
        data.extend_from_slice(&seq.to_be_bytes());
        data.extend_from_slice(&[0xff, 0xd9]);
        Ok(Some(CameraFrame {
            width: self.width,
            height: self.height,
            data,
        }))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn set_resolution(&mut self, width: u32, height: u32) -> Result<(), TeleopError> {
        if width == 0 || height == 0 {
            return Err(TeleopError::HardwareFault {
                component: self.id.clone(),
                details: format!("invalid resolution {width}x{height}"),
            });
        }
        self.width = width;
        self.height = height;
        info!(target: SIM_TARGET, camera = %self.id, width, height, "resolution changed");
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimDetector
// ────────────────────────────────────────────────────────────────────────────

const SIM_CLASSES: [&str; 3] = ["person", "car", "dog"];

/// A simulated detector.
///
/// Configuration names follow `<model>[-tiny]-<size>`, e.g.
/// `yolov4-tiny-416`; size defaults to 416 when the name has no numeric
/// suffix.
pub struct SimDetector {
    configs: Vec<ModelConfig>,
    active: Option<usize>,
}

impl SimDetector {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let configs = names.into_iter().map(|n| parse_config(n.as_ref())).collect();
        Self {
            configs,
            active: None,
        }
    }
}

fn parse_config(name: &str) -> ModelConfig {
    let mut parts = name.split('-');
    let model_type = parts.next().unwrap_or_default().to_string();
    let size = name
        .rsplit('-')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(416);
    ModelConfig {
        name: name.to_string(),
        size,
        model_type,
        tiny: name.split('-').any(|p| p == "tiny"),
        classes: SIM_CLASSES.iter().map(|c| c.to_string()).collect(),
    }
}

impl Detector for SimDetector {
    fn configs(&self) -> Vec<ModelConfig> {
        self.configs.clone()
    }

    fn active_config(&self) -> Option<ModelConfig> {
        self.active.and_then(|i| self.configs.get(i)).cloned()
    }

    fn load_config(&mut self, name: &str) -> Result<(), TeleopError> {
        let index = self
            .configs
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| TeleopError::HardwareFault {
                component: "detector".to_string(),
                details: format!("unknown model config {name:?}"),
            })?;
        self.active = Some(index);
        info!(target: SIM_TARGET, config = %name, "model config loaded");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.active.is_some()
    }

    fn detect(&mut self, frame: &CameraFrame) -> Result<Vec<Detection>, TeleopError> {
        let Some(config) = self.active_config() else {
            return Err(TeleopError::HardwareFault {
                component: "detector".to_string(),
                details: "no model config loaded".to_string(),
            });
        };
        let (w, h) = (frame.width as f32, frame.height as f32);
        Ok(vec![Detection {
            bbox: [w * 0.25, h * 0.25, w * 0.75, h * 0.75],
            class: config.classes.first().cloned().unwrap_or_default(),
            score: 0.9,
        }])
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MemoryDisplay
// ────────────────────────────────────────────────────────────────────────────

/// A display that keeps its rows in memory.
pub struct MemoryDisplay {
    rows: Mutex<Vec<Option<String>>>,
}

impl MemoryDisplay {
    pub fn new(rows: usize) -> Self {
        Self {
            rows: Mutex::new(vec![None; rows]),
        }
    }

    /// Current text of row `index`.
    pub fn row(&self, index: usize) -> Option<String> {
        lock_recover(&self.rows).get(index).cloned().flatten()
    }
}

impl StatusDisplay for MemoryDisplay {
    fn rows(&self) -> usize {
        lock_recover(&self.rows).len()
    }

    fn set_row(&self, index: usize, text: Option<&str>) {
        let mut rows = lock_recover(&self.rows);
        if let Some(row) = rows.get_mut(index) {
            *row = text.map(str::to_string);
            info!(target: SIM_TARGET, row = index, text = text.unwrap_or(""), "display updated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_pin_counts_rising_edges() {
        let pin = SimPin::new(7);
        pin.set_level(true).unwrap();
        pin.set_level(true).unwrap();
        pin.set_level(false).unwrap();
        pin.set_level(true).unwrap();
        assert_eq!(pin.rising_edges(), 2);
        assert!(pin.level());
        pin.release();
        assert!(pin.is_released());
    }

    #[test]
    fn sim_camera_frames_follow_resolution() {
        let mut cam = SimCamera::new("front", 640, 480);
        let first = cam.capture().unwrap().unwrap();
        assert_eq!((first.width, first.height), (640, 480));
        assert_eq!(&first.data[..2], &[0xff, 0xd8]);
        assert_eq!(&first.data[first.data.len() - 2..], &[0xff, 0xd9]);

        cam.set_resolution(1280, 720).unwrap();
        assert_eq!(cam.resolution(), (1280, 720));
        let second = cam.capture().unwrap().unwrap();
        assert_ne!(first.data, second.data);
        assert!(cam.set_resolution(0, 720).is_err());
    }

    #[test]
    fn sim_detector_parses_config_names() {
        let det = SimDetector::new(["yolov4-tiny-416", "yolov4-608", "ssd"]);
        let configs = det.configs();
        assert_eq!(configs.len(), 3);
        assert!(configs[0].tiny);
        assert_eq!(configs[0].size, 416);
        assert_eq!(configs[1].size, 608);
        assert!(!configs[1].tiny);
        assert_eq!(configs[2].model_type, "ssd");
        assert_eq!(configs[2].size, 416);
    }

    #[test]
    fn sim_detector_requires_loaded_config() {
        let mut det = SimDetector::new(["yolov4-416"]);
        let frame = CameraFrame {
            width: 100,
            height: 100,
            data: Vec::new(),
        };
        assert!(!det.is_ready());
        assert!(det.detect(&frame).is_err());
        assert!(det.load_config("missing").is_err());

        det.load_config("yolov4-416").unwrap();
        assert!(det.is_ready());
        assert_eq!(det.active_config().unwrap().name, "yolov4-416");
        let found = det.detect(&frame).unwrap();
        assert_eq!(found[0].bbox, [25.0, 25.0, 75.0, 75.0]);
        assert_eq!(found[0].class, "person");
    }

    #[test]
    fn memory_display_sets_and_clears_rows() {
        let display = MemoryDisplay::new(2);
        display.set_row(1, Some("10.0.0.2:5000"));
        assert_eq!(display.row(1).as_deref(), Some("10.0.0.2:5000"));
        display.set_row(1, None);
        assert_eq!(display.row(1), None);
        display.set_row(9, Some("ignored"));
        assert_eq!(display.rows(), 2);
    }
}
