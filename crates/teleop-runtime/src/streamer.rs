//! Camera + detector frame producer.
//!
//! The [`Streamer`] is registered as a session routine: each call to
//! [`Streamer::next_frame`] either yields one `FRAME` envelope or idles
//! briefly and yields nothing.  Streaming and inference are toggled by the
//! operator and both are cleared when a session ends.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use teleop_hal::{Camera, Detector};
use teleop_kernel::lock_recover;
use teleop_types::{Envelope, ModelConfig, TeleopError, commands};
use tracing::{debug, info, warn};

const STREAMER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::streamer");

/// Accepted capture sizes are strictly inside this range on both axes.
pub const MIN_DIMENSION: u32 = 100;
pub const MAX_DIMENSION: u32 = 4196;

/// Pacing for a [`Streamer`].
#[derive(Debug, Clone, PartialEq)]
pub struct StreamerConfig {
    /// Upper bound on frames per second; 0 disables pacing.
    pub max_fps: u32,
    /// Sleep when there is nothing to send.
    pub idle_interval: Duration,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            max_fps: 20,
            idle_interval: Duration::from_millis(50),
        }
    }
}

impl StreamerConfig {
    fn frame_interval(&self) -> Option<Duration> {
        (self.max_fps > 0).then(|| Duration::from_secs_f64(1.0 / f64::from(self.max_fps)))
    }
}

/// Combines a [`Camera`] and a [`Detector`] into a `FRAME` source.
pub struct Streamer {
    camera: Mutex<Box<dyn Camera>>,
    detector: Mutex<Box<dyn Detector>>,
    config: StreamerConfig,
    stream: AtomicBool,
    infer: AtomicBool,
    running: AtomicBool,
    last_frame: Mutex<Option<Instant>>,
}

impl Streamer {
    pub fn new(
        camera: Box<dyn Camera>,
        detector: Box<dyn Detector>,
        config: StreamerConfig,
    ) -> Self {
        Self {
            camera: Mutex::new(camera),
            detector: Mutex::new(detector),
            config,
            stream: AtomicBool::new(false),
            infer: AtomicBool::new(false),
            running: AtomicBool::new(true),
            last_frame: Mutex::new(None),
        }
    }

    /// Produce the next outbound frame.
    ///
    /// Returns `Ok(None)` after sleeping `idle_interval` when streaming is
    /// off or the camera has nothing.  Camera faults are logged and treated
    /// the same way; detector faults degrade to a frame without detections.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::TaskFault`] once the streamer is closed, which
    /// ends the session polling it.
    pub fn next_frame(&self) -> Result<Option<Envelope>, TeleopError> {
        if !self.is_running() {
            return Err(TeleopError::TaskFault {
                name: "streamer".to_string(),
                details: "streamer closed".to_string(),
            });
        }
        if !self.is_stream() {
            thread::sleep(self.config.idle_interval);
            return Ok(None);
        }
        self.pace();

        let captured = lock_recover(&self.camera).capture();
        let frame = match captured {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                thread::sleep(self.config.idle_interval);
                return Ok(None);
            }
            Err(e) => {
                warn!(target: STREAMER_TARGET, error = %e, "capture failed");
                thread::sleep(self.config.idle_interval);
                return Ok(None);
            }
        };
        *lock_recover(&self.last_frame) = Some(Instant::now());

        let image = STANDARD.encode(&frame.data);
        let detections = if self.is_infer() {
            let mut detector = lock_recover(&self.detector);
            if detector.is_ready() {
                detector.detect(&frame).unwrap_or_else(|e| {
                    warn!(target: STREAMER_TARGET, error = %e, "detection failed");
                    Vec::new()
                })
            } else {
                Vec::new()
            }
        } else {
            Vec::new()
        };
        debug!(
            target: STREAMER_TARGET,
            bytes = frame.data.len(), detections = detections.len(),
            "frame ready"
        );
        Ok(Some(commands::frame(image, &detections)))
    }

    fn pace(&self) {
        let Some(interval) = self.config.frame_interval() else {
            return;
        };
        let last = *lock_recover(&self.last_frame);
        if let Some(elapsed) = last.map(|t| t.elapsed()) {
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
    }

    /// Turn streaming and inference off.
    pub fn reset(&self) {
        self.stream.store(false, Ordering::SeqCst);
        self.infer.store(false, Ordering::SeqCst);
        debug!(target: STREAMER_TARGET, "streamer reset");
    }

    /// Stop producing frames for good.
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.reset();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_stream(&self, on: bool) {
        self.stream.store(on, Ordering::SeqCst);
        info!(target: STREAMER_TARGET, stream = on, "stream toggled");
    }

    pub fn set_infer(&self, on: bool) {
        self.infer.store(on, Ordering::SeqCst);
        info!(target: STREAMER_TARGET, infer = on, "inference toggled");
    }

    pub fn is_stream(&self) -> bool {
        self.stream.load(Ordering::SeqCst)
    }

    pub fn is_infer(&self) -> bool {
        self.infer.load(Ordering::SeqCst)
    }

    /// Change the capture resolution.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::Config`] unless both sides lie strictly
    /// between [`MIN_DIMENSION`] and [`MAX_DIMENSION`], or whatever the
    /// camera reports if it rejects the size.
    pub fn set_quality(&self, width: u32, height: u32) -> Result<(), TeleopError> {
        let valid = |v: u32| MIN_DIMENSION < v && v < MAX_DIMENSION;
        if !valid(width) || !valid(height) {
            return Err(TeleopError::Config(format!(
                "resolution {width}x{height} outside ({MIN_DIMENSION}, {MAX_DIMENSION})"
            )));
        }
        lock_recover(&self.camera).set_resolution(width, height)
    }

    pub fn quality(&self) -> (u32, u32) {
        lock_recover(&self.camera).resolution()
    }

    /// Load a detector configuration by name.
    pub fn set_config(&self, name: &str) -> Result<(), TeleopError> {
        lock_recover(&self.detector).load_config(name)
    }

    pub fn configs(&self) -> Vec<ModelConfig> {
        lock_recover(&self.detector).configs()
    }

    pub fn config(&self) -> Option<ModelConfig> {
        lock_recover(&self.detector).active_config()
    }

    /// `SYS_INFO` snapshot.
    pub fn sys_info(&self) -> Envelope {
        let (width, height) = self.quality();
        commands::sys_info(self.is_infer(), self.is_stream(), width, height)
    }
}
