//! `Detector` trait for object-detection engines, local or remote.

use teleop_types::{Detection, ModelConfig, TeleopError};

use crate::camera::CameraFrame;

/// An object-detection engine with a set of selectable model
/// configurations.
pub trait Detector: Send {
    /// Every configuration this engine can load.
    fn configs(&self) -> Vec<ModelConfig>;

    /// The configuration currently loaded, if any.
    fn active_config(&self) -> Option<ModelConfig>;

    /// Load the configuration called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::HardwareFault`] for an unknown name or a model
    /// that fails to load.
    fn load_config(&mut self, name: &str) -> Result<(), TeleopError>;

    /// Whether a model is loaded and [`Detector::detect`] can be called.
    fn is_ready(&self) -> bool;

    /// Run detection on one frame.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::HardwareFault`] when not ready or when
    /// inference fails.
    fn detect(&mut self, frame: &CameraFrame) -> Result<Vec<Detection>, TeleopError>;
}
