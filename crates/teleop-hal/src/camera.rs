//! Generic `Camera` trait and supporting types for image-capture hardware.

use teleop_types::TeleopError;

/// An encoded image frame returned by a camera driver.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// JPEG-encoded image bytes.
    pub data: Vec<u8>,
}

/// A camera or image-capture device.
///
/// The streamer pulls from it on its own thread, so implementations only
/// need to be `Send`.
pub trait Camera: Send {
    /// Stable identifier for this camera, e.g. `"front_rgb"`.
    fn id(&self) -> &str;

    /// Capture the next frame, or `None` if no frame is ready yet.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::HardwareFault`] if the device is gone.
    fn capture(&mut self) -> Result<Option<CameraFrame>, TeleopError>;

    /// Current capture resolution as `(width, height)`.
    fn resolution(&self) -> (u32, u32);

    /// Change the capture resolution.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::HardwareFault`] if the device rejects it.
    fn set_resolution(&mut self, width: u32, height: u32) -> Result<(), TeleopError>;
}
