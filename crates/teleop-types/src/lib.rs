//! `teleop-types` – shared vocabulary for the teleop controller.
//!
//! Every other crate in the workspace speaks in these types:
//!
//! - [`Envelope`] – one JSON command/telemetry message carrying a `CMD`
//!   opcode.
//! - [`commands`] – opcode constants and builders for every outbound
//!   message the controller emits.
//! - [`TeleopError`] – the fault taxonomy shared by the transport, the
//!   session dispatcher, the scheduler and the hardware layer.

pub mod commands;
pub mod envelope;

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use commands::Control;
pub use envelope::{CMD_KEY, Envelope};

/// Which side of a session's bounded queues overflowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Peer → dispatcher (commands waiting to be handled).
    Inbound,
    /// Dispatcher → peer (replies and routine output waiting to be sent).
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// A single object-detection result attached to a streamed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Bounding box as `[x_min, y_min, x_max, y_max]` in pixels.
    pub bbox: [f32; 4],
    /// Class label reported by the detector.
    pub class: String,
    /// Confidence in `[0, 1]`.
    pub score: f32,
}

/// Description of one detector model configuration offered to the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ModelConfig {
    /// Configuration name; used as the map key on the wire.
    #[serde(skip)]
    pub name: String,
    /// Network input size in pixels (square).
    pub size: u32,
    /// Model family, e.g. `"yolov4"`.
    pub model_type: String,
    /// Whether this is the reduced ("tiny") variant.
    pub tiny: bool,
    /// Class labels in index order.
    pub classes: Vec<String>,
}

/// Fault taxonomy for the whole controller.
///
/// Only faults that break the integrity of the wire protocol end a session;
/// see [`TeleopError::is_session_fatal`].
#[derive(Error, Debug)]
pub enum TeleopError {
    #[error("Connection Fault ({context}): {source}")]
    ConnectionFault {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Decode Fault: {0}")]
    DecodeFault(String),

    #[error("Handler Fault on {cmd}: {details}")]
    HandlerFault { cmd: String, details: String },

    #[error("Overflow Fault: {direction} queue full")]
    OverflowFault { direction: Direction },

    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Task Fault in {name}: {details}")]
    TaskFault { name: String, details: String },

    #[error("Configuration Error: {0}")]
    Config(String),
}

impl TeleopError {
    /// Build a [`TeleopError::ConnectionFault`] from an I/O error.
    pub fn connection(context: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFault {
            context: context.into(),
            source,
        }
    }

    /// Build a [`TeleopError::ConnectionFault`] for a peer that closed the
    /// stream (a zero-byte read or write).
    pub fn peer_closed(context: impl Into<String>) -> Self {
        Self::connection(
            context,
            io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection"),
        )
    }

    /// Build a [`TeleopError::HandlerFault`].
    pub fn handler(cmd: impl Into<String>, details: impl Into<String>) -> Self {
        Self::HandlerFault {
            cmd: cmd.into(),
            details: details.into(),
        }
    }

    /// Whether this fault must terminate the session it occurred in.
    ///
    /// Connection faults and outbound overflow (a backlogged peer is assumed
    /// dead) are fatal; malformed messages, failing handlers and inbound
    /// overflow only drop the affected message.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            TeleopError::ConnectionFault { .. } | TeleopError::TaskFault { .. } => true,
            TeleopError::OverflowFault { direction } => *direction == Direction::Outbound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_and_outbound_overflow_are_fatal() {
        assert!(TeleopError::peer_closed("receive header").is_session_fatal());
        assert!(
            TeleopError::OverflowFault {
                direction: Direction::Outbound
            }
            .is_session_fatal()
        );
    }

    #[test]
    fn decode_handler_and_inbound_overflow_are_not_fatal() {
        assert!(!TeleopError::DecodeFault("bad json".into()).is_session_fatal());
        assert!(!TeleopError::handler("MOV", "boom").is_session_fatal());
        assert!(
            !TeleopError::OverflowFault {
                direction: Direction::Inbound
            }
            .is_session_fatal()
        );
    }

    #[test]
    fn error_display_names_context() {
        let err = TeleopError::peer_closed("receive body");
        let text = err.to_string();
        assert!(text.contains("Connection Fault"));
        assert!(text.contains("receive body"));

        let err = TeleopError::HardwareFault {
            component: "pwm_angle".to_string(),
            details: "pin released".to_string(),
        };
        assert!(err.to_string().contains("pwm_angle"));
    }

    #[test]
    fn model_config_serializes_with_wire_keys() {
        let cfg = ModelConfig {
            name: "yolov4-416".to_string(),
            size: 416,
            model_type: "yolov4".to_string(),
            tiny: false,
            classes: vec!["person".to_string()],
        };
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["SIZE"], 416);
        assert_eq!(json["MODEL_TYPE"], "yolov4");
        assert_eq!(json["TINY"], false);
        assert!(json.get("NAME").is_none());
    }
}
