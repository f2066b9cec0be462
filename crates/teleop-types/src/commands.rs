//! Opcode constants and outbound message builders.
//!
//! | CMD | Direction | Fields |
//! |---|---|---|
//! | `LOGIN` | client → server | `PWD` |
//! | `LOG_INFO` | server → client | `VERIFY` |
//! | `LOGOUT` / `EXIT` / `SHUTDOWN` | client → server | – |
//! | `SYS_LOGOUT` / `SYS_EXIT` / `SYS_SHUTDOWN` | server → client | – |
//! | `RESET` | client → server | – |
//! | `GET_SYS_INFO` / `SYS_INFO` | both | `IS_INFER`, `IS_STREAM`, `CAMERA_WIDTH`, `CAMERA_HEIGHT` |
//! | `SET_STREAM` | client → server | `STREAM` |
//! | `SET_INFER` | client → server | `INFER` |
//! | `SET_QUALITY` / `SET_RESOLUTION` | client → server | `WIDTH`, `HEIGHT` |
//! | `SET_CONFIG` | client → server | `CONFIG` |
//! | `GET_CONFIG` / `CONFIG` | both | `CONFIG_NAME`, `SIZE`, `MODEL_TYPE`, `TINY`, `CLASSES` |
//! | `GET_CONFIGS` / `CONFIGS` | both | `CONFIGS` map |
//! | `MOV` | client → server | `R`, `THETA` |
//! | `FRAME` | server → client | `IMAGE`, `BBOX`, `CLASS` |

use serde_json::{Map, Value};

use crate::{Detection, Envelope, ModelConfig};

pub const LOGIN: &str = "LOGIN";
pub const LOG_INFO: &str = "LOG_INFO";
pub const LOGOUT: &str = "LOGOUT";
pub const EXIT: &str = "EXIT";
pub const SHUTDOWN: &str = "SHUTDOWN";
pub const SYS_LOGOUT: &str = "SYS_LOGOUT";
pub const SYS_EXIT: &str = "SYS_EXIT";
pub const SYS_SHUTDOWN: &str = "SYS_SHUTDOWN";
pub const RESET: &str = "RESET";
pub const GET_SYS_INFO: &str = "GET_SYS_INFO";
pub const SYS_INFO: &str = "SYS_INFO";
pub const SET_STREAM: &str = "SET_STREAM";
pub const SET_INFER: &str = "SET_INFER";
pub const SET_QUALITY: &str = "SET_QUALITY";
pub const SET_RESOLUTION: &str = "SET_RESOLUTION";
pub const SET_CONFIG: &str = "SET_CONFIG";
pub const GET_CONFIG: &str = "GET_CONFIG";
pub const CONFIG: &str = "CONFIG";
pub const GET_CONFIGS: &str = "GET_CONFIGS";
pub const CONFIGS: &str = "CONFIGS";
pub const MOV: &str = "MOV";
pub const FRAME: &str = "FRAME";

/// Session-control opcodes.  Receiving one ends the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// End this session; keep serving.
    Logout,
    /// End this session and stop the listener.
    Exit,
    /// End this session, stop the listener and request a host shutdown.
    Shutdown,
}

impl Control {
    /// Classify an opcode; `None` for ordinary commands.
    pub fn from_cmd(cmd: &str) -> Option<Self> {
        match cmd {
            LOGOUT => Some(Control::Logout),
            EXIT => Some(Control::Exit),
            SHUTDOWN => Some(Control::Shutdown),
            _ => None,
        }
    }

    /// The acknowledgement sent back before the session closes.
    pub fn ack(self) -> Envelope {
        match self {
            Control::Logout => Envelope::new(SYS_LOGOUT),
            Control::Exit => Envelope::new(SYS_EXIT),
            Control::Shutdown => Envelope::new(SYS_SHUTDOWN),
        }
    }
}

/// `LOG_INFO` reply to a login attempt.
pub fn login_info(verified: bool) -> Envelope {
    Envelope::new(LOG_INFO).with("VERIFY", verified)
}

/// `SYS_INFO` reply describing streamer state and camera resolution.
pub fn sys_info(is_infer: bool, is_stream: bool, width: u32, height: u32) -> Envelope {
    Envelope::new(SYS_INFO)
        .with("IS_INFER", is_infer)
        .with("IS_STREAM", is_stream)
        .with("CAMERA_WIDTH", width)
        .with("CAMERA_HEIGHT", height)
}

/// `FRAME` telemetry: a base64 JPEG plus any detections.
pub fn frame(image_b64: String, detections: &[Detection]) -> Envelope {
    let boxes: Vec<Value> = detections
        .iter()
        .map(|d| Value::from(d.bbox.iter().map(|v| f64::from(*v)).collect::<Vec<_>>()))
        .collect();
    let classes: Vec<Value> = detections
        .iter()
        .map(|d| Value::from(d.class.clone()))
        .collect();
    Envelope::new(FRAME)
        .with("IMAGE", image_b64)
        .with("BBOX", boxes)
        .with("CLASS", classes)
}

/// `CONFIG` reply for the active detector configuration; every field is
/// null/empty when no model is loaded.
pub fn config(active: Option<&ModelConfig>) -> Envelope {
    match active {
        Some(cfg) => Envelope::new(CONFIG)
            .with("CONFIG_NAME", cfg.name.clone())
            .with("SIZE", cfg.size)
            .with("MODEL_TYPE", cfg.model_type.clone())
            .with("TINY", cfg.tiny)
            .with("CLASSES", cfg.classes.clone()),
        None => Envelope::new(CONFIG)
            .with("CONFIG_NAME", Value::Null)
            .with("SIZE", 0)
            .with("MODEL_TYPE", Value::Null)
            .with("TINY", false)
            .with("CLASSES", Vec::<Value>::new()),
    }
}

/// `CONFIGS` reply keyed by configuration name.
pub fn configs(available: &[ModelConfig]) -> Envelope {
    let mut map = Map::new();
    for cfg in available {
        // ModelConfig only holds plain data, so this cannot fail.
        if let Ok(value) = serde_json::to_value(cfg) {
            map.insert(cfg.name.clone(), value);
        }
    }
    Envelope::new(CONFIGS).with("CONFIGS", Value::Object(map))
}
