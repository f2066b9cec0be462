//! [`Envelope`] – one structured message exchanged with the operator.
//!
//! An envelope is an ordered JSON object whose mandatory `CMD` field names
//! the opcode.  Envelopes are immutable once built: handlers construct a
//! fresh one per reply with [`Envelope::new`] and the builder-style
//! [`Envelope::with`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::TeleopError;

/// Key of the opcode field carried by every envelope.
pub const CMD_KEY: &str = "CMD";

/// A JSON object with a string `CMD` opcode.
///
/// # Example
///
/// ```
/// use teleop_types::Envelope;
///
/// let env = Envelope::new("MOV").with("R", 0.5).with("THETA", 90);
/// assert_eq!(env.cmd(), "MOV");
/// assert_eq!(env.get_f64("R"), Some(0.5));
///
/// let bytes = env.to_json_bytes().unwrap();
/// assert_eq!(Envelope::from_json_bytes(&bytes).unwrap(), env);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Envelope {
    fields: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope holding only the `CMD` field.
    pub fn new(cmd: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(CMD_KEY.to_string(), Value::String(cmd.into()));
        Self { fields }
    }

    /// Return a copy of `self` with `key` set to `value`.
    ///
    /// The `CMD` field cannot be replaced this way; such calls are ignored.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != CMD_KEY {
            self.fields.insert(key, value.into());
        }
        self
    }

    /// The opcode of this envelope.
    pub fn cmd(&self) -> &str {
        self.fields
            .get(CMD_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Raw access to a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Read a field as a boolean.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Read a numeric field as `f64` (integers are widened).
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    /// Read a numeric field as `i64`.  Floats are truncated toward zero.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        let value = self.get(key)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f.trunc() as i64))
    }

    /// Read a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// All fields, `CMD` included, in insertion order.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Serialize to UTF-8 JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::DecodeFault`] if a field value cannot be
    /// represented as JSON.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, TeleopError> {
        serde_json::to_vec(&self.fields)
            .map_err(|e| TeleopError::DecodeFault(format!("cannot encode {}: {e}", self.cmd())))
    }

    /// Parse UTF-8 JSON bytes into an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::DecodeFault`] when the bytes are not UTF-8,
    /// not JSON, not a JSON object, or lack a string `CMD` field.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, TeleopError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| TeleopError::DecodeFault(format!("body is not UTF-8: {e}")))?;
        let value: Value = serde_json::from_str(text)
            .map_err(|e| TeleopError::DecodeFault(format!("body is not JSON: {e}")))?;
        Self::try_from(value)
    }
}

impl TryFrom<Value> for Envelope {
    type Error = TeleopError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(fields) = value else {
            return Err(TeleopError::DecodeFault(
                "message is not a JSON object".to_string(),
            ));
        };
        match fields.get(CMD_KEY) {
            Some(Value::String(_)) => Ok(Self { fields }),
            Some(_) => Err(TeleopError::DecodeFault(format!(
                "{CMD_KEY} field is not a string"
            ))),
            None => Err(TeleopError::DecodeFault(format!(
                "message has no {CMD_KEY} field"
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Envelope::try_from(value).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({} fields)", self.cmd(), self.fields.len() - 1)
    }
}
