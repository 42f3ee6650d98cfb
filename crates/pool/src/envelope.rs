use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire-format task envelope sent from the pool to a worker unit.
///
/// Envelopes are encoded as compact JSON text so they can cross a thread
/// channel or a process pipe unchanged. Compact JSON never contains a raw
/// newline, which lets process units frame one envelope per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    /// Name of the handler the unit should run.
    pub function_name: String,

    /// Handler input.
    #[serde(default)]
    pub payload: Value,
}

impl TaskEnvelope {
    pub fn new(function_name: impl Into<String>, payload: Value) -> Self {
        Self {
            function_name: function_name.into(),
            payload,
        }
    }

    /// Serialize this envelope to UTF-8 JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize an envelope from UTF-8 JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Wire-format result envelope sent back by a worker unit.
///
/// Encodes as `{"ok": true, "value": ..}` or `{"ok": false, "error": ".."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultEnvelope {
    pub fn success(value: Value) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(error.into()),
        }
    }

    /// Convert into a plain `Result`. A success without a value yields `null`.
    pub fn into_result(self) -> Result<Value, String> {
        if self.ok {
            Ok(self.value.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| "unit reported an unspecified error".to_string()))
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl From<Result<Value, String>> for ResultEnvelope {
    fn from(result: Result<Value, String>) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(error) => Self::failure(error),
        }
    }
}
