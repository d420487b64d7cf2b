//! Text-frame codec: one JSON envelope per WebSocket message.
//!
//! Decoding distinguishes unparseable bytes (answered with `-32700`, id null)
//! from parseable JSON that is not an object (`-32600`, id null). Fields are
//! extracted leniently so a malformed `method` or `error` member degrades the
//! envelope shape instead of failing the whole frame.

use serde_json::Value;

use crate::constants::JSONRPC_VERSION;
use crate::envelope::Envelope;
use crate::error::ErrorObject;

/// Why an inbound frame could not become an envelope.
#[derive(Debug)]
pub enum DecodeError {
    /// The payload was not valid JSON (or not valid UTF-8).
    Parse(String),
    /// The payload parsed, but the top-level value is not an object.
    NotObject,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "frame parse error: {}", e),
            Self::NotObject => write!(f, "frame is not a JSON object"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode one text frame into an envelope.
pub fn decode(text: &str) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Parse(e.to_string()))?;
    let obj = match value {
        Value::Object(obj) => obj,
        _ => return Err(DecodeError::NotObject),
    };

    let error = obj.get("error").and_then(|v| {
        let e = v.as_object()?;
        Some(ErrorObject {
            code: e.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: e
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            data: e.get("data").cloned(),
        })
    });

    Ok(Envelope {
        jsonrpc: obj
            .get("jsonrpc")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        id: obj.get("id").cloned(),
        method: obj
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string),
        params: obj.get("params").cloned(),
        result: obj.get("result").cloned(),
        error,
    })
}

/// Decode a binary frame as UTF-8 text.
pub fn decode_binary(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| DecodeError::Parse(format!("invalid utf-8: {}", e)))?;
    decode(text)
}

/// Encode an envelope into one text frame.
pub fn encode(envelope: &Envelope) -> String {
    // An envelope is plain data over serde_json values; serialization cannot fail.
    serde_json::to_string(envelope).unwrap_or_else(|_| {
        format!(
            "{{\"jsonrpc\":\"{}\",\"id\":null,\"error\":{{\"code\":-32603,\"message\":\"internal error\"}}}}",
            JSONRPC_VERSION
        )
    })
}
