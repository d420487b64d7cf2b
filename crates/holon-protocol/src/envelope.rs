//! JSON-RPC 2.0 envelope, one per WebSocket frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::JSONRPC_VERSION;
use crate::error::ErrorObject;

/// Top-level JSON-RPC 2.0 message envelope.
///
/// A request carries `method` (and an `id` unless it is a notification); a
/// response carries exactly one of `result` or `error` plus the originating
/// `id`. Fields are order-insensitive on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Envelope {
    /// Request expecting a response under `id`.
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(Value::String(id.into())),
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Id-less request; the receiver must not answer it.
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Successful response. The result is normalized to stay object-shaped.
    pub fn response(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.unwrap_or(Value::Null)),
            method: None,
            params: None,
            result: Some(normalize_result(result)),
            error: None,
        }
    }

    /// Error response. A `None` id serializes as an explicit `null`.
    pub fn error_response(id: Option<Value>, error: impl Into<ErrorObject>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.unwrap_or(Value::Null)),
            method: None,
            params: None,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Request-shaped: carries a method.
    pub fn is_request(&self) -> bool {
        self.method.as_deref().map(|m| !m.is_empty()).unwrap_or(false)
    }

    /// Response-shaped: carries a result or an error.
    pub fn is_response(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }

    /// Notification: request-shaped with no id (or an explicit null id).
    pub fn is_notification(&self) -> bool {
        self.is_request() && self.id_str().is_none()
    }

    /// The correlation id, when it is a string.
    pub fn id_str(&self) -> Option<&str> {
        match &self.id {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Keep the downstream contract object-shaped: a non-object result is
/// wrapped as `{"value": <raw>}`.
pub fn normalize_result(result: Value) -> Value {
    if result.is_object() {
        result
    } else {
        serde_json::json!({ "value": result })
    }
}
