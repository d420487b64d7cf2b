//! Error codes and the typed RPC failure carried across the wire.
//!
//! Codes mix the JSON-RPC 2.0 standard range with the small set of domain
//! codes the bus uses for dispatch and transport failures. A failure raised
//! by a handler as [`RpcFailure`] crosses the wire verbatim; anything else is
//! translated to a generic internal error at the endpoint boundary.

use serde::{Deserialize, Serialize};

/// Malformed JSON on the wire.
pub const PARSE_ERROR: i64 = -32700;
/// Envelope is not a request the receiver can act on.
pub const INVALID_REQUEST: i64 = -32600;
/// No handler registered for the method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Params are missing, malformed, or fail a built-in's validation.
pub const INVALID_PARAMS: i64 = -32602;
/// Broker-side internal failure.
pub const INTERNAL_ERROR: i64 = -32603;
/// Peer-handler internal failure.
pub const INTERNAL: i64 = 13;
/// An invoke outlived its timeout.
pub const DEADLINE_EXCEEDED: i64 = 4;
/// Target holon or peer is unknown, or no peers are connected.
pub const NOT_FOUND: i64 = 5;
/// The connection closed while a request was in flight.
pub const UNAVAILABLE: i64 = 14;

/// JSON-RPC error object embedded in a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A typed Holon-RPC failure.
///
/// Carries the same three fields as the wire-level error object so a handler
/// can raise it and have the caller observe `code`/`message`/`data`
/// unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcFailure {
    pub code: i64,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl RpcFailure {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "parse error")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method {:?} not found", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(DEADLINE_EXCEEDED, "deadline exceeded")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(NOT_FOUND, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(UNAVAILABLE, message)
    }

    /// Generic internal error with the broker-side code.
    pub fn internal_broker() -> Self {
        Self::new(INTERNAL_ERROR, "internal error")
    }

    /// Generic internal error with the peer-handler code.
    pub fn internal_peer() -> Self {
        Self::new(INTERNAL, "internal error")
    }
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc failure {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcFailure {}

impl From<ErrorObject> for RpcFailure {
    fn from(e: ErrorObject) -> Self {
        Self { code: e.code, message: e.message, data: e.data }
    }
}

impl From<RpcFailure> for ErrorObject {
    fn from(e: RpcFailure) -> Self {
        Self { code: e.code, message: e.message, data: e.data }
    }
}
