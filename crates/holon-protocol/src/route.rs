//! Routing grammar: dispatch routes and param-embedded hints.
//!
//! A method name `<name>.<method>` addresses a holon by name; `*.<method>`
//! fans out to every connected peer. The `_peer` and `_routing` keys ride
//! inside the params object so an unmodified handler registry can serve the
//! same calls locally and routed; they are stripped exactly once at the
//! routing boundary.

use serde_json::{Map, Value};

use crate::error::RpcFailure;

/// Params key naming an explicit target peer id.
pub const PEER_HINT_KEY: &str = "_peer";

/// Params key selecting a broadcast mode.
pub const ROUTING_HINT_KEY: &str = "_routing";

/// Method prefix requesting fan-out to all connected peers.
pub const FANOUT_PREFIX: &str = "*.";

/// How the outcome of a call is shared beyond the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    /// Reply to the caller only.
    #[default]
    Default,
    /// After the direct reply, notify non-participants of the result.
    BroadcastResponse,
    /// After fan-out aggregation, notify each non-source peer per entry.
    FullBroadcast,
}

impl RoutingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" => Some(Self::Default),
            "broadcast-response" => Some(Self::BroadcastResponse),
            "full-broadcast" => Some(Self::FullBroadcast),
            _ => None,
        }
    }
}

/// Hints extracted from one request before dispatch.
#[derive(Debug, Clone)]
pub struct RouteHints {
    /// Method with any `*.` prefix stripped; this is what handlers see.
    pub method: String,
    /// Explicit target from `_peer`.
    pub target_peer: Option<String>,
    /// Broadcast mode from `_routing`.
    pub mode: RoutingMode,
    /// Leading `*.` was present.
    pub fan_out: bool,
}

/// Strip `_peer`/`_routing` from `params` and the `*.` prefix from `method`.
///
/// Fails with invalid-params when a hint is present but malformed, or when
/// `full-broadcast` is requested without a fan-out method.
pub fn extract_route_hints(
    method: &str,
    params: &mut Map<String, Value>,
) -> Result<RouteHints, RpcFailure> {
    let mode = match params.remove(ROUTING_HINT_KEY) {
        None => RoutingMode::Default,
        Some(Value::String(s)) => RoutingMode::parse(&s)
            .ok_or_else(|| RpcFailure::invalid_params(format!("unknown _routing mode {:?}", s)))?,
        Some(_) => return Err(RpcFailure::invalid_params("_routing must be a string")),
    };

    let target_peer = match params.remove(PEER_HINT_KEY) {
        None => None,
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(_) => return Err(RpcFailure::invalid_params("_peer must be a non-empty string")),
    };

    let (method, fan_out) = match method.strip_prefix(FANOUT_PREFIX) {
        Some(rest) => (rest.to_string(), true),
        None => (method.to_string(), false),
    };

    if mode == RoutingMode::FullBroadcast && !fan_out {
        return Err(RpcFailure::invalid_params(
            "full-broadcast requires a fan-out method",
        ));
    }

    Ok(RouteHints { method, target_peer, mode, fan_out })
}

/// Parse `<name>.<method>` on the first dot.
///
/// Both sides must be non-empty after trimming; anything else is not a
/// dispatch route.
pub fn parse_dispatch_route(method: &str) -> Option<(String, String)> {
    let (name, rest) = method.split_once('.')?;
    let name = name.trim();
    let rest = rest.trim();
    if name.is_empty() || rest.is_empty() {
        return None;
    }
    Some((name.to_string(), rest.to_string()))
}
