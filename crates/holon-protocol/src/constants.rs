//! Protocol-wide constants.

/// JSON-RPC version carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// WebSocket subprotocol both sides must negotiate.
pub const WS_SUBPROTOCOL: &str = "holon-rpc";

/// Default broker path for WebSocket upgrades.
pub const DEFAULT_RPC_PATH: &str = "/rpc";

/// Reserved method: liveness probe, answered at the endpoint layer.
pub const METHOD_HEARTBEAT: &str = "rpc.heartbeat";

/// Reserved method: associate the calling peer with a holon name.
pub const METHOD_REGISTER: &str = "rpc.register";

/// Reserved method: drop the calling peer's holon name.
pub const METHOD_UNREGISTER: &str = "rpc.unregister";

/// Correlation-id prefix for client-originated requests.
pub const CLIENT_ID_PREFIX: &str = "c";

/// Correlation-id prefix for broker-originated (server-to-peer) requests.
pub const SERVER_ID_PREFIX: &str = "s";
