//! Holon-RPC peer endpoint - the per-connection state machine
//!
//! One endpoint sits on each side of a WebSocket connection: the broker keeps
//! one per accepted client, a client keeps one per dial. The endpoint
//! correlates outgoing requests with responses through a pending-waiter
//! table, dispatches inbound requests to a handler table, answers
//! heartbeats, and translates handler failures at the wire boundary.
//!
//! The endpoint is transport-agnostic: it emits encoded frames on an
//! outbound channel and is fed inbound frames by whoever owns the socket.

pub mod endpoint;
pub mod handler;

pub use endpoint::*;
pub use handler::*;
