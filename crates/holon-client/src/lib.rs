//! Holon-RPC peer client - one long-lived connection with supervision
//!
//! Wraps a peer endpoint in a connect/reconnect supervisor: dial with
//! subprotocol negotiation, a heartbeat timer that closes dead sockets,
//! exponential-backoff reconnect with jitter, and a connection gate that
//! `invoke` waits on. Registered handlers survive reconnects.

pub mod client;
pub mod config;

pub use client::*;
pub use config::*;
