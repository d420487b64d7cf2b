//! Holon-RPC broker - accepts peers, keeps the name book, routes requests
//!
//! A single broker process owns the WebSocket listen path, assigns peer ids,
//! executes the reserved `rpc.*` methods, and routes application methods:
//! directed by holon name or explicit peer, fanned out to every connected
//! peer, optionally broadcasting outcomes to non-participants.

pub mod broker;
pub mod dispatch;
pub mod registry;

pub use broker::*;
pub use registry::*;
