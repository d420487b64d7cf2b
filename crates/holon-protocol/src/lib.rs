//! Holon-RPC protocol - envelope model and routing grammar
//!
//! Defines the JSON-RPC 2.0 envelope carried one-per-WebSocket-frame by the
//! Holon-RPC bus, the text-frame codec, the error-code table shared by broker
//! and peers, and the parsing of routing sigils (`<name>.<method>`, `*.`,
//! `_peer`, `_routing`).

pub mod codec;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod route;

pub use codec::*;
pub use constants::*;
pub use envelope::*;
pub use error::*;
pub use route::*;
