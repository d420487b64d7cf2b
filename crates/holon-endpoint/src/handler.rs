//! Handler table types shared by broker and client endpoints.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

use holon_protocol::RpcFailure;

/// What a handler can fail with.
///
/// A typed [`RpcFailure`] crosses the wire verbatim; any other error becomes
/// a generic internal error so handler implementation details never leak to
/// the remote side.
#[derive(Debug)]
pub enum HandlerError {
    Rpc(RpcFailure),
    Other(anyhow::Error),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "{}", e),
            Self::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<RpcFailure> for HandlerError {
    fn from(e: RpcFailure) -> Self {
        Self::Rpc(e)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        Self::Other(e)
    }
}

/// Future returned by a handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

/// A registered method handler.
///
/// Receives the decoded params object (routing hints already stripped) and
/// returns the result value; non-object results are normalized before they
/// reach the wire.
pub type Handler = Arc<dyn Fn(Map<String, Value>) -> HandlerFuture + Send + Sync>;

/// Method-name keyed handler registry, shared across reconnects on the
/// client side.
pub type HandlerTable = Arc<RwLock<HashMap<String, Handler>>>;

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(move |params| Box::pin(f(params)))
}

/// Fresh, empty handler table.
pub fn new_handler_table() -> HandlerTable {
    Arc::new(RwLock::new(HashMap::new()))
}
