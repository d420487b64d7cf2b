//! The symmetric per-connection endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use holon_protocol::{
    codec, DecodeError, Envelope, RpcFailure, CLIENT_ID_PREFIX, JSONRPC_VERSION, METHOD_HEARTBEAT,
    SERVER_ID_PREFIX,
};

use crate::handler::{Handler, HandlerError, HandlerTable};

/// Outbound frame buffer; beyond this, senders feel socket backpressure.
const OUTBOUND_BUFFER: usize = 64;

/// Which side of the bus this endpoint sits on.
///
/// The role picks the correlation-id namespace for outgoing requests and the
/// internal-error code surfaced for untyped handler failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialing side; allocates `c<N>` ids, accepts only `s`-prefixed
    /// inbound request ids.
    Client,
    /// Broker side of an accepted connection; allocates `s<N>` ids.
    Server,
}

impl Role {
    fn id_prefix(self) -> &'static str {
        match self {
            Role::Client => CLIENT_ID_PREFIX,
            Role::Server => SERVER_ID_PREFIX,
        }
    }

    fn internal_failure(self) -> RpcFailure {
        match self {
            Role::Client => RpcFailure::internal_peer(),
            Role::Server => RpcFailure::internal_broker(),
        }
    }
}

/// Hook splicing an external dispatcher in front of the local handler table.
///
/// The broker installs one per accepted peer; the hook sees every inbound
/// request that survives protocol validation and heartbeat handling, and
/// returns the response envelope to emit (None for notifications).
pub type RequestHook = Arc<dyn Fn(Envelope) -> BoxFuture<'static, Option<Envelope>> + Send + Sync>;

type Waiter = oneshot::Sender<Result<Value, RpcFailure>>;

struct EndpointInner {
    role: Role,
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, Waiter>>,
    handlers: HandlerTable,
    request_hook: RwLock<Option<RequestHook>>,
    outbound_tx: mpsc::Sender<String>,
    closed: AtomicBool,
}

/// One side of a Holon-RPC connection.
///
/// Cheap to clone; all clones share the same pending table and handler
/// registry.
#[derive(Clone)]
pub struct PeerEndpoint {
    inner: Arc<EndpointInner>,
}

impl PeerEndpoint {
    /// Create an endpoint with its own handler table.
    ///
    /// Returns the receiving half of the outbound frame channel; the socket
    /// owner pumps it into the WebSocket sink.
    pub fn new(role: Role) -> (Self, mpsc::Receiver<String>) {
        Self::with_handlers(role, crate::handler::new_handler_table())
    }

    /// Create an endpoint over a shared handler table.
    ///
    /// The client reconnector uses this so registrations survive reconnects.
    pub fn with_handlers(role: Role, handlers: HandlerTable) -> (Self, mpsc::Receiver<String>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let endpoint = Self {
            inner: Arc::new(EndpointInner {
                role,
                next_id: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                handlers,
                request_hook: RwLock::new(None),
                outbound_tx,
                closed: AtomicBool::new(false),
            }),
        };
        (endpoint, outbound_rx)
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Install a local handler. Duplicate registration replaces.
    pub fn register(&self, method: impl Into<String>, handler: Handler) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(method.into(), handler);
    }

    /// Splice an external dispatcher in front of the local handler table.
    pub fn set_request_hook(&self, hook: RequestHook) {
        *self.inner.request_hook.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Invoke a method on the remote side.
    ///
    /// Allocates a fresh correlation id, installs the waiter before the frame
    /// is written, and resolves exactly once: by response, by timeout
    /// (`deadline exceeded`, waiter removed, the far side is not cancelled),
    /// or by disconnect (`unavailable`).
    pub async fn invoke(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcFailure> {
        if self.is_closed() {
            return Err(RpcFailure::unavailable("holon-rpc connection closed"));
        }

        let seq = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}{}", self.inner.role.id_prefix(), seq);
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id.clone(), tx);

        let frame = codec::encode(&Envelope::request(&id, method, params));
        if self.inner.outbound_tx.send(frame).await.is_err() {
            self.lock_pending().remove(&id);
            return Err(RpcFailure::unavailable("holon-rpc connection closed"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // The waiter's sender was dropped without firing: teardown race.
            Ok(Err(_)) => Err(RpcFailure::unavailable("holon-rpc connection closed")),
            Err(_) => {
                self.lock_pending().remove(&id);
                Err(RpcFailure::deadline_exceeded())
            }
        }
    }

    /// Emit an id-less request. Fire-and-forget; the remote never answers.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcFailure> {
        if self.is_closed() {
            return Err(RpcFailure::unavailable("holon-rpc connection closed"));
        }
        let frame = codec::encode(&Envelope::notification(method, params));
        self.inner
            .outbound_tx
            .send(frame)
            .await
            .map_err(|_| RpcFailure::unavailable("holon-rpc connection closed"))
    }

    /// Feed one inbound text frame into the endpoint.
    pub async fn process_text(&self, text: &str) {
        match codec::decode(text) {
            Ok(envelope) => self.process_envelope(envelope).await,
            Err(DecodeError::Parse(e)) => {
                tracing::debug!(error = %e, "dropping unparseable frame");
                self.send_frame(Envelope::error_response(None, RpcFailure::parse_error()))
                    .await;
            }
            Err(DecodeError::NotObject) => {
                self.send_frame(Envelope::error_response(
                    None,
                    RpcFailure::invalid_request("invalid request"),
                ))
                .await;
            }
        }
    }

    /// Feed one inbound binary frame; decoded as UTF-8 text.
    pub async fn process_binary(&self, bytes: &[u8]) {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.process_text(text).await,
            Err(e) => {
                tracing::debug!(error = %e, "dropping non-utf8 binary frame");
                self.send_frame(Envelope::error_response(None, RpcFailure::parse_error()))
                    .await;
            }
        }
    }

    async fn process_envelope(&self, envelope: Envelope) {
        if envelope.is_response() {
            self.resolve_response(envelope);
        } else {
            // Requests run on their own task so a handler that re-enters the
            // bus can never block response demultiplexing on this reader.
            let endpoint = self.clone();
            tokio::spawn(async move { endpoint.dispatch_request(envelope).await });
        }
    }

    fn resolve_response(&self, envelope: Envelope) {
        let Some(id) = envelope.id_str().map(str::to_string) else {
            tracing::trace!("response without a string id, ignoring");
            return;
        };
        let Some(waiter) = self.lock_pending().remove(&id) else {
            // Late reply after timeout, or an id we never issued.
            tracing::trace!(id = %id, "no waiter for response, ignoring");
            return;
        };
        let outcome = match envelope.error {
            Some(error) => Err(error.into()),
            None => Ok(envelope.result.unwrap_or_else(|| Value::Object(Map::new()))),
        };
        let _ = waiter.send(outcome);
    }

    async fn dispatch_request(&self, envelope: Envelope) {
        let reply_id = envelope.id_str().map(|s| Value::String(s.to_string()));
        let should_reply = reply_id.is_some();

        if envelope.jsonrpc != JSONRPC_VERSION || !envelope.is_request() {
            if should_reply {
                self.send_error(reply_id, RpcFailure::invalid_request("invalid request"))
                    .await;
            }
            return;
        }
        let method = envelope.method.clone().unwrap_or_default();

        if method == METHOD_HEARTBEAT {
            if should_reply {
                self.send_result(reply_id, Value::Object(Map::new())).await;
            }
            return;
        }

        // Only the broker originates requests toward a client, so a
        // client-side endpoint requires inbound request ids from the server
        // id space. Enforced on receive, never on send.
        if self.inner.role == Role::Client {
            if let Some(raw_id) = envelope.id.clone().filter(|id| !id.is_null()) {
                let valid = matches!(&raw_id, Value::String(s) if s.starts_with(SERVER_ID_PREFIX));
                if !valid {
                    self.send_frame(Envelope::error_response(
                        Some(raw_id),
                        RpcFailure::invalid_request("server request id must start with 's'"),
                    ))
                    .await;
                    return;
                }
            }
        }

        let hook = self
            .inner
            .request_hook
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(hook) = hook {
            if let Some(response) = hook(envelope).await {
                self.send_frame(response).await;
            }
            return;
        }

        let params = match decode_params(envelope.params) {
            Ok(params) => params,
            Err(failure) => {
                if should_reply {
                    self.send_error(reply_id, failure).await;
                }
                return;
            }
        };

        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&method)
            .cloned();
        let Some(handler) = handler else {
            if should_reply {
                self.send_error(reply_id, RpcFailure::method_not_found(&method))
                    .await;
            }
            return;
        };

        let outcome = handler(params).await;
        if !should_reply {
            // Notification: the handler ran, its return value is discarded.
            return;
        }
        match outcome {
            Ok(result) => self.send_result(reply_id, result).await,
            Err(HandlerError::Rpc(failure)) => self.send_error(reply_id, failure).await,
            Err(HandlerError::Other(error)) => {
                tracing::warn!(method = %method, error = %error, "handler failed");
                self.send_error(reply_id, self.inner.role.internal_failure())
                    .await;
            }
        }
    }

    async fn send_result(&self, id: Option<Value>, result: Value) {
        self.send_frame(Envelope::response(id, result)).await;
    }

    async fn send_error(&self, id: Option<Value>, failure: RpcFailure) {
        self.send_frame(Envelope::error_response(id, failure)).await;
    }

    async fn send_frame(&self, envelope: Envelope) {
        // A send failure means the connection is gone; the disconnect path
        // owns the cleanup.
        let _ = self.inner.outbound_tx.send(codec::encode(&envelope)).await;
    }

    /// Fail every pending waiter with a clone of `failure`.
    pub fn fail_pending(&self, failure: &RpcFailure) {
        let drained: Vec<Waiter> = {
            let mut pending = self.lock_pending();
            pending.drain().map(|(_, waiter)| waiter).collect()
        };
        for waiter in drained {
            let _ = waiter.send(Err(failure.clone()));
        }
    }

    /// Tear the endpoint down: no new invokes succeed and every pending
    /// waiter is failed exactly once. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.fail_pending(&RpcFailure::unavailable("holon-rpc connection closed"));
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of in-flight requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, Waiter>> {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Decode request params: absent and null are an empty object; anything that
/// is not a JSON object is invalid.
pub fn decode_params(params: Option<Value>) -> Result<Map<String, Value>, RpcFailure> {
    match params {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(RpcFailure::invalid_params("invalid params")),
    }
}
