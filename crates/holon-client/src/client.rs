//! The connect/reconnect supervisor around a client-side endpoint.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use holon_endpoint::{Handler, HandlerTable, PeerEndpoint, Role};
use holon_protocol::{
    RpcFailure, METHOD_HEARTBEAT, METHOD_REGISTER, METHOD_UNREGISTER, WS_SUBPROTOCOL,
};

use crate::config::{backoff_delay, ClientConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct ClientInner {
    config: ClientConfig,
    handlers: HandlerTable,
    endpoint: tokio::sync::RwLock<Option<PeerEndpoint>>,
    connected: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    heartbeat_count: AtomicU64,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// A peer client. Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct HolonClient {
    inner: Arc<ClientInner>,
}

impl HolonClient {
    pub fn new(config: ClientConfig) -> Self {
        let (connected, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                config,
                handlers: holon_endpoint::new_handler_table(),
                endpoint: tokio::sync::RwLock::new(None),
                connected,
                shutdown,
                closed: AtomicBool::new(false),
                heartbeat_count: AtomicU64::new(0),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Install a handler for inbound requests and notifications.
    ///
    /// Registrations live in a table shared across reconnects; duplicate
    /// registration replaces.
    pub fn register(&self, method: impl Into<String>, handler: Handler) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(method.into(), handler);
    }

    /// Dial the broker and start the reconnect supervisor.
    ///
    /// Any previous socket is closed first. Fails when the dial or the
    /// subprotocol negotiation fails; later disconnects are handled by the
    /// supervisor, not surfaced here.
    pub async fn connect(&self) -> Result<(), anyhow::Error> {
        anyhow::ensure!(!self.is_closed(), "client is closed");

        if let Some(previous) = self.take_supervisor() {
            previous.abort();
        }
        if let Some(endpoint) = self.inner.endpoint.write().await.take() {
            endpoint.close();
        }
        let _ = self.inner.connected.send(false);

        let ws = self.dial().await?;
        let client = self.clone();
        let handle = tokio::spawn(async move { client.supervise(ws).await });
        *self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Invoke a method through the broker.
    ///
    /// Waits for the connection gate (bounded by `connect_timeout`) before
    /// sending, then applies `request_timeout` to the call itself.
    pub async fn invoke(&self, method: &str, params: Value) -> Result<Value, RpcFailure> {
        self.await_connected(self.inner.config.connect_timeout)
            .await?;
        let endpoint = self
            .current_endpoint()
            .await
            .ok_or_else(|| RpcFailure::unavailable("holon-rpc connection closed"))?;
        endpoint
            .invoke(method, params, self.inner.config.request_timeout)
            .await
    }

    /// Emit an id-less request; the broker never answers it.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcFailure> {
        self.await_connected(self.inner.config.connect_timeout)
            .await?;
        let endpoint = self
            .current_endpoint()
            .await
            .ok_or_else(|| RpcFailure::unavailable("holon-rpc connection closed"))?;
        endpoint.notify(method, params).await
    }

    /// Claim a holon name for this peer.
    pub async fn register_name(&self, name: &str) -> Result<Value, RpcFailure> {
        self.invoke(METHOD_REGISTER, json!({ "name": name })).await
    }

    /// Drop this peer's holon name.
    pub async fn unregister_name(&self) -> Result<Value, RpcFailure> {
        self.invoke(METHOD_UNREGISTER, json!({})).await
    }

    /// Block until the connection gate opens, bounded by `timeout`.
    pub async fn await_connected(&self, timeout: Duration) -> Result<(), RpcFailure> {
        if self.is_closed() {
            return Err(RpcFailure::unavailable("client is closed"));
        }
        let mut connected = self.inner.connected.subscribe();
        let gate = async move {
            loop {
                if *connected.borrow_and_update() {
                    return Ok(());
                }
                if connected.changed().await.is_err() {
                    return Err(RpcFailure::unavailable("client is closed"));
                }
            }
        };
        tokio::time::timeout(timeout, gate)
            .await
            .map_err(|_| RpcFailure::deadline_exceeded())?
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Heartbeats answered since this client was created.
    pub fn heartbeat_count(&self) -> u64 {
        self.inner.heartbeat_count.load(Ordering::SeqCst)
    }

    /// Close for good: stop timers and reconnects, close the socket with a
    /// normal-closure frame, fail anything still pending. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        let _ = self.inner.connected.send(false);
        if let Some(endpoint) = self.current_endpoint().await {
            endpoint.close();
        }
        tracing::info!("holon-rpc client closed");
    }

    async fn current_endpoint(&self) -> Option<PeerEndpoint> {
        self.inner.endpoint.read().await.clone()
    }

    fn take_supervisor(&self) -> Option<JoinHandle<()>> {
        self.inner
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Open a WebSocket asking for the bus subprotocol; reject the
    /// connection when the broker negotiates anything else.
    async fn dial(&self) -> Result<WsStream, anyhow::Error> {
        let config = &self.inner.config;
        let mut request = config.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(WS_SUBPROTOCOL));

        let (mut ws, response) =
            tokio::time::timeout(config.connect_timeout, connect_async(request))
                .await
                .map_err(|_| anyhow::anyhow!("connect timed out after {:?}", config.connect_timeout))??;

        let negotiated = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok());
        if negotiated != Some(WS_SUBPROTOCOL) {
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Protocol,
                    reason: "subprotocol holon-rpc required".into(),
                }))
                .await;
            anyhow::bail!(
                "broker negotiated subprotocol {:?}, expected {:?}",
                negotiated,
                WS_SUBPROTOCOL
            );
        }
        Ok(ws)
    }

    /// Run connections until the client is closed, redialing with backoff
    /// between them.
    async fn supervise(self, first: WsStream) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut attempt: u32 = 0;
        let mut next = Some(first);

        loop {
            let ws = match next.take() {
                Some(ws) => ws,
                None => {
                    let delay = backoff_delay(&self.inner.config, attempt, rand::random::<f64>());
                    attempt = attempt.saturating_add(1);
                    tracing::info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling reconnect"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                    if self.is_closed() {
                        break;
                    }
                    match self.dial().await {
                        Ok(ws) => ws,
                        Err(e) => {
                            tracing::warn!(error = %e, "reconnect attempt failed");
                            continue;
                        }
                    }
                }
            };

            attempt = 0;
            self.run_connection(ws).await;
            if self.is_closed() {
                break;
            }
        }
    }

    /// Drive one connection until disconnect or close.
    async fn run_connection(&self, ws: WsStream) {
        // Subscribe before checking so a concurrent close is either seen
        // here or wakes the select below.
        let mut shutdown = self.inner.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }

        let (endpoint, mut outbound_rx) =
            PeerEndpoint::with_handlers(Role::Client, self.inner.handlers.clone());
        *self.inner.endpoint.write().await = Some(endpoint.clone());
        let _ = self.inner.connected.send(true);
        tracing::info!(url = %self.inner.config.url, "connected");

        let (mut sink, mut stream) = ws.split();
        let (close_tx, mut close_rx) = mpsc::channel::<CloseFrame<'static>>(1);
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => match frame {
                        Some(text) => {
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    frame = close_rx.recv() => {
                        if let Some(frame) = frame {
                            let _ = sink.send(Message::Close(Some(frame))).await;
                        }
                        break;
                    }
                }
            }
        });

        let heartbeat = self.spawn_heartbeat(endpoint.clone());
        let mut hb_failed = heartbeat.failed.subscribe();

        let close_frame: Option<CloseFrame<'static>> = loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => endpoint.process_text(&text).await,
                    Some(Ok(Message::Binary(bytes))) => endpoint.process_binary(&bytes).await,
                    Some(Ok(Message::Close(_))) | None => break None,
                    // Ping/pong are answered by the transport layer.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "socket error");
                        break None;
                    }
                },
                _ = hb_failed.changed() => break Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: "going away".into(),
                }),
                _ = shutdown.changed() => break Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                }),
            }
        };

        heartbeat.task.abort();
        match close_frame {
            Some(frame) => {
                let _ = close_tx.send(frame).await;
                // Let the writer flush the close frame before teardown.
                let _ = tokio::time::timeout(Duration::from_millis(200), writer).await;
            }
            None => writer.abort(),
        }

        let _ = self.inner.connected.send(false);
        *self.inner.endpoint.write().await = None;
        endpoint.close();
        tracing::info!("disconnected");
    }

    fn spawn_heartbeat(&self, endpoint: PeerEndpoint) -> HeartbeatHandle {
        let (failed, _) = watch::channel(false);
        let failed_tx = failed.clone();
        let interval = self.inner.config.heartbeat_interval;
        let timeout = self.inner.config.heartbeat_timeout;
        let counter = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of an interval is immediate; skip it so the
            // first heartbeat fires one full interval after connect.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match endpoint.invoke(METHOD_HEARTBEAT, json!({}), timeout).await {
                    Ok(_) => {
                        counter
                            .inner
                            .heartbeat_count
                            .fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "heartbeat failed, closing socket");
                        let _ = failed_tx.send(true);
                        break;
                    }
                }
            }
        });
        HeartbeatHandle { task, failed }
    }
}

struct HeartbeatHandle {
    task: JoinHandle<()>,
    failed: watch::Sender<bool>,
}
