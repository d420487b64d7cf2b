//! Broker state, WebSocket accept loop, and peer lifecycle.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{oneshot, watch, Notify};

use holon_endpoint::{Handler, HandlerTable, PeerEndpoint, Role};
use holon_protocol::{DEFAULT_RPC_PATH, WS_SUBPROTOCOL};

use crate::registry::HolonRegistry;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// URL path upgraded to WebSocket.
    pub path: String,
    /// Timeout applied to broker-originated invokes (directed relay,
    /// fan-out legs).
    pub request_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_RPC_PATH.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// One accepted peer.
#[derive(Clone)]
pub(crate) struct PeerRecord {
    pub(crate) id: String,
    pub(crate) endpoint: PeerEndpoint,
    shutdown: Arc<Notify>,
}

#[derive(Default)]
struct AcceptQueue {
    ready: VecDeque<String>,
    waiters: VecDeque<oneshot::Sender<String>>,
}

#[derive(Default)]
pub(crate) struct StatsCounters {
    pub(crate) accepted: AtomicU64,
    pub(crate) requests_handled: AtomicU64,
    pub(crate) notifications_sent: AtomicU64,
}

/// Point-in-time broker counters.
#[derive(Debug, Clone)]
pub struct BrokerStats {
    pub connected_peers: usize,
    pub accepted_total: u64,
    pub requests_handled: u64,
    pub notifications_sent: u64,
}

pub(crate) struct BrokerInner {
    pub(crate) config: BrokerConfig,
    pub(crate) peers: RwLock<HashMap<String, PeerRecord>>,
    pub(crate) registry: Mutex<HolonRegistry>,
    pub(crate) handlers: HandlerTable,
    pub(crate) stats: StatsCounters,
    next_peer_id: AtomicU64,
    accepts: Mutex<AcceptQueue>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

/// The broker. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Broker {
    pub(crate) inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(BrokerInner {
                config,
                peers: RwLock::new(HashMap::new()),
                registry: Mutex::new(HolonRegistry::new()),
                handlers: holon_endpoint::new_handler_table(),
                stats: StatsCounters::default(),
                next_peer_id: AtomicU64::new(0),
                accepts: Mutex::new(AcceptQueue::default()),
                shutdown,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Install a broker-local handler. Duplicate registration replaces.
    pub fn register(&self, method: impl Into<String>, handler: Handler) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(method.into(), handler);
    }

    /// Router serving the WebSocket upgrade on the configured path, for
    /// callers embedding the broker into a larger axum app.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.inner.config.path, get(ws_upgrade))
            .with_state(self.clone())
    }

    /// Accept connections on `listener` until [`Broker::close`] is called.
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<(), anyhow::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, path = %self.inner.config.path, "holon-rpc broker listening");
        let mut shutdown = self.inner.shutdown.subscribe();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        Ok(())
    }

    /// Next connected peer id, FIFO over connection order.
    pub async fn wait_for_client(&self) -> Result<String, anyhow::Error> {
        let rx = {
            let mut queue = self.lock_accepts();
            if let Some(id) = queue.ready.pop_front() {
                return Ok(id);
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                anyhow::bail!("broker closed");
            }
            let (tx, rx) = oneshot::channel();
            queue.waiters.push_back(tx);
            rx
        };
        rx.await.map_err(|_| anyhow::anyhow!("broker closed"))
    }

    /// [`Broker::wait_for_client`] bounded by `timeout`.
    pub async fn wait_for_client_timeout(
        &self,
        timeout: Duration,
    ) -> Result<String, anyhow::Error> {
        tokio::time::timeout(timeout, self.wait_for_client())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for a client"))?
    }

    /// Ids of currently connected peers.
    pub fn connected_peers(&self) -> Vec<String> {
        self.lock_peers_read().keys().cloned().collect()
    }

    /// The holon name a peer is registered under, if any.
    pub fn holon_name_of(&self, peer_id: &str) -> Option<String> {
        self.lock_registry().name_of(peer_id).map(str::to_string)
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connected_peers: self.lock_peers_read().len(),
            accepted_total: self.inner.stats.accepted.load(Ordering::Relaxed),
            requests_handled: self.inner.stats.requests_handled.load(Ordering::Relaxed),
            notifications_sent: self.inner.stats.notifications_sent.load(Ordering::Relaxed),
        }
    }

    /// Force-close one peer's connection, as if it had disconnected.
    pub fn close_peer(&self, peer_id: &str) -> bool {
        let record = self.lock_peers_read().get(peer_id).cloned();
        match record {
            Some(record) => {
                // notify_one stores a permit, so the wakeup is not lost when
                // the peer loop is mid-message rather than parked in select.
                record.shutdown.notify_one();
                true
            }
            None => false,
        }
    }

    /// Shut the broker down: stop accepting, fail every pending request on
    /// every peer, fail queued [`Broker::wait_for_client`] callers.
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown.send(true);

        let waiters: Vec<oneshot::Sender<String>> = {
            let mut queue = self.lock_accepts();
            queue.ready.clear();
            queue.waiters.drain(..).collect()
        };
        drop(waiters); // dropped senders fail the receivers

        let peers: Vec<PeerRecord> = self.lock_peers_read().values().cloned().collect();
        for peer in peers {
            peer.endpoint.close();
            peer.shutdown.notify_one();
        }
        tracing::info!("holon-rpc broker closed");
    }

    pub(crate) fn peer_endpoint(&self, peer_id: &str) -> Option<PeerEndpoint> {
        self.lock_peers_read().get(peer_id).map(|p| p.endpoint.clone())
    }

    /// Drive one accepted WebSocket until it closes.
    async fn run_peer(&self, socket: WebSocket) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let peer_id = format!("c{}", self.inner.next_peer_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (endpoint, mut outbound_rx) = PeerEndpoint::new(Role::Server);
        endpoint.set_request_hook(self.request_hook_for(peer_id.clone()));

        let shutdown = Arc::new(Notify::new());
        {
            let mut peers = self
                .inner
                .peers
                .write()
                .unwrap_or_else(|e| e.into_inner());
            peers.insert(
                peer_id.clone(),
                PeerRecord {
                    id: peer_id.clone(),
                    endpoint: endpoint.clone(),
                    shutdown: shutdown.clone(),
                },
            );
        }
        // A close that raced the insert above would miss this peer; settle
        // it now that the record is visible.
        if self.inner.closed.load(Ordering::SeqCst) {
            self.disconnect_peer(&peer_id);
            return;
        }
        self.inner.stats.accepted.fetch_add(1, Ordering::Relaxed);
        self.offer_client(peer_id.clone());
        tracing::info!(peer = %peer_id, "peer connected");

        let (mut sink, mut stream) = socket.split();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        let mut broker_shutdown = self.inner.shutdown.subscribe();
        if *broker_shutdown.borrow() {
            writer.abort();
            self.disconnect_peer(&peer_id);
            return;
        }
        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => endpoint.process_text(&text).await,
                    Some(Ok(Message::Binary(bytes))) => endpoint.process_binary(&bytes).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    // Ping/pong are answered by the transport layer.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(peer = %peer_id, error = %e, "socket error");
                        break;
                    }
                },
                _ = shutdown.notified() => break,
                _ = broker_shutdown.changed() => break,
            }
        }

        writer.abort();
        self.disconnect_peer(&peer_id);
    }

    /// Disconnect cleanup: drop the record, clear the name, fail pending.
    fn disconnect_peer(&self, peer_id: &str) {
        let record = {
            let mut peers = self
                .inner
                .peers
                .write()
                .unwrap_or_else(|e| e.into_inner());
            peers.remove(peer_id)
        };
        if let Some(record) = record {
            self.lock_registry().deregister(peer_id);
            record.endpoint.close();
            self.lock_accepts().ready.retain(|id| id != peer_id);
            tracing::info!(peer = %peer_id, "peer disconnected");
        }
    }

    fn offer_client(&self, peer_id: String) {
        let mut queue = self.lock_accepts();
        let mut id = peer_id;
        while let Some(waiter) = queue.waiters.pop_front() {
            match waiter.send(id) {
                Ok(()) => return,
                // The waiter timed out and dropped its receiver; try the next.
                Err(returned) => id = returned,
            }
        }
        queue.ready.push_back(id);
    }

    fn lock_accepts(&self) -> std::sync::MutexGuard<'_, AcceptQueue> {
        self.inner.accepts.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn lock_registry(&self) -> std::sync::MutexGuard<'_, HolonRegistry> {
        self.inner.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_peers_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, PeerRecord>> {
        self.inner.peers.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn snapshot_peers(&self) -> Vec<PeerRecord> {
        self.lock_peers_read().values().cloned().collect()
    }
}

/// Upgrade handler: WebSocket only, and only with the bus subprotocol.
async fn ws_upgrade(
    State(broker): State<Broker>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !offers_subprotocol(&headers) {
        tracing::warn!("rejecting upgrade without the holon-rpc subprotocol");
        return (
            StatusCode::BAD_REQUEST,
            "subprotocol \"holon-rpc\" required",
        )
            .into_response();
    }
    ws.protocols([WS_SUBPROTOCOL])
        .on_upgrade(move |socket| async move { broker.run_peer(socket).await })
}

fn offers_subprotocol(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim() == WS_SUBPROTOCOL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subprotocol_offer_detection() {
        let mut headers = HeaderMap::new();
        assert!(!offers_subprotocol(&headers));

        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            "holon-rpc".parse().unwrap(),
        );
        assert!(offers_subprotocol(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            "graphql-ws, holon-rpc".parse().unwrap(),
        );
        assert!(offers_subprotocol(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            "graphql-ws".parse().unwrap(),
        );
        assert!(!offers_subprotocol(&headers));
    }

    #[tokio::test]
    async fn test_wait_for_client_is_fifo() {
        let broker = Broker::default();
        broker.offer_client("c1".into());
        broker.offer_client("c2".into());
        assert_eq!(broker.wait_for_client().await.unwrap(), "c1");
        assert_eq!(broker.wait_for_client().await.unwrap(), "c2");
    }

    #[tokio::test]
    async fn test_wait_for_client_timeout_then_late_offer() {
        let broker = Broker::default();
        let err = broker
            .wait_for_client_timeout(Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        // The timed-out waiter must not swallow the next connection.
        broker.offer_client("c1".into());
        assert_eq!(
            broker
                .wait_for_client_timeout(Duration::from_millis(100))
                .await
                .unwrap(),
            "c1"
        );
    }

    #[tokio::test]
    async fn test_close_fails_accept_waiters() {
        let broker = Broker::default();
        let waiting = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.wait_for_client().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.close();
        assert!(waiting.await.unwrap().is_err());

        // After close, new waiters fail immediately.
        assert!(broker.wait_for_client().await.is_err());
        // Idempotent.
        broker.close();
    }
}
