//! Client lifecycle tests: reconnect with backoff, heartbeats, the
//! connection gate, and close semantics. Runs against a real broker.

use std::time::Duration;

use serde_json::{json, Value};

use holon_broker::Broker;
use holon_client::{ClientConfig, HolonClient};
use holon_endpoint::handler_fn;
use holon_protocol::{DEADLINE_EXCEEDED, UNAVAILABLE};

// ─── Harness ─────────────────────────────────────────────────────────────────

async fn start_broker() -> (Broker, String) {
    let broker = Broker::default();
    // Echo service used by every test in this file.
    broker.register(
        "Ping",
        handler_fn(|params| async move { Ok(Value::Object(params)) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/rpc", listener.local_addr().unwrap());
    let serving = broker.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (broker, url)
}

fn fast_config(url: &str) -> ClientConfig {
    ClientConfig::new(url)
        .with_heartbeat(Duration::from_millis(100), Duration::from_millis(500))
        .with_reconnect_delays(Duration::from_millis(50), Duration::from_millis(400))
        .with_connect_timeout(Duration::from_secs(2))
        .with_request_timeout(Duration::from_secs(2))
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

// ─── Reconnect ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reconnect_after_broker_drops_the_socket() {
    let (broker, url) = start_broker().await;
    let client = HolonClient::new(fast_config(&url));
    client.connect().await.unwrap();
    let first_id = broker
        .wait_for_client_timeout(Duration::from_secs(2))
        .await
        .unwrap();

    let first = client.invoke("Ping", json!({"seq": "first"})).await.unwrap();
    assert_eq!(first, json!({"seq": "first"}));

    assert!(broker.close_peer(&first_id));

    // The supervisor redials on its own; a later call must succeed.
    let mut second = None;
    for _ in 0..100 {
        match client.invoke("Ping", json!({"seq": "second"})).await {
            Ok(value) => {
                second = Some(value);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    assert_eq!(second.expect("client reconnects"), json!({"seq": "second"}));

    let second_id = broker
        .wait_for_client_timeout(Duration::from_secs(2))
        .await
        .unwrap();
    assert_ne!(second_id, first_id, "the reconnect is a fresh peer");

    // Heartbeats resume on the new connection.
    let observed = client.heartbeat_count();
    assert!(
        wait_until(Duration::from_secs(2), || client.heartbeat_count() > observed).await,
        "heartbeat counter advances after reconnect"
    );
    client.close().await;
}

#[tokio::test]
async fn test_heartbeats_tick_on_a_healthy_connection() {
    let (_broker, url) = start_broker().await;
    let client = HolonClient::new(fast_config(&url));
    client.connect().await.unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || client.heartbeat_count() >= 2).await,
        "heartbeat timer fires repeatedly"
    );
    client.close().await;
}

#[tokio::test]
async fn test_reconnect_stops_after_close() {
    let (broker, url) = start_broker().await;
    let client = HolonClient::new(fast_config(&url));
    client.connect().await.unwrap();
    let peer_id = broker
        .wait_for_client_timeout(Duration::from_secs(2))
        .await
        .unwrap();

    client.close().await;
    assert!(
        wait_until(Duration::from_secs(2), || broker.stats().connected_peers == 0).await,
        "the closed client leaves the broker"
    );

    // No reconnect ever fires for a closed client.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(broker.stats().accepted_total, 1, "no redial after close");
    assert!(!client.is_connected());
    let _ = peer_id;
}

// ─── Connection gate ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_invoke_waits_on_the_gate_and_times_out() {
    // Never connected: the gate cannot open.
    let config = ClientConfig::new("ws://127.0.0.1:9/rpc")
        .with_connect_timeout(Duration::from_millis(150));
    let client = HolonClient::new(config);

    let err = client.invoke("Ping", json!({})).await.unwrap_err();
    assert_eq!(err.code, DEADLINE_EXCEEDED);
}

#[tokio::test]
async fn test_connect_rejects_missing_subprotocol_echo() {
    // A WebSocket server that upgrades without negotiating any subprotocol.
    use axum::extract::ws::WebSocketUpgrade;
    use axum::response::Response;
    use axum::routing::get;
    use axum::Router;

    async fn plain_upgrade(ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(|_socket| async {})
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/rpc", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let app = Router::new().route("/rpc", get(plain_upgrade));
        let _ = axum::serve(listener, app).await;
    });

    let client = HolonClient::new(fast_config(&url));
    let err = client.connect().await.unwrap_err();
    assert!(
        err.to_string().contains("subprotocol"),
        "negotiation failure is surfaced: {}",
        err
    );
    assert!(!client.is_connected());
}

// ─── Close semantics ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    let (_broker, url) = start_broker().await;
    let client = HolonClient::new(fast_config(&url));
    client.connect().await.unwrap();
    assert!(client.await_connected(Duration::from_secs(2)).await.is_ok());

    client.close().await;
    client.close().await;

    let err = client.invoke("Ping", json!({})).await.unwrap_err();
    assert_eq!(err.code, UNAVAILABLE, "no invocation succeeds after close");
    assert!(client.connect().await.is_err(), "a closed client stays closed");
}

#[tokio::test]
async fn test_disconnect_fails_outstanding_requests() {
    let (broker, url) = start_broker().await;
    broker.register(
        "Hang",
        handler_fn(|_| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!({}))
        }),
    );
    let client = HolonClient::new(fast_config(&url));
    client.connect().await.unwrap();
    let peer_id = broker
        .wait_for_client_timeout(Duration::from_secs(2))
        .await
        .unwrap();

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.invoke("Hang", json!({})).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(broker.close_peer(&peer_id));

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.code, UNAVAILABLE, "disconnect fails in-flight requests");
    client.close().await;
}
