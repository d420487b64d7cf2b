//! Client configuration and reconnect backoff.

use std::time::Duration;

/// Configuration for a [`crate::HolonClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker WebSocket URL, e.g. `ws://127.0.0.1:9370/rpc`.
    pub url: String,
    /// How often the heartbeat timer issues `rpc.heartbeat`.
    pub heartbeat_interval: Duration,
    /// Per-heartbeat deadline; a miss closes the socket.
    pub heartbeat_timeout: Duration,
    /// First reconnect delay; also the jitter base.
    pub reconnect_min_delay: Duration,
    /// Cap on the exponential reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Exponential growth factor per failed attempt.
    pub reconnect_factor: f64,
    /// Jitter fraction: up to `reconnect_min_delay * reconnect_jitter` is
    /// added to every delay.
    pub reconnect_jitter: f64,
    /// Bound on the dial handshake and on waiting for the connection gate.
    pub connect_timeout: Duration,
    /// Default per-invoke deadline.
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Config with sensible defaults for the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(5),
            reconnect_min_delay: Duration::from_millis(250),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_factor: 2.0,
            reconnect_jitter: 0.1,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_reconnect_delays(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_min_delay = min;
        self.reconnect_max_delay = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Delay before reconnect attempt number `attempt` (0-based).
///
/// `min(min_delay * factor^attempt, max_delay)` plus a jitter term of
/// `jitter_unit * min_delay * jitter`, with `jitter_unit` drawn from
/// `[0, 1)` by the caller.
pub(crate) fn backoff_delay(config: &ClientConfig, attempt: u32, jitter_unit: f64) -> Duration {
    let base = config.reconnect_min_delay.as_secs_f64();
    let exponential = base * config.reconnect_factor.powi(attempt.min(64) as i32);
    let capped = exponential.min(config.reconnect_max_delay.as_secs_f64());
    let jitter = jitter_unit.clamp(0.0, 1.0) * base * config.reconnect_jitter;
    Duration::from_secs_f64(capped + jitter)
}
