//! The broker's request pipeline.
//!
//! Per inbound request: reserved methods first, then routing-hint
//! extraction, then one of three paths in order: fan-out, directed, local
//! handler. Notifications flow through the same pipeline and simply emit no
//! response envelope.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use holon_endpoint::{decode_params, HandlerError, RequestHook};
use holon_protocol::{
    extract_route_hints, parse_dispatch_route, Envelope, ErrorObject, RouteHints, RoutingMode,
    RpcFailure, METHOD_REGISTER, METHOD_UNREGISTER,
};

use crate::broker::Broker;

impl Broker {
    /// Hook installed on each accepted peer's endpoint; the endpoint has
    /// already validated the envelope shape and answered heartbeats.
    pub(crate) fn request_hook_for(&self, peer_id: String) -> RequestHook {
        let broker = self.clone();
        Arc::new(move |envelope| {
            let broker = broker.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move { broker.dispatch(&peer_id, envelope).await })
        })
    }

    async fn dispatch(&self, caller: &str, envelope: Envelope) -> Option<Envelope> {
        self.inner
            .stats
            .requests_handled
            .fetch_add(1, Ordering::Relaxed);

        let reply_id = envelope.id_str().map(|s| Value::String(s.to_string()));
        let method = envelope.method.clone().unwrap_or_default();
        let outcome = self.dispatch_inner(caller, &method, envelope.params).await;

        // A notification runs the full pipeline but never yields a response.
        let reply_id = reply_id?;
        Some(match outcome {
            Ok(result) => Envelope::response(Some(reply_id), result),
            Err(failure) => {
                tracing::debug!(
                    peer = %caller,
                    method = %method,
                    code = failure.code,
                    error = %failure.message,
                    "request failed"
                );
                Envelope::error_response(Some(reply_id), failure)
            }
        })
    }

    async fn dispatch_inner(
        &self,
        caller: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcFailure> {
        let mut params = decode_params(params)?;

        match method {
            METHOD_REGISTER => return self.handle_register(caller, &params),
            METHOD_UNREGISTER => {
                self.lock_registry().deregister(caller);
                tracing::debug!(peer = %caller, "holon name cleared");
                return Ok(json!({}));
            }
            _ => {}
        }

        let hints = extract_route_hints(method, &mut params)?;

        if hints.fan_out {
            return self.dispatch_fan_out(caller, &hints, params).await;
        }

        if let Some(target) = hints.target_peer.clone() {
            return self.dispatch_directed(caller, &target, &hints, params).await;
        }

        if let Some((name, rest)) = parse_dispatch_route(&hints.method) {
            // The dispatch sigil only applies to registered names; a dotted
            // method nobody registered may still be a broker-local handler.
            let resolved = {
                let registry = self.lock_registry();
                if registry.contains_name(&name) {
                    Some(registry.resolve(&name, caller))
                } else {
                    None
                }
            };
            match resolved {
                Some(Some(target)) => {
                    let directed = RouteHints { method: rest, ..hints };
                    return self.dispatch_directed(caller, &target, &directed, params).await;
                }
                Some(None) => {
                    // Registered, but the caller is the only registrant.
                    return Err(RpcFailure::not_found(format!("holon {:?} not found", name)));
                }
                None => {}
            }
        }

        self.dispatch_local(&hints.method, params).await
    }

    fn handle_register(
        &self,
        caller: &str,
        params: &Map<String, Value>,
    ) -> Result<Value, RpcFailure> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| RpcFailure::invalid_params("register requires a non-empty name"))?;
        let stored = self
            .lock_registry()
            .register(caller, name)
            .ok_or_else(|| RpcFailure::invalid_params("register requires a non-empty name"))?;
        tracing::info!(peer = %caller, name = %stored, "holon registered");
        Ok(json!({ "peer": caller, "name": stored }))
    }

    /// Invoke every connected peer except the caller and aggregate.
    async fn dispatch_fan_out(
        &self,
        caller: &str,
        hints: &RouteHints,
        params: Map<String, Value>,
    ) -> Result<Value, RpcFailure> {
        let targets: Vec<_> = self
            .snapshot_peers()
            .into_iter()
            .filter(|peer| peer.id != caller)
            .collect();
        if targets.is_empty() {
            return Err(RpcFailure::not_found("no connected peers"));
        }

        let timeout = self.inner.config.request_timeout;
        let legs = targets.into_iter().map(|peer| {
            let method = hints.method.clone();
            let params = Value::Object(params.clone());
            async move {
                let outcome = peer.endpoint.invoke(&method, params, timeout).await;
                (peer.id, outcome)
            }
        });
        // Completion order decides entry order; no cross-target guarantee.
        let outcomes = futures_util::future::join_all(legs).await;

        let entries: Vec<Value> = outcomes
            .iter()
            .map(|(peer, outcome)| fan_out_entry(peer, outcome))
            .collect();

        if hints.mode == RoutingMode::FullBroadcast {
            for (peer, outcome) in &outcomes {
                self.broadcast_notification(
                    &hints.method,
                    fan_out_entry(peer, outcome),
                    &[caller, peer.as_str()],
                )
                .await;
            }
        }

        Ok(Value::Array(entries))
    }

    /// Relay one request to `target` and hand the outcome back verbatim.
    async fn dispatch_directed(
        &self,
        caller: &str,
        target: &str,
        hints: &RouteHints,
        params: Map<String, Value>,
    ) -> Result<Value, RpcFailure> {
        let endpoint = self
            .peer_endpoint(target)
            .ok_or_else(|| RpcFailure::not_found(format!("peer {:?} not found", target)))?;

        let result = endpoint
            .invoke(
                &hints.method,
                Value::Object(params),
                self.inner.config.request_timeout,
            )
            .await?;

        if hints.mode == RoutingMode::BroadcastResponse {
            self.broadcast_notification(
                &hints.method,
                json!({ "peer": target, "result": result }),
                &[caller, target],
            )
            .await;
        }

        Ok(result)
    }

    async fn dispatch_local(
        &self,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Value, RpcFailure> {
        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(method)
            .cloned();
        let Some(handler) = handler else {
            return Err(RpcFailure::method_not_found(method));
        };
        match handler(params).await {
            Ok(result) => Ok(result),
            Err(HandlerError::Rpc(failure)) => Err(failure),
            Err(HandlerError::Other(error)) => {
                tracing::warn!(method = %method, error = %error, "broker handler failed");
                Err(RpcFailure::internal_broker())
            }
        }
    }

    /// Notify every connected peer not in `exclude`. Best-effort: a failed
    /// send to one peer must not block or fail delivery to the rest.
    async fn broadcast_notification(&self, method: &str, params: Value, exclude: &[&str]) {
        let targets: Vec<_> = self
            .snapshot_peers()
            .into_iter()
            .filter(|peer| !exclude.contains(&peer.id.as_str()))
            .collect();
        for peer in targets {
            match peer.endpoint.notify(method, params.clone()).await {
                Ok(()) => {
                    self.inner
                        .stats
                        .notifications_sent
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::debug!(peer = %peer.id, error = %e, "notification dropped");
                }
            }
        }
    }
}

fn fan_out_entry(peer: &str, outcome: &Result<Value, RpcFailure>) -> Value {
    match outcome {
        Ok(result) => json!({ "peer": peer, "result": result }),
        Err(failure) => json!({ "peer": peer, "error": ErrorObject::from(failure.clone()) }),
    }
}
