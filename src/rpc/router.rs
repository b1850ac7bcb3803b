//! The RPC router: one logical namespace of routes shared by every peer.
//!
//! Each route is owned by exactly one handler — the local default service or
//! a proxy to a transport. Frames arriving from a transport pass through
//! [`RpcRouter::route_from`], which enforces the per-session auth token and
//! stamps the source route before delivery.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::auth::{SwapTokenTable, TokenSigner, make_auth_token};
use super::frame::{DEFAULT_ROUTE, RpcContext, RpcMessage};
use crate::pubsub::{Broker, EVENT_CONN_CHANGE, EVENT_ROUTE_GONE, EVENT_ROUTE_UP, StarEvent};
use std::sync::Arc;

/// Channel depth per peer, in each direction.
pub const PEER_CHANNEL_SIZE: usize = 32;

/// Default timeout for daemon-originated calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no route found for {0:?}")]
    RouteNotFound(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("timeout")]
    Timeout,
    #[error("disconnected")]
    Disconnected,
    #[error("{0}")]
    Remote(String),
}

struct PendingCall {
    route: String,
    tx: mpsc::Sender<Result<Option<Value>, RpcError>>,
}

pub struct RpcRouter {
    /// route id -> outbound channel of the owning transport
    routes: DashMap<String, mpsc::Sender<RpcMessage>>,
    /// per-route session auth tokens
    auth_tokens: DashMap<String, String>,
    /// reqid -> pending response channel for daemon-originated calls
    pending: DashMap<String, PendingCall>,
    /// queue feeding the local default service
    default_handler: Mutex<Option<mpsc::Sender<RpcMessage>>>,
    /// optional upstream client for unknown routes
    upstream: Mutex<Option<mpsc::Sender<RpcMessage>>>,
    /// waiters parked on waitforroute
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
    pub signer: TokenSigner,
    pub swap_tokens: SwapTokenTable,
    broker: Arc<Broker>,
}

impl RpcRouter {
    pub fn new(broker: Arc<Broker>, signer: TokenSigner) -> Self {
        Self {
            routes: DashMap::new(),
            auth_tokens: DashMap::new(),
            pending: DashMap::new(),
            default_handler: Mutex::new(None),
            upstream: Mutex::new(None),
            waiters: Mutex::new(HashMap::new()),
            signer,
            swap_tokens: SwapTokenTable::new(),
            broker,
        }
    }

    /// Bind the local default service's inbound queue. Frames addressed to
    /// the default route are pushed here.
    pub fn set_default_handler(&self, tx: mpsc::Sender<RpcMessage>) {
        *self.default_handler.lock().unwrap() = Some(tx);
    }

    pub fn set_upstream(&self, tx: Option<mpsc::Sender<RpcMessage>>) {
        *self.upstream.lock().unwrap() = tx;
    }

    /// Exchange a verified peer identity for a route binding and session
    /// auth token. Replaces any previous owner of the route.
    pub fn register_peer(
        &self,
        ctx: &RpcContext,
        outbound: mpsc::Sender<RpcMessage>,
    ) -> (String, String) {
        let route_id = ctx
            .route_id()
            .unwrap_or_else(|| format!("peer:{}", &Uuid::new_v4().to_string()[..8]));
        let auth_token = make_auth_token();
        self.register_route(&route_id, outbound);
        self.auth_tokens.insert(route_id.clone(), auth_token.clone());
        (route_id, auth_token)
    }

    pub fn register_route(&self, route_id: &str, outbound: mpsc::Sender<RpcMessage>) {
        debug!("registering route {route_id:?}");
        self.routes.insert(route_id.to_string(), outbound);
        self.broker.publish(StarEvent {
            event: EVENT_ROUTE_UP.to_string(),
            scopes: vec![route_id.to_string()],
            ..Default::default()
        });
        let mut waiters = self.waiters.lock().unwrap();
        if let Some(parked) = waiters.remove(route_id) {
            for waiter in parked {
                let _ = waiter.send(());
            }
        }
    }

    pub fn has_route(&self, route_id: &str) -> bool {
        self.routes.contains_key(route_id)
    }

    /// Bind an additional route to an existing transport (a proxy peer
    /// announcing a route it forwards for). Returns false when the owner is
    /// unknown.
    pub fn alias_route(&self, route_id: &str, owner_route: &str) -> bool {
        let Some(sender) = self.routes.get(owner_route).map(|s| s.clone()) else {
            return false;
        };
        self.register_route(route_id, sender);
        true
    }

    /// Tear down a route: fail its pending calls, drop its subscriptions,
    /// and fan out the change events.
    pub fn dispose_route(&self, route_id: &str) {
        debug!("disposing route {route_id:?}");
        self.routes.remove(route_id);
        self.auth_tokens.remove(route_id);
        let dead: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().route == route_id)
            .map(|entry| entry.key().clone())
            .collect();
        for reqid in dead {
            if let Some((_, call)) = self.pending.remove(&reqid) {
                let _ = call.tx.try_send(Err(RpcError::Disconnected));
            }
        }
        self.broker.unregister_client(route_id);
        self.broker.publish(StarEvent {
            event: EVENT_ROUTE_GONE.to_string(),
            scopes: vec![route_id.to_string()],
            ..Default::default()
        });
        self.broker.publish(StarEvent {
            event: EVENT_CONN_CHANGE.to_string(),
            scopes: vec![route_id.to_string()],
            ..Default::default()
        });
    }

    /// Park until a route registers or the timeout elapses.
    pub async fn wait_for_route(&self, route_id: &str, timeout: Duration) -> bool {
        if self.has_route(route_id) {
            return true;
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().unwrap();
            waiters.entry(route_id.to_string()).or_default().push(tx);
        }
        tokio::time::timeout(timeout, rx).await.is_ok()
    }

    /// Entry point for frames read off an authenticated transport. The bound
    /// route becomes the frame's source; a token mismatch drops the frame.
    pub fn route_from(&self, bound_route: &str, mut msg: RpcMessage) -> Result<(), RpcError> {
        if let Some(expected) = self.auth_tokens.get(bound_route) {
            if msg.authtoken != *expected {
                warn!("dropping frame with bad auth token from {bound_route:?}");
                return Err(RpcError::AuthFailed(format!(
                    "bad auth token for route {bound_route:?}"
                )));
            }
        }
        msg.source = bound_route.to_string();
        msg.authtoken.clear();
        self.deliver(msg);
        Ok(())
    }

    /// Deliver a frame according to the routing rules. Trusted internal
    /// callers use this directly.
    pub fn deliver(&self, msg: RpcMessage) {
        // responses and stream chunks destined for a daemon-originated call
        if msg.is_response() {
            if let Some(entry) = self.pending.get(&msg.resid) {
                let result = if !msg.error.is_empty() {
                    Err(RpcError::Remote(msg.error.clone()))
                } else {
                    Ok(msg.data.clone())
                };
                let finished = !msg.cont;
                let _ = entry.value().tx.try_send(result);
                drop(entry);
                if finished {
                    self.pending.remove(&msg.resid);
                }
                return;
            }
        }
        let route = msg.route.clone();
        if route == DEFAULT_ROUTE {
            let handler = self.default_handler.lock().unwrap().clone();
            match handler {
                Some(tx) => {
                    if tx.try_send(msg).is_err() {
                        warn!("local service queue full, dropping frame");
                    }
                }
                None => warn!("no default handler bound, dropping frame"),
            }
            return;
        }
        if let Some(peer) = self.routes.get(&route) {
            if peer.try_send(msg.clone()).is_err() {
                warn!("outbound queue full for route {route:?}, dropping frame");
            }
            return;
        }
        let upstream = self.upstream.lock().unwrap().clone();
        if let Some(tx) = upstream {
            if tx.try_send(msg).is_err() {
                warn!("upstream queue full, dropping frame");
            }
            return;
        }
        debug!("no route found for {route:?}");
        if !msg.reqid.is_empty() && !msg.source.is_empty() {
            let err = msg.error_response(format!("no route found for {route:?}"));
            self.deliver(err);
        }
    }

    /// Daemon-originated call: one request, one response.
    pub async fn send_command(
        &self,
        route: &str,
        command: &str,
        data: Option<Value>,
        timeout: Duration,
    ) -> Result<Option<Value>, RpcError> {
        let reqid = Uuid::new_v4().to_string();
        let mut rx = self.register_request(&reqid, route);
        self.deliver(RpcMessage {
            command: command.to_string(),
            reqid: reqid.clone(),
            timeout: timeout.as_millis() as u64,
            route: route.to_string(),
            data,
            ..Default::default()
        });
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(RpcError::Disconnected),
            Err(_) => {
                self.cancel(&reqid, route);
                Err(RpcError::Timeout)
            }
        }
    }

    /// Daemon-originated response stream. The returned handle yields chunks
    /// in order; call [`RpcRouter::cancel`] with its reqid to stop the
    /// producer early.
    pub fn send_stream_command(
        &self,
        route: &str,
        command: &str,
        data: Option<Value>,
        timeout: Duration,
    ) -> Result<StreamHandle, RpcError> {
        let reqid = Uuid::new_v4().to_string();
        let rx = self.register_request(&reqid, route);
        let msg = RpcMessage {
            command: command.to_string(),
            reqid: reqid.clone(),
            timeout: timeout.as_millis() as u64,
            route: route.to_string(),
            data,
            ..Default::default()
        };
        self.deliver(msg);
        Ok(StreamHandle {
            reqid,
            route: route.to_string(),
            rx,
        })
    }

    fn register_request(
        &self,
        reqid: &str,
        route: &str,
    ) -> mpsc::Receiver<Result<Option<Value>, RpcError>> {
        let (tx, rx) = mpsc::channel(PEER_CHANNEL_SIZE);
        self.pending.insert(
            reqid.to_string(),
            PendingCall {
                route: route.to_string(),
                tx,
            },
        );
        rx
    }

    /// Send a cancel frame for an in-flight request and forget it.
    pub fn cancel(&self, reqid: &str, route: &str) {
        self.pending.remove(reqid);
        self.deliver(RpcMessage {
            reqid: reqid.to_string(),
            route: route.to_string(),
            cancel: true,
            ..Default::default()
        });
    }
}

/// Caller-owned handle on a response stream.
pub struct StreamHandle {
    pub reqid: String,
    pub route: String,
    pub rx: mpsc::Receiver<Result<Option<Value>, RpcError>>,
}

impl StreamHandle {
    pub async fn next(&mut self) -> Option<Result<Option<Value>, RpcError>> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::SubscriptionRequest;

    fn test_router() -> (Arc<Broker>, RpcRouter) {
        let broker = Arc::new(Broker::new());
        let router = RpcRouter::new(broker.clone(), TokenSigner::new(b"test"));
        (broker, router)
    }

    #[tokio::test]
    async fn test_route_registration_and_delivery() {
        let (_broker, router) = test_router();
        let (tx, mut rx) = mpsc::channel(4);
        router.register_route("conn:host", tx);
        router.deliver(RpcMessage {
            command: "message".into(),
            route: "conn:host".into(),
            ..Default::default()
        });
        let got = rx.recv().await.unwrap();
        assert_eq!(got.command, "message");
    }

    #[tokio::test]
    async fn test_unknown_route_errors_back_to_source() {
        let (_broker, router) = test_router();
        let (tx, mut rx) = mpsc::channel(4);
        router.register_route("proc:b1", tx);
        router.deliver(RpcMessage {
            command: "message".into(),
            reqid: "r9".into(),
            route: "conn:nosuch".into(),
            source: "proc:b1".into(),
            ..Default::default()
        });
        let got = rx.recv().await.unwrap();
        assert_eq!(got.resid, "r9");
        assert!(got.error.contains("no route found"));
    }

    #[tokio::test]
    async fn test_auth_token_enforced() {
        let (_broker, router) = test_router();
        let (tx, _rx) = mpsc::channel(4);
        let ctx = RpcContext {
            conn: "host".into(),
            ..Default::default()
        };
        let (route_id, token) = router.register_peer(&ctx, tx);
        assert_eq!(route_id, "conn:host");

        let bad = router.route_from(
            &route_id,
            RpcMessage {
                command: "message".into(),
                authtoken: "wrong".into(),
                ..Default::default()
            },
        );
        assert!(matches!(bad, Err(RpcError::AuthFailed(_))));

        let ok = router.route_from(
            &route_id,
            RpcMessage {
                command: "message".into(),
                authtoken: token,
                ..Default::default()
            },
        );
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_dispose_fails_pending_and_unsubscribes() {
        let (broker, router) = test_router();
        let (tx, _rx) = mpsc::channel(4);
        router.register_route("conn:host", tx);
        broker.register_client("conn:host");
        broker.subscribe(
            "conn:host",
            SubscriptionRequest {
                event: "blockfile".into(),
                all_scopes: true,
                ..Default::default()
            },
        );

        let mut pending_rx = router.register_request("req1", "conn:host");
        router.dispose_route("conn:host");
        let result = pending_rx.recv().await.unwrap();
        assert!(matches!(result, Err(RpcError::Disconnected)));
        assert_eq!(
            broker.publish(StarEvent {
                event: "blockfile".into(),
                ..Default::default()
            }),
            0
        );
    }

    #[tokio::test]
    async fn test_wait_for_route() {
        let (_broker, router) = test_router();
        assert!(!router.wait_for_route("conn:x", Duration::from_millis(20)).await);
        let (tx, _rx) = mpsc::channel(4);
        router.register_route("conn:x", tx);
        assert!(router.wait_for_route("conn:x", Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_response_resolves_pending_call() {
        let (_broker, router) = test_router();
        let mut rx = router.register_request("reqZ", "conn:h");
        router.deliver(RpcMessage {
            resid: "reqZ".into(),
            data: Some(serde_json::json!(42)),
            ..Default::default()
        });
        let result = rx.recv().await.unwrap().unwrap();
        assert_eq!(result, Some(serde_json::json!(42)));
        // pending entry is gone; a second response is routed normally
        assert!(!router.pending.contains_key("reqZ"));
    }
}
