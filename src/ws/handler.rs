//! Websocket handler bridging the desktop UI to the router, the service
//! layer, and the event broker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::App;
use crate::pubsub::{StarEvent, SubscriptionRequest};
use crate::rpc::RpcMessage;
use crate::rpc::frame::ELECTRON_ROUTE;
use crate::rpc::router::PEER_CHANNEL_SIZE;
use crate::service::{WebCall, WebReturn, call_service};

use super::EVENT_ELECTRON_NEW_WINDOW;

const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WsIncoming {
    /// Raw rpc frame from the UI's client stub.
    Rpc { frame: RpcMessage },
    /// Typed service call.
    Call {
        id: u64,
        #[serde(flatten)]
        call: WebCall,
    },
    /// The shell confirms a window exists on screen.
    WindowReady {
        #[serde(rename = "windowid")]
        window_id: String,
    },
    Pong,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WsOutgoing {
    Connected,
    Rpc { frame: RpcMessage },
    CallResult { id: u64, result: WebReturn },
    Event { event: StarEvent },
    Ping,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "windowid", default)]
    window_id: String,
    #[serde(rename = "authkey", default)]
    auth_key: String,
}

pub fn ws_router(app: Arc<App>) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(app)
}

/// Serve the UI websocket endpoint on the given address.
pub async fn run_websocket_listener(addr: &str, app: Arc<App>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding websocket listener on {addr}"))?;
    info!("websocket listening at {}", listener.local_addr()?);
    axum::serve(listener, ws_router(app))
        .await
        .context("websocket listener failed")
}

async fn ws_upgrade(
    State(app): State<Arc<App>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if query.auth_key != app.ui.auth_key() {
            warn!("rejecting websocket connection with bad auth key");
            return;
        }
        handle_ws_connection(socket, app, query.window_id).await;
    })
}

async fn handle_ws_connection(socket: WebSocket, app: Arc<App>, window_id: String) {
    info!("ui websocket connected (window {window_id:?})");
    let (mut sender, mut receiver) = socket.split();

    // the UI owns the electron route; frames addressed there flow over this
    // socket
    let (route_tx, mut route_rx) = mpsc::channel::<RpcMessage>(PEER_CHANNEL_SIZE);
    app.router.register_route(ELECTRON_ROUTE, route_tx);
    let mut event_rx = app.broker.register_client(ELECTRON_ROUTE);
    // the shell always wants new-window requests
    app.broker.subscribe(
        ELECTRON_ROUTE,
        SubscriptionRequest {
            event: EVENT_ELECTRON_NEW_WINDOW.to_string(),
            all_scopes: true,
            ..Default::default()
        },
    );
    if !window_id.is_empty() {
        app.ui.mark_window_ready(&window_id);
    }

    let send = |msg: &WsOutgoing| serde_json::to_string(msg).expect("ws messages serialize");
    if sender
        .send(Message::Text(send(&WsOutgoing::Connected).into()))
        .await
        .is_err()
    {
        app.router.dispose_route(ELECTRON_ROUTE);
        return;
    }

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<WsIncoming>(&text) {
                            Ok(incoming) => {
                                if let Some(reply) =
                                    handle_incoming(&app, incoming).await
                                {
                                    if sender
                                        .send(Message::Text(send(&reply).into()))
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                            }
                            Err(e) => debug!("bad ws message: {e}"),
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            frame = route_rx.recv() => {
                let Some(frame) = frame else { break };
                let out = WsOutgoing::Rpc { frame };
                if sender.send(Message::Text(send(&out).into())).await.is_err() {
                    break;
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let out = WsOutgoing::Event { event };
                if sender.send(Message::Text(send(&out).into())).await.is_err() {
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if sender.send(Message::Text(send(&WsOutgoing::Ping).into())).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("ui websocket disconnected");
    app.router.dispose_route(ELECTRON_ROUTE);
}

async fn handle_incoming(app: &Arc<App>, incoming: WsIncoming) -> Option<WsOutgoing> {
    match incoming {
        WsIncoming::Rpc { frame } => {
            if app.router.route_from(ELECTRON_ROUTE, frame).is_err() {
                warn!("dropping ui frame with bad auth token");
            }
            None
        }
        WsIncoming::Call { id, call } => {
            let result = call_service(app, call).await;
            Some(WsOutgoing::CallResult { id, result })
        }
        WsIncoming::WindowReady { window_id } => {
            app.ui.mark_window_ready(&window_id);
            None
        }
        WsIncoming::Pong => None,
    }
}
