//! Byte-stream transports: the local unix domain socket listener and the
//! stdio adapters for spawned agent processes. Both speak the packet framing
//! from [`super::stdio`].

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use super::frame::{CMD_AUTHENTICATE, CMD_AUTHENTICATE_TOKEN, CMD_EVENT_RECV, RpcMessage};
use super::router::{PEER_CHANNEL_SIZE, RpcRouter};
use super::stdio::{PacketParser, encode_packet};
use crate::pubsub::Broker;

/// Bind the domain socket and accept peers forever.
pub async fn run_domain_socket_listener(
    path: &Path,
    router: Arc<RpcRouter>,
    broker: Arc<Broker>,
) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("binding domain socket {}", path.display()))?;
    info!("domain socket listening at {}", path.display());
    loop {
        let (stream, _addr) = listener.accept().await.context("accepting peer")?;
        let router = router.clone();
        let broker = broker.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_socket_conn(stream, router, broker).await {
                debug!("socket peer closed: {e:#}");
            }
        });
    }
}

async fn handle_socket_conn(
    stream: UnixStream,
    router: Arc<RpcRouter>,
    broker: Arc<Broker>,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    serve_peer(read_half, write_half, router, broker, None).await
}

/// Adopt a spawned process's stdio as a transport for a pre-trusted route
/// (the daemon launched the process itself, so no handshake is required).
pub fn attach_stdio_peer<R, W>(
    route_id: &str,
    reader: R,
    writer: W,
    router: Arc<RpcRouter>,
    broker: Arc<Broker>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let route_id = route_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = serve_peer(reader, writer, router, broker, Some(route_id)).await {
            debug!("stdio peer closed: {e:#}");
        }
    })
}

/// Shared read/write loop for one peer. `pre_route` skips the authenticate
/// handshake and binds the transport to a known route immediately.
async fn serve_peer<R, W>(
    mut reader: R,
    mut writer: W,
    router: Arc<RpcRouter>,
    broker: Arc<Broker>,
    pre_route: Option<String>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<RpcMessage>(PEER_CHANNEL_SIZE);

    let write_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let packet = encode_packet(&msg);
            if writer.write_all(&packet).await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    let mut bound_route: Option<String> = pre_route.clone();
    if let Some(route) = &pre_route {
        router.register_route(route, out_tx.clone());
        start_event_forwarder(route, &broker, &out_tx);
    }

    let mut parser = PacketParser::new();
    let mut buf = [0u8; 4096];
    let result: Result<()> = 'conn: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e.into()),
        };
        for frame in parser.feed(&buf[..n]) {
            let msg = match frame {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("dropping malformed rpc packet: {e:#}");
                    continue;
                }
            };
            match &bound_route {
                Some(route) => {
                    if router.route_from(route, msg).is_err() {
                        // token mismatch closes the route
                        break 'conn Ok(());
                    }
                }
                None => {
                    if let Some(route) = handshake(&router, &broker, &out_tx, msg) {
                        bound_route = Some(route);
                    }
                }
            }
        }
    };

    if let Some(route) = bound_route {
        router.dispose_route(&route);
    }
    write_task.abort();
    result
}

/// Handle an authenticate / authenticatetoken frame from an unbound peer.
/// Returns the bound route id on success.
fn handshake(
    router: &Arc<RpcRouter>,
    broker: &Arc<Broker>,
    out_tx: &mpsc::Sender<RpcMessage>,
    msg: RpcMessage,
) -> Option<String> {
    match msg.command.as_str() {
        CMD_AUTHENTICATE => {
            let token = msg.data.as_ref().and_then(|d| d.as_str()).unwrap_or("");
            match router.signer.verify_token(token) {
                Ok(ctx) => {
                    let (route_id, auth_token) = router.register_peer(&ctx, out_tx.clone());
                    start_event_forwarder(&route_id, broker, out_tx);
                    let resp = msg.response(Some(json!({
                        "routeid": route_id,
                        "authtoken": auth_token,
                    })));
                    let _ = out_tx.try_send(resp);
                    Some(route_id)
                }
                Err(e) => {
                    let _ = out_tx.try_send(msg.error_response(format!("authentication failed: {e}")));
                    None
                }
            }
        }
        CMD_AUTHENTICATE_TOKEN => {
            let token = msg
                .data
                .as_ref()
                .and_then(|d| d.get("token"))
                .and_then(|t| t.as_str())
                .unwrap_or("");
            match router.swap_tokens.take(token) {
                Ok(entry) => {
                    let (route_id, auth_token) =
                        router.register_peer(&entry.rpc_context, out_tx.clone());
                    start_event_forwarder(&route_id, broker, out_tx);
                    let resp = msg.response(Some(json!({
                        "routeid": route_id,
                        "authtoken": auth_token,
                        "env": entry.env,
                        "initscripttext": entry.script_text,
                    })));
                    let _ = out_tx.try_send(resp);
                    Some(route_id)
                }
                Err(e) => {
                    let _ = out_tx.try_send(msg.error_response(e.to_string()));
                    None
                }
            }
        }
        other => {
            debug!("dropping pre-auth frame with command {other:?}");
            let _ = out_tx.try_send(msg.error_response("not authenticated"));
            None
        }
    }
}

/// Forward broker events for this route to the peer as eventrecv frames.
fn start_event_forwarder(route_id: &str, broker: &Arc<Broker>, out_tx: &mpsc::Sender<RpcMessage>) {
    let mut rx = broker.register_client(route_id);
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let msg = RpcMessage::command(
                CMD_EVENT_RECV,
                Some(serde_json::to_value(event).expect("events always serialize")),
            );
            if out_tx.send(msg).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::auth::TokenSigner;
    use crate::rpc::frame::RpcContext;

    #[tokio::test]
    async fn test_socket_handshake_and_frame_flow() {
        let tmp = tempfile::tempdir().unwrap();
        let sock_path = tmp.path().join("star.sock");
        let broker = Arc::new(Broker::new());
        let router = Arc::new(RpcRouter::new(broker.clone(), TokenSigner::new(b"secret")));

        // the local service just echoes what it receives
        let (svc_tx, mut svc_rx) = mpsc::channel(8);
        router.set_default_handler(svc_tx);

        let listener_router = router.clone();
        let listener_broker = broker.clone();
        let path = sock_path.clone();
        tokio::spawn(async move {
            let _ = run_domain_socket_listener(&path, listener_router, listener_broker).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut stream = UnixStream::connect(&sock_path).await.unwrap();
        let jwt = router
            .signer
            .make_token(&RpcContext {
                block_id: "b1".into(),
                ..Default::default()
            })
            .unwrap();
        let auth = RpcMessage {
            command: CMD_AUTHENTICATE.into(),
            reqid: "r1".into(),
            data: Some(json!(jwt)),
            ..Default::default()
        };
        stream.write_all(&encode_packet(&auth)).await.unwrap();

        // read the handshake response
        let mut parser = PacketParser::new();
        let mut buf = [0u8; 1024];
        let resp = loop {
            let n = stream.read(&mut buf).await.unwrap();
            let mut frames = parser.feed(&buf[..n]);
            if let Some(frame) = frames.pop() {
                break frame.unwrap();
            }
        };
        assert_eq!(resp.resid, "r1");
        let data = resp.data.unwrap();
        assert_eq!(data["routeid"], "proc:b1");
        let auth_token = data["authtoken"].as_str().unwrap().to_string();

        // an authenticated frame reaches the default service with its source stamped
        let msg = RpcMessage {
            command: "message".into(),
            authtoken: auth_token,
            data: Some(json!({"message": "hello"})),
            ..Default::default()
        };
        stream.write_all(&encode_packet(&msg)).await.unwrap();
        let got = svc_rx.recv().await.unwrap();
        assert_eq!(got.command, "message");
        assert_eq!(got.source, "proc:b1");
    }
}
