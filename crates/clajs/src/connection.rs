use crate::error::ClajsError;
use crate::metrics::gauges;
use crate::room::{CloseReason, ConnHandle, ConnReceivers, DisconnectReason};
use crate::server::ServerState;
use claj_common::frame::Frame;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval, timeout, Duration};
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Outbound frames queued per connection before relayed traffic is dropped.
pub const OUTBOUND_QUEUE: usize = 256;

/// Upper bound on flushing pending frames and the close frame to a socket
/// that is going away.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

struct ActiveGuard {
    state: Arc<ServerState>,
}

impl ActiveGuard {
    fn new(state: Arc<ServerState>) -> Self {
        state.active_connections.fetch_add(1, Ordering::Relaxed);
        gauges::inc_connections_active();
        Self { state }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::Relaxed);
        gauges::dec_connections_active();
    }
}

fn close_frame(reason: CloseReason) -> CloseFrame<'static> {
    let code = match reason {
        CloseReason::Closed => CloseCode::Policy,
        CloseReason::Error => CloseCode::Protocol,
    };
    CloseFrame {
        code,
        reason: reason.as_str().into(),
    }
}

/// Echo the relay subprotocol if the client offered it.
fn negotiate_protocol(req: &Request<()>, mut resp: Response<()>) -> Response<()> {
    let offered = req
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|protos| {
            protos
                .split(',')
                .map(str::trim)
                .any(|p| p == claj_common::types::PROTOCOL_VERSION)
        });
    if offered {
        resp.headers_mut().insert(
            "sec-websocket-protocol",
            HeaderValue::from_static(claj_common::types::PROTOCOL_VERSION),
        );
    }
    resp
}

/// Write whatever is still queued for the socket, then the close frame.
async fn flush_and_close(ws_tx: &mut WsSink, rx: &mut ConnReceivers, reason: CloseReason) {
    let flush = async {
        while let Ok(data) = rx.frames.try_recv() {
            ws_tx.feed(Message::Binary(data)).await?;
        }
        ws_tx
            .send(Message::Close(Some(close_frame(reason))))
            .await
    };
    match timeout(CLOSE_FLUSH_TIMEOUT, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("failed to send close frame: {}", e),
        Err(_) => tracing::debug!("timed out sending close frame"),
    }
}

/// Drive one connection: read frames into the router, write queued frames
/// out, and watch for close requests, idleness and shutdown.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    rx: &mut ConnReceivers,
    state: &ServerState,
    conn: &ConnHandle,
    shutdown: &mut watch::Receiver<()>,
) -> DisconnectReason {
    let mut ping_interval = interval(Duration::from_secs(state.config.ping_interval));
    let idle_timeout = Duration::from_secs(state.config.idle_timeout);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Binary(data))) => match Frame::parse(&data) {
                        Ok(frame) => state.router.on_message(conn, frame),
                        Err(e) => {
                            tracing::debug!(conn = %conn.id, "malformed frame: {}", e);
                            return DisconnectReason::Error;
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        state.router.on_message(conn, Frame::KeepAlive);
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            tracing::debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        tracing::debug!(conn = %conn.id, "text message on binary protocol");
                        return DisconnectReason::Error;
                    }
                    Some(Ok(Message::Close(_))) | None => return DisconnectReason::Closed,
                    Some(Err(e)) => {
                        tracing::debug!(conn = %conn.id, "websocket error: {}", e);
                        return DisconnectReason::Error;
                    }
                    _ => {}
                }
            }
            Some(data) = rx.frames.recv() => {
                if let Err(e) = ws_tx.send(Message::Binary(data)).await {
                    tracing::debug!(conn = %conn.id, "write failed: {}", e);
                    return DisconnectReason::Error;
                }
            }
            changed = rx.close.changed() => {
                if changed.is_err() {
                    return DisconnectReason::Closed;
                }
                if let Some(reason) = *rx.close.borrow_and_update() {
                    return DisconnectReason::Kicked(reason);
                }
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    tracing::debug!(conn = %conn.id, "idle timeout reached, closing connection");
                    return DisconnectReason::Timeout;
                }
                if let Err(e) = ws_tx.send(Message::Ping(vec![])).await {
                    tracing::debug!("failed to send ping: {}", e);
                }
            }
            _ = shutdown.changed() => return DisconnectReason::Shutdown,
        }
    }
}

/// Serve one accepted TCP stream until it disconnects.
///
/// # Errors
///
/// Returns an error if the WebSocket handshake fails.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), ClajsError> {
    let frame_limit = state.config.max_payload + 1;
    let ws_config = WebSocketConfig {
        max_message_size: Some(frame_limit),
        max_frame_size: Some(frame_limit),
        ..WebSocketConfig::default()
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |req: &Request<()>, resp: Response<()>| Ok(negotiate_protocol(req, resp)),
        Some(ws_config),
    )
    .await?;

    let _active = ActiveGuard::new(state.clone());
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (conn, mut rx) = ConnHandle::new(state.next_conn_id(), peer_addr, OUTBOUND_QUEUE);

    if !state.router.on_connect(&conn) {
        flush_and_close(&mut ws_tx, &mut rx, CloseReason::Closed).await;
        return Ok(());
    }
    tracing::info!(conn = %conn.id, addr = %peer_addr, "connection received");

    let reason = run_message_loop(
        &mut ws_tx,
        &mut ws_rx,
        &mut rx,
        &state,
        &conn,
        &mut shutdown,
    )
    .await;

    state.router.on_disconnect(&conn, reason);
    tracing::info!(conn = %conn.id, addr = %peer_addr, %reason, "connection lost");

    match reason {
        DisconnectReason::Kicked(close) => flush_and_close(&mut ws_tx, &mut rx, close).await,
        DisconnectReason::Shutdown => {
            flush_and_close(&mut ws_tx, &mut rx, CloseReason::Closed).await;
        }
        DisconnectReason::Timeout => {
            let _ = ws_tx.send(Message::Close(None)).await;
        }
        DisconnectReason::Closed | DisconnectReason::Error => {}
    }
    Ok(())
}
