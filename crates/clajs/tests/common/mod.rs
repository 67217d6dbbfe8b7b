#![allow(dead_code)]

use claj_common::frame::Frame;
use claj_common::types::NEW_ROOM;
use clajs::blacklist::{Blacklist, BlockedNet};
use clajs::config::ServerConfig;
use clajs::server::ServerState;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: None,
        max_conns: 1000,
        spam_limit: 300,
        spam_window_ms: 3_000,
        host_grace_ms: 60_000,
        max_payload: 65_535,
        ping_interval: 30,
        idle_timeout: 120,
        blacklist_url: None,
        blacklist_refresh: 0,
        block: Vec::new(),
    }
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    pub ws_rx: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
}

/// What the server sent next.
#[derive(Debug)]
pub enum Event {
    Frame(Frame),
    Closed(Option<CloseFrame<'static>>),
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        let url = format!("ws://{addr}");
        let mut req = url.into_client_request().unwrap();
        req.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            claj_common::types::PROTOCOL_VERSION.parse().unwrap(),
        );
        let (ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx }
    }

    pub async fn send_frame(&mut self, frame: &Frame) {
        self.ws_tx
            .send(Message::Binary(frame.serialize()))
            .await
            .unwrap();
    }

    pub async fn send_link(&mut self, link: &str) {
        self.send_frame(&Frame::link(link)).await;
    }

    pub async fn send_payload(&mut self, payload: &[u8]) {
        self.send_frame(&Frame::payload(payload)).await;
    }

    pub async fn send_keepalive(&mut self) {
        self.send_frame(&Frame::keep_alive()).await;
    }

    /// Open a room and return its code.
    pub async fn create_room(&mut self) -> String {
        self.send_link(NEW_ROOM).await;
        match self.recv_frame().await {
            Frame::Link(code) => code,
            other => panic!("expected room code, got {other:?}"),
        }
    }

    pub async fn close(&mut self) {
        self.ws_tx.send(Message::Close(None)).await.unwrap();
    }

    pub async fn next_event(&mut self) -> Event {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for server");
            match msg {
                Some(Ok(Message::Binary(data))) => return Event::Frame(Frame::parse(&data).unwrap()),
                Some(Ok(Message::Close(frame))) => return Event::Closed(frame),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(other)) => panic!("expected binary frame, got {other:?}"),
                None | Some(Err(_)) => return Event::Closed(None),
            }
        }
    }

    pub async fn recv_frame(&mut self) -> Frame {
        match self.next_event().await {
            Event::Frame(frame) => frame,
            Event::Closed(close) => panic!("expected frame, connection closed: {close:?}"),
        }
    }

    pub async fn recv_frame_timeout(&mut self, timeout: Duration) -> Option<Event> {
        tokio::time::timeout(timeout, self.next_event()).await.ok()
    }

    /// Wait for the server's close frame and return its reason text,
    /// failing on any frame seen first.
    pub async fn expect_close(&mut self) -> String {
        match self.next_event().await {
            Event::Closed(Some(frame)) => frame.reason.into_owned(),
            Event::Closed(None) => String::new(),
            Event::Frame(frame) => panic!("expected close, got {frame:?}"),
        }
    }
}

pub fn make_state(config: ServerConfig) -> Arc<ServerState> {
    let fixed: Vec<BlockedNet> = config.blocked_nets().unwrap();
    Arc::new(ServerState::new(config, Arc::new(Blacklist::new(fixed))))
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    start_server_with(|_| {}).await
}

pub async fn start_server_with(
    tweak: impl FnOnce(&mut ServerConfig),
) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    tweak(&mut config);
    let state = make_state(config);

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = clajs::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
