use crate::blacklist::Blacklist;
use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::ClajsError;
use crate::room::ConnId;
use crate::router::{EventRouter, SpamPolicy};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Time allowed for in-flight connections to finish after shutdown.
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Shared state for the relay server.
pub struct ServerState {
    /// Dispatches connection events to rooms.
    pub router: EventRouter,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Connections past the WebSocket handshake.
    pub active_connections: AtomicUsize,
    next_conn_id: AtomicU64,
}

impl ServerState {
    /// Build server state around `blacklist`.
    #[must_use]
    pub fn new(config: ServerConfig, blacklist: Arc<Blacklist>) -> Self {
        let policy = SpamPolicy::from(&config);
        Self {
            router: EventRouter::new(blacklist, policy),
            config,
            active_connections: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocate an identity for a new connection.
    pub fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), ClajsError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the server accept loop with an externally-controlled shutdown signal.
///
/// When the sender side of `shutdown` fires or is dropped, the accept loop
/// stops, every connection is closed, and in-flight tasks get up to 30
/// seconds to finish.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), ClajsError> {
    let local_addr = listener.local_addr().map_err(ClajsError::Io)?;
    info!("relay hosted on {}", local_addr);
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if state.active_connections.load(Ordering::Relaxed) >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        let state = Arc::clone(&state);
                        let shutdown = shutdown.clone();
                        tasks.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state, shutdown).await {
                                tracing::debug!("connection from {} failed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            _ = shutdown.changed() => {
                info!("shutdown signal received, draining {} connections", tasks.len());
                break;
            }
        }
    }

    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout_at(deadline, drain).await.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            tasks.len()
        );
        tasks.abort_all();
    }

    info!("server shut down gracefully");
    Ok(())
}
