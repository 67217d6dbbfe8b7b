use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a health state that starts out not ready.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the service as ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// # Errors
///
/// Returns an error if installing the recorder or binding the HTTP server fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler - returns 200 if server is running.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Readiness check handler - returns 200 once the relay is accepting, 503 before.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

/// Connection and room gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("claj_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("claj_connections_active").decrement(1.0);
    }

    /// Set the number of live rooms.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_rooms_active(count: usize) {
        metrics::gauge!("claj_rooms_active").set(count as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Increment the rooms-created counter.
    pub fn rooms_created_total() {
        metrics::counter!("claj_rooms_created_total").increment(1);
    }

    /// Record a join attempt with the given outcome label.
    pub fn joins_total(status: &'static str) {
        metrics::counter!("claj_joins_total", "status" => status).increment(1);
    }

    /// Increment the relayed-messages counter.
    pub fn messages_relayed_total() {
        metrics::counter!("claj_messages_relayed_total").increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("claj_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Record a forced disconnect with the given reason label.
    pub fn kicks_total(reason: &'static str) {
        metrics::counter!("claj_kicks_total", "reason" => reason).increment(1);
    }

    /// Record bytes relayed.
    pub fn payload_bytes_total(bytes: u64) {
        metrics::counter!("claj_payload_bytes_total").increment(bytes);
    }
}
