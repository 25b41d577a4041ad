use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use palaver_telemetry::{names, MetricsRecorder};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::broadcast::Broadcaster;
use crate::client::{self, ConnectionRegistry};
use crate::rooms::{RoomRegistry, DEFAULT_HISTORY_LIMIT};
use crate::session::Session;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub history_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            max_send_queue: 256,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl ServerConfig {
    /// Configuration from the environment: `PORT` selects the listen port.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        config
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub connections: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomRegistry>,
    pub broadcaster: Broadcaster,
    pub metrics: Option<Arc<MetricsRecorder>>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps it alive.
pub async fn start(
    config: ServerConfig,
    metrics: Option<Arc<MetricsRecorder>>,
) -> Result<ServerHandle, std::io::Error> {
    let connections = Arc::new(ConnectionRegistry::new(config.max_send_queue));
    let rooms = Arc::new(RoomRegistry::new(config.history_limit));
    let broadcaster = Broadcaster::new(Arc::clone(&connections)).with_metrics(metrics.clone());

    // Sweep connections whose transport died without a close frame.
    let cleanup = client::start_cleanup_task(
        Arc::clone(&connections),
        std::time::Duration::from_secs(60),
    );

    let state = AppState {
        connections,
        rooms,
        broadcaster,
        metrics,
    };

    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "relay server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
        _cleanup: cleanup,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (conn_id, rx) = state.connections.register();
    tracing::info!(connection_id = %conn_id, "client connected");
    if let Some(metrics) = &state.metrics {
        metrics.counter_inc(names::CONNECTIONS_OPENED, 1);
        metrics.gauge_set(names::CONNECTIONS_OPEN, state.connections.count() as i64);
    }

    let session = Session::new(
        conn_id.clone(),
        Arc::clone(&state.rooms),
        state.broadcaster.clone(),
        state.metrics.clone(),
    );

    client::handle_connection(socket, session, rx, Arc::clone(&state.connections)).await;

    tracing::info!(connection_id = %conn_id, "client disconnected");
    if let Some(metrics) = &state.metrics {
        metrics.counter_inc(names::CONNECTIONS_CLOSED, 1);
        metrics.gauge_set(names::CONNECTIONS_OPEN, state.connections.count() as i64);
    }
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "connections": state.connections.count(),
        "rooms": state.rooms.len(),
    }))
}
