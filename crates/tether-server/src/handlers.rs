//! Connection handlers and route table.
//!
//! One `Session::connect` per WebSocket upgrade; the upgrade task becomes
//! the connection's reader pump and spawns its writer pump.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use tether_core::{
    effective_channels, ChannelStore, Hub, MemoryBus, MemoryStore, PubSubBus, Session,
};
use tether_protocol::{codec, Outbound};

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::pump;

/// Shared server state.
pub struct AppState {
    /// The session registry.
    pub hub: Hub,
    /// Presence and channel-membership store.
    pub store: Arc<dyn ChannelStore>,
    /// The shared publish/subscribe bus.
    pub bus: Arc<dyn PubSubBus>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state backed by the in-process store and bus, with the
    /// configured global channels seeded.
    ///
    /// # Errors
    ///
    /// Returns an error if channel seeding fails.
    pub async fn new(config: Config) -> Result<Self> {
        let store: Arc<dyn ChannelStore> = Arc::new(MemoryStore::new());
        let bus: Arc<dyn PubSubBus> = Arc::new(MemoryBus::new());

        for channel in &config.channels.seed {
            store.add_global_channel(channel).await?;
        }

        Ok(Self {
            hub: Hub::spawn(),
            store,
            bus,
            config,
        })
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()).await?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = router(state);

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("tether server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws/:device", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the route table.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/:device", get(ws_handler))
        .route("/devices", get(list_devices_handler))
        .route("/devices/:device/channels", get(device_channels_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// List all present device tokens.
async fn list_devices_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_presence().await {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// List a device's effective channels (global ∪ personal).
async fn device_channels_handler(
    Path(device): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.store.list_presence().await {
        Ok(present) if !present.contains(&device) => {
            error_response(StatusCode::NOT_FOUND, "device not found")
        }
        Ok(_) => match effective_channels(state.store.as_ref(), &device).await {
            Ok(channels) => Json(channels.into_iter().collect::<Vec<_>>()).into_response(),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
        },
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

fn error_response(status: StatusCode, err: impl std::fmt::Display) -> axum::response::Response {
    (status, Json(serde_json::json!({ "err": err.to_string() }))).into_response()
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(device): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_device_socket(socket, device, state))
}

/// Drive one device connection for its lifetime.
async fn handle_device_socket(socket: WebSocket, device: String, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    debug!(device = %device, "WebSocket connected");

    let connected = Session::connect(
        device.clone(),
        state.hub.clone(),
        Arc::clone(&state.store),
        Arc::clone(&state.bus),
        state.config.limits.queue_capacity,
    )
    .await;

    let (session, outbound_rx) = match connected {
        Ok(pair) => pair,
        Err(e) => {
            warn!(device = %device, error = %e, "Connect failed; aborting upgrade");
            metrics::record_error("connect");
            reject(socket, &e).await;
            return;
        }
    };

    let (sender, receiver) = socket.split();
    let keepalive = state.config.keepalive.clone();
    let writer = tokio::spawn(pump::writer_pump(sender, outbound_rx, keepalive.clone()));

    // This task is the connection's reader pump; it tears the session down
    // on exit, which closes the queue and lets the writer finish.
    pump::reader_pump(receiver, Arc::clone(&session), &keepalive).await;

    if let Err(e) = writer.await {
        debug!(device = %device, error = %e, "Writer task ended abnormally");
    }

    debug!(device = %device, "WebSocket disconnected");
}

/// Report a failed connect on the raw socket and close it.
async fn reject(mut socket: WebSocket, err: impl std::fmt::Display) {
    if let Ok(payload) = codec::encode(&Outbound::error(err)) {
        let text = String::from_utf8_lossy(&payload).into_owned();
        let _ = socket.send(Message::Text(text)).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}
