//! HTTP Surface
//!
//! Router, shared state, and the health endpoint. WebSocket upgrades are
//! routed by path: `/server` enters server mode; every other path enters
//! client mode, so clients can be pointed at the bare origin (or at
//! `/client` explicitly).

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use webrtc::api::API;

use crate::config::Config;
use crate::sfu::{session, Coordinator, PeerRegistry, RoomRegistry, TrackRegistry};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Room registry: auth, membership, idle cleanup
    pub rooms: Arc<RoomRegistry>,
    /// Media-plane peer registry
    pub peers: Arc<PeerRegistry>,
    /// Forwarding-track registry
    pub tracks: Arc<TrackRegistry>,
    /// Signaling coordinator
    pub coordinator: Arc<Coordinator>,
    /// Shared WebRTC API (media engine, interceptors, setting engine)
    pub webrtc_api: Arc<API>,
}

impl AppState {
    /// Build the registries and coordinator around a configured WebRTC API.
    #[must_use]
    pub fn new(config: Config, webrtc_api: API) -> Self {
        let rooms = Arc::new(RoomRegistry::new());
        let peers = Arc::new(PeerRegistry::new());
        let tracks = Arc::new(TrackRegistry::new());
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&rooms),
            Arc::clone(&peers),
            Arc::clone(&tracks),
        ));

        Self {
            config: Arc::new(config),
            rooms,
            peers,
            tracks,
            coordinator,
            webrtc_api: Arc::new(webrtc_api),
        }
    }
}

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/server", get(server_ws_handler))
        .fallback(client_ws_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    timestamp: String,
}

/// Health check endpoint for monitoring systems.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "sfu",
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Server-mode WebSocket endpoint (`/server`).
async fn server_ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
) -> Response {
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| session::run_server_session(socket, state)),
        Err(_) => non_upgrade_response(),
    }
}

/// Client-mode WebSocket endpoint (every other path).
async fn client_ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
) -> Response {
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| session::run_client_session(socket, state)),
        Err(_) => non_upgrade_response(),
    }
}

fn non_upgrade_response() -> Response {
    (
        StatusCode::BAD_REQUEST,
        "This endpoint only accepts WebSocket connections. Use /health for health checks.",
    )
        .into_response()
}
