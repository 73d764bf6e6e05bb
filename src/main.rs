//! SFU Server - Main Entry Point
//!
//! Standalone Selective Forwarding Unit for real-time audio conferencing.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sfu_server::config::Config;
use sfu_server::{api, sfu};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (required for WebRTC DTLS).
    // This must happen before any TLS/WebRTC operations.
    let _ =
        rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider());

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let default_filter = if config.debug {
        "sfu_server=debug"
    } else {
        "sfu_server=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        debug = config.debug,
        verbose_log = config.verbose_log,
        "Starting SFU server"
    );
    info!(
        stun_servers = ?config.stun_servers,
        disable_stun = config.disable_stun,
        max_peers = config.max_peers,
        "ICE configuration"
    );

    let webrtc_api = sfu::engine::build_api(&config)?;
    let state = api::AppState::new(config.clone(), webrtc_api);

    // Idle room sweeper.
    let rooms = Arc::clone(&state.rooms);
    let room_idle = config.room_idle;
    let mut ticker = tokio::time::interval(config.sweep_interval);
    let sweeper = tokio::spawn(async move {
        info!(
            interval_secs = ticker.period().as_secs(),
            idle_secs = room_idle.as_secs(),
            "Room cleanup task started"
        );
        loop {
            ticker.tick().await;
            rooms.cleanup_empty_rooms(room_idle).await;
        }
    });

    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(address = %listener.local_addr()?, "SFU server listening");
    info!("Endpoints: / and /client (client WebSocket), /server (server WebSocket), /health (HTTP)");

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Received shutdown signal, initiating graceful shutdown");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    sweeper.abort();
    let _ = sweeper.await;
    info!("Server shutdown complete");

    Ok(())
}
