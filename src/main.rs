// SPDX-FileCopyrightText: 2026 Skyrelay Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Skyrelay Server
//!
//! A relay server for flight simulator multiplayer position sharing.
//! Provides:
//! - WebSocket endpoint with RSA/AES session handshake and position fan-out
//! - Account create/delete sub-protocol over the same endpoint
//! - HTTP endpoints for health checks and Prometheus metrics

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tracing::{error, info, warn};

use skyrelay::config::RelayConfig;
use skyrelay::handler::{self, ConnectionDeps};
use skyrelay::http::{create_router, HttpState};
use skyrelay::metrics::RelayMetrics;
use skyrelay::session_registry::SessionRegistry;
use skyrelay::users::{JsonUserStore, MemoryUserStore, UserStore};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("skyrelay=info".parse().unwrap()),
        )
        .init();

    // Load configuration
    let config = RelayConfig::from_env();

    // HTTP listen address for health/metrics endpoints. Bound to
    // localhost by default; use RELAY_METRICS_ADDR to expose elsewhere.
    let http_addr =
        std::env::var("RELAY_METRICS_ADDR").unwrap_or_else(|_| "127.0.0.1:8081".to_string());

    info!("Starting Skyrelay Server v{}", env!("CARGO_PKG_VERSION"));
    info!("WebSocket: {}", config.listen_addr);
    info!("Metrics endpoint: {}", http_addr);
    info!("Auth timeout: {}s", config.auth_timeout_secs);
    info!("Idle timeout: {}s", config.idle_timeout_secs);
    if !config.deny_addrs.is_empty() {
        info!("Denylist: {} addresses", config.deny_addrs.len());
    }

    // Initialize the user registry
    let users: Arc<dyn UserStore> = match &config.users_path {
        Some(path) => {
            info!("User registry: {}", path.display());
            match JsonUserStore::open(path) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!("Failed to open user registry: {}", e);
                    std::process::exit(1);
                }
            }
        }
        None => {
            warn!("User registry: in-memory (accounts lost on restart)");
            Arc::new(MemoryUserStore::new())
        }
    };
    info!("Registered users: {}", users.user_count());

    // Initialize metrics and shared state
    let metrics = RelayMetrics::new();
    let registry = Arc::new(SessionRegistry::new());

    // Start HTTP server for health/metrics
    let http_state = HttpState {
        metrics: metrics.clone(),
        registry: registry.clone(),
    };
    let http_router = create_router(http_state);

    let http_listener = TcpListener::bind(&http_addr)
        .await
        .expect("Failed to bind HTTP listener");

    tokio::spawn(async move {
        info!("HTTP server listening on {}", http_addr);
        if let Err(e) = axum::serve(http_listener, http_router).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Start TCP listener for WebSocket
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .expect("Failed to bind WebSocket listener");

    info!("WebSocket server listening on {}", config.listen_addr);

    let config = Arc::new(config);

    // Accept connections
    while let Ok((stream, addr)) = listener.accept().await {
        // Denylist check happens before any protocol bytes are exchanged.
        if config.is_denied(&addr.ip()) {
            warn!("Connection refused by denylist: {}", addr.ip());
            metrics.connections_denied.inc();
            drop(stream);
            continue;
        }

        let users = users.clone();
        let registry = registry.clone();
        let metrics = metrics.clone();
        let config = config.clone();

        tokio::spawn(async move {
            // Bound the WebSocket upgrade too, so half-open connections
            // cannot hold a task forever.
            match tokio::time::timeout(config.auth_timeout(), accept_async(stream)).await {
                Ok(Ok(ws_stream)) => {
                    metrics.connections_total.inc();
                    metrics.connections_active.inc();
                    info!("New WebSocket connection from {}", addr);

                    handler::handle_connection(
                        ws_stream,
                        ConnectionDeps {
                            users,
                            registry,
                            metrics: metrics.clone(),
                            auth_timeout: config.auth_timeout(),
                            idle_timeout: config.idle_timeout(),
                            max_message_size: config.max_message_size,
                        },
                    )
                    .await;

                    metrics.connections_active.dec();
                    info!("WebSocket connection closed: {}", addr);
                }
                Ok(Err(e)) => {
                    error!("WebSocket handshake failed: {}", e);
                }
                Err(_) => {
                    warn!("WebSocket handshake timeout from {}", addr);
                }
            }
        });
    }
}
