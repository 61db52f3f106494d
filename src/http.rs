// SPDX-FileCopyrightText: 2026 Skyrelay Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! HTTP Server for Health and Metrics Endpoints
//!
//! Side-port REST endpoints for monitoring the relay.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use crate::metrics::RelayMetrics;
use crate::session_registry::SessionRegistry;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub metrics: RelayMetrics,
    pub registry: Arc<SessionRegistry>,
}

/// Creates the HTTP router with health and metrics endpoints.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/", get(root_handler))
        .with_state(state)
}

/// Root handler - returns basic info.
async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "skyrelay",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/metrics"]
    }))
}

/// Health check endpoint - 200 whenever the server is running.
async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "authenticated_sessions": state.registry.session_count(),
    }))
}

/// Prometheus text exposition.
async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}
