//! HTTP surface: the WebSocket endpoint on the gateway port and the
//! health/metrics endpoints on the health port.

pub mod auth;
mod health;
mod ws;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Router bound to the gateway port.
pub fn gateway_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::client_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router bound to the health port.
pub fn health_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics))
        .with_state(state)
}
