//! Health and metrics HTTP endpoints (served on the health port).

use axum::extract::State;
use axum::Json;

use crate::degradation::DegradationLevel;
use crate::state::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let level = state.degradation.level();
    let status = match level {
        DegradationLevel::Normal => "ok",
        _ => "degraded",
    };
    let providers: Vec<serde_json::Value> = state
        .llm
        .registry()
        .health_snapshot()
        .into_iter()
        .map(|(id, healthy)| serde_json::json!({ "id": id, "healthy": healthy }))
        .collect();

    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.started_at.elapsed().as_secs(),
        "providers": providers,
        "agents": state.supervisor.list().len(),
        "connections": state.clients.count(),
        "timestamp": chrono::Utc::now(),
    }))
}

/// GET /metrics — Prometheus exposition.
pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}
