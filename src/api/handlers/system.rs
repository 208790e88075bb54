use axum::extract::State;
use axum::Json;

use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::api::types::{HealthResponse, SystemStatusResponse};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// GET /api/v1/health, the unauthenticated readiness probe
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: VERSION,
    })
}

/// GET /api/v1/system/status
pub async fn system_status(State(state): State<AppState>) -> ApiResult<Json<SystemStatusResponse>> {
    let connected_sessions = state.hub.session_count().await.unwrap_or(0);
    Ok(Json(SystemStatusResponse {
        status: "running",
        version: VERSION,
        uptime_seconds: state.uptime_seconds(),
        connected_sessions,
        running_operations: state.executor.running_operations(),
    }))
}
