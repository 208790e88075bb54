use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::api::types::{OperationResponse, RestartRequest, UpgradeRequest, VersionsResponse};
use crate::domain::Actor;

/// POST /api/v1/environments/:id/restart
pub async fn restart(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(actor): Extension<Actor>,
    request: Option<Json<RestartRequest>>,
) -> ApiResult<(StatusCode, Json<OperationResponse>)> {
    let Json(request) = request.unwrap_or_default();
    let operation = state.executor.restart(id, request.force, Some(actor)).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(OperationResponse {
            operation_id: operation.operation_id,
            status: operation.status,
        }),
    ))
}

/// POST /api/v1/environments/:id/upgrade
pub async fn upgrade(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<UpgradeRequest>,
) -> ApiResult<(StatusCode, Json<OperationResponse>)> {
    let operation = state
        .executor
        .upgrade(id, &request.version, request.force, Some(actor))
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(OperationResponse {
            operation_id: operation.operation_id,
            status: operation.status,
        }),
    ))
}

/// GET /api/v1/environments/:id/versions
///
/// Upstream transport failures surface as 502 through the error mapping.
pub async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<VersionsResponse>> {
    let info = state.executor.list_versions(id).await?;
    Ok(Json(VersionsResponse {
        current_version: info.current,
        available_versions: info.available,
    }))
}
