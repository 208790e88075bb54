use axum::extract::{Path, Query, State};
use axum::Json;
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::api::types::{CountResponse, LogsListResponse, LogsQuery, Pagination};
use crate::domain::{AuditEvent, Page};
use crate::repository::AuditRepository as _;

fn page_from(query: &LogsQuery) -> Page {
    Page {
        page: query.page.unwrap_or(1),
        page_size: query.page_size.unwrap_or(50),
    }
    .clamped()
}

/// GET /api/v1/logs
pub async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsListResponse>> {
    let filter = query.filter();
    let page = page_from(&query);

    let logs = state.store.list_audit(&filter, page).await?;
    let total = state.store.count_audit(&filter).await?;

    Ok(Json(LogsListResponse {
        logs,
        pagination: Pagination {
            page: page.page,
            page_size: page.page_size,
            total,
        },
    }))
}

/// GET /api/v1/logs/count
pub async fn count_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<CountResponse>> {
    let count = state.store.count_audit(&query.filter()).await?;
    Ok(Json(CountResponse { count }))
}

/// GET /api/v1/logs/:id
pub async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AuditEvent>> {
    Ok(Json(state.store.get_audit(id).await?))
}
