use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::api::types::{
    EnvironmentPayload, EnvironmentsListResponse, EnvironmentsQuery, Pagination,
};
use crate::domain::{
    ActionType, Actor, AuditEvent, AuditKind, AuditLevel, Environment, EnvironmentFilter, Page,
};
use crate::repository::EnvironmentRepository as _;

fn page_from(page: Option<u32>, page_size: Option<u32>) -> Page {
    Page {
        page: page.unwrap_or(1),
        page_size: page_size.unwrap_or(50),
    }
    .clamped()
}

fn validated(env: Environment) -> ApiResult<Environment> {
    let errors = env.validate();
    if errors.is_empty() {
        return Ok(env);
    }
    Err(
        ApiError::validation("environment failed validation").with_details(json!({
            "errors": errors,
        })),
    )
}

fn config_audit(action: ActionType, env: &Environment, actor: &Actor) -> AuditEvent {
    AuditEvent::new(
        AuditKind::Action,
        AuditLevel::Info,
        format!("environment {}d", action.as_str()),
    )
    .environment(env.id, &env.name)
    .actor(actor)
    .action(action)
}

/// GET /api/v1/environments
pub async fn list_environments(
    State(state): State<AppState>,
    Query(query): Query<EnvironmentsQuery>,
) -> ApiResult<Json<EnvironmentsListResponse>> {
    let filter = EnvironmentFilter {
        health: query.health,
        check_enabled: query.check_enabled,
        name: query.name,
    };
    let page = page_from(query.page, query.page_size);

    let environments = state.store.list_environments(&filter, page).await?;
    let total = state.store.count_environments(&filter).await?;

    Ok(Json(EnvironmentsListResponse {
        environments,
        pagination: Pagination {
            page: page.page,
            page_size: page.page_size,
            total,
        },
    }))
}

/// POST /api/v1/environments
pub async fn create_environment(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(payload): Json<EnvironmentPayload>,
) -> ApiResult<(StatusCode, Json<Environment>)> {
    let env = validated(payload.into_new_environment())?;
    state.store.create_environment(&env).await?;
    state.audit.append(config_audit(ActionType::Create, &env, &actor));
    debug!(environment = %env.name, "environment created");
    Ok((StatusCode::CREATED, Json(env)))
}

/// GET /api/v1/environments/:id
pub async fn get_environment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Environment>> {
    Ok(Json(state.store.get_environment(id).await?))
}

/// PUT /api/v1/environments/:id
pub async fn update_environment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(actor): Extension<Actor>,
    Json(payload): Json<EnvironmentPayload>,
) -> ApiResult<Json<Environment>> {
    let existing = state.store.get_environment(id).await?;
    let env = validated(payload.apply_to(existing))?;
    let updated = state.store.update_environment(&env).await?;
    state
        .audit
        .append(config_audit(ActionType::Update, &updated, &actor));
    Ok(Json(updated))
}

/// DELETE /api/v1/environments/:id
pub async fn delete_environment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(actor): Extension<Actor>,
) -> ApiResult<StatusCode> {
    let env = state.store.get_environment(id).await?;
    state.store.delete_environment(id).await?;
    state.audit.append(config_audit(ActionType::Delete, &env, &actor));
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/environments/:id/check-health: enqueue an immediate probe
pub async fn check_health(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    // 404 for unknown ids before accepting the work.
    state.store.get_environment(id).await?;

    let prober = state.prober.clone();
    tokio::spawn(async move {
        if let Err(e) = prober.probe(id).await {
            debug!(environment = %id, "on-demand probe failed: {e}");
        }
    });
    Ok(StatusCode::NO_CONTENT)
}
