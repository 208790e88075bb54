use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::credentials::CredentialMeta;
use crate::domain::{ActionType, Actor, AuditEvent, AuditKind, AuditLevel, CredentialKind};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCredentialRequest {
    pub kind: CredentialKind,
    #[serde(default)]
    pub label: String,
    /// Private key or password. Encrypted at rest; never returned.
    pub secret: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCredentialResponse {
    pub credential_id: Uuid,
}

/// POST /api/v1/credentials
pub async fn create_credential(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<CreateCredentialRequest>,
) -> ApiResult<(StatusCode, Json<CreateCredentialResponse>)> {
    if request.secret.is_empty() {
        return Err(ApiError::validation("secret must not be empty"));
    }

    let credential_id = state
        .credentials
        .create(request.kind, &request.label, &request.secret)
        .await?;

    state.audit.append(
        AuditEvent::new(AuditKind::Action, AuditLevel::Info, "credential created")
            .actor(&actor)
            .action(ActionType::Create)
            .detail("credentialId", credential_id.to_string())
            .detail("label", request.label),
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateCredentialResponse { credential_id }),
    ))
}

/// GET /api/v1/credentials (metadata only, never material)
pub async fn list_credentials(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<CredentialMeta>>> {
    Ok(Json(state.credentials.list().await?))
}

/// DELETE /api/v1/credentials/:id
pub async fn delete_credential(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(actor): Extension<Actor>,
) -> ApiResult<StatusCode> {
    state.credentials.delete(id).await?;
    state.audit.append(
        AuditEvent::new(AuditKind::Action, AuditLevel::Info, "credential deleted")
            .actor(&actor)
            .action(ActionType::Delete)
            .detail("credentialId", id.to_string()),
    );
    Ok(StatusCode::NO_CONTENT)
}
