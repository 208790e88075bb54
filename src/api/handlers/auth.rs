use axum::extract::State;
use axum::Json;
use tracing::warn;

use crate::api::auth::verify_password;
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::api::types::{LoginRequest, LoginResponse, UserView};
use crate::domain::{ActionType, Actor, AuditEvent, AuditKind, AuditLevel};
use crate::error::OpsdeckError;
use crate::repository::UserRepository as _;

/// POST /api/v1/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    if request.username.trim().is_empty() || request.password.is_empty() {
        return Err(ApiError::validation("username and password are required"));
    }

    let user = match state.store.get_user_by_username(&request.username).await {
        Ok(user) => user,
        Err(OpsdeckError::NotFound(_)) => return Err(reject(&state, &request.username)),
        Err(other) => return Err(other.into()),
    };

    if user.disabled || !verify_password(&request.password, &user.password_hash) {
        return Err(reject(&state, &request.username));
    }

    let (token, expires_at) = state.auth.issue(&user)?;
    let actor = Actor {
        id: user.id,
        name: user.username.clone(),
    };
    state.audit.append(
        AuditEvent::new(AuditKind::Auth, AuditLevel::Success, "logged in")
            .actor(&actor)
            .action(ActionType::Login),
    );

    Ok(Json(LoginResponse {
        token,
        user: UserView {
            id: user.id,
            username: user.username,
        },
        expires_at,
    }))
}

/// One rejection path for unknown users, wrong passwords and disabled
/// accounts, so responses cannot be used to enumerate usernames.
fn reject(state: &AppState, username: &str) -> ApiError {
    warn!(username, "rejected login attempt");
    state.audit.append(
        AuditEvent::new(AuditKind::Auth, AuditLevel::Warn, "rejected login attempt")
            .action(ActionType::Login)
            .detail("username", username),
    );
    ApiError::unauthorized("invalid username or password")
}
