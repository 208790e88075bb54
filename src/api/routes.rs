use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::error;

use crate::api::auth::require_auth;
use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::api::handlers;
use crate::api::websocket::websocket_handler;
use crate::domain::{AuditEvent, AuditKind, AuditLevel};

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    if origins.is_empty() {
        layer
    } else {
        layer.allow_origin(origins)
    }
}

/// Recovery boundary: a panicking handler becomes a 500 with the standard
/// envelope and an error audit event, instead of a dropped connection.
async fn recover_panics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(%method, path, "handler panicked: {message}");
            state.audit.append(AuditEvent::new(
                AuditKind::Error,
                AuditLevel::Error,
                format!("handler panicked on {method} {path}: {message}"),
            ));
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "internal server error",
            )
            .into_response()
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub fn create_router(
    state: AppState,
    allowed_origins: &[String],
    request_timeout: Duration,
) -> Router {
    let cors = build_cors_layer(allowed_origins);

    let public = Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/auth/login", post(handlers::login));

    let protected = Router::new()
        .route(
            "/api/v1/environments",
            get(handlers::list_environments).post(handlers::create_environment),
        )
        .route(
            "/api/v1/environments/:id",
            get(handlers::get_environment)
                .put(handlers::update_environment)
                .delete(handlers::delete_environment),
        )
        .route("/api/v1/environments/:id/restart", post(handlers::restart))
        .route(
            "/api/v1/environments/:id/check-health",
            post(handlers::check_health),
        )
        .route(
            "/api/v1/environments/:id/versions",
            get(handlers::list_versions),
        )
        .route("/api/v1/environments/:id/upgrade", post(handlers::upgrade))
        .route(
            "/api/v1/credentials",
            get(handlers::list_credentials).post(handlers::create_credential),
        )
        .route(
            "/api/v1/credentials/:id",
            axum::routing::delete(handlers::delete_credential),
        )
        .route("/api/v1/logs", get(handlers::list_logs))
        .route("/api/v1/logs/count", get(handlers::count_logs))
        .route("/api/v1/logs/:id", get(handlers::get_log))
        .route("/api/v1/system/status", get(handlers::system_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public)
        .merge(protected)
        // WebSocket endpoint; the timeout only bounds the upgrade response,
        // never the upgraded connection.
        .route("/ws", get(websocket_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            recover_panics,
        ))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(cors)
        .with_state(state)
}
