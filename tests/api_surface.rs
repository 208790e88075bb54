//! API boundary: auth, CRUD, status codes and the JSON error envelope,
//! exercised through the router with tower's oneshot.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::{spawn_app, TestApp, TEST_PASSWORD, TEST_USERNAME};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn environment_body(name: &str) -> Value {
    json!({
        "name": name,
        "target": {"host": "10.1.2.3", "port": 8080},
        "healthCheck": {
            "enabled": true,
            "endpoint": "/health",
            "method": "GET",
            "intervalSecs": 30,
            "timeoutMs": 5000,
            "validation": {"statusCode": 200}
        }
    })
}

async fn create_environment(app: &TestApp, name: &str) -> Value {
    let (status, body) = send(
        &app.router,
        request(
            Method::POST,
            "/api/v1/environments",
            Some(&app.token),
            Some(environment_body(name)),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body
}

#[tokio::test]
async fn test_health_is_public() {
    let app = spawn_app().await;
    let (status, body) = send(
        &app.router,
        request(Method::GET, "/api/v1/health", None, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_login_round_trip_and_bad_credentials() {
    let app = spawn_app().await;

    let (status, body) = send(
        &app.router,
        request(
            Method::POST,
            "/api/v1/auth/login",
            None,
            Some(json!({"username": TEST_USERNAME, "password": TEST_PASSWORD})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["token"].is_string());
    assert_eq!(body["user"]["username"], TEST_USERNAME);
    assert!(body["expiresAt"].is_string());

    // The issued token works against a protected route.
    let token = body["token"].as_str().unwrap().to_string();
    let (status, _) = send(
        &app.router,
        request(Method::GET, "/api/v1/environments", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app.router,
        request(
            Method::POST,
            "/api/v1/auth/login",
            None,
            Some(json!({"username": TEST_USERNAME, "password": "wrong"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn test_protected_routes_require_bearer_token() {
    let app = spawn_app().await;

    let (status, body) = send(
        &app.router,
        request(Method::GET, "/api/v1/environments", None, None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let (status, _) = send(
        &app.router,
        request(Method::GET, "/api/v1/environments", Some("not-a-jwt"), None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_environment_crud_round_trip() {
    let app = spawn_app().await;

    let created = create_environment(&app, "api-prod").await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["name"], "api-prod");
    assert_eq!(created["status"]["health"], "unknown");

    // getById returns the same aggregate
    let (status, fetched) = send(
        &app.router,
        request(
            Method::GET,
            &format!("/api/v1/environments/{id}"),
            Some(&app.token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], created["id"]);
    assert_eq!(fetched["name"], "api-prod");

    // update is read back on getById
    let mut updated_body = environment_body("api-prod");
    updated_body["healthCheck"]["intervalSecs"] = json!(60);
    let (status, updated) = send(
        &app.router,
        request(
            Method::PUT,
            &format!("/api/v1/environments/{id}"),
            Some(&app.token),
            Some(updated_body),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["healthCheck"]["intervalSecs"], 60);

    // list includes it with pagination metadata
    let (status, listed) = send(
        &app.router,
        request(Method::GET, "/api/v1/environments", Some(&app.token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["environments"].as_array().unwrap().len(), 1);
    assert_eq!(listed["pagination"]["total"], 1);

    // delete, then 404
    let (status, _) = send(
        &app.router,
        request(
            Method::DELETE,
            &format!("/api/v1/environments/{id}"),
            Some(&app.token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(
        &app.router,
        request(
            Method::GET,
            &format!("/api/v1/environments/{id}"),
            Some(&app.token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_duplicate_name_returns_conflict() {
    let app = spawn_app().await;
    create_environment(&app, "duplicated").await;

    let (status, body) = send(
        &app.router,
        request(
            Method::POST,
            "/api/v1/environments",
            Some(&app.token),
            Some(environment_body("duplicated")),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "already_exists");
}

#[tokio::test]
async fn test_interval_below_minimum_is_rejected() {
    let app = spawn_app().await;
    let mut body = environment_body("too-fast");
    body["healthCheck"]["intervalSecs"] = json!(4);

    let (status, response) = send(
        &app.router,
        request(
            Method::POST,
            "/api/v1/environments",
            Some(&app.token),
            Some(body),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"]["code"], "validation");
    let errors = response["error"]["details"]["errors"].as_array().unwrap();
    assert!(errors.iter().any(|e| e.as_str().unwrap().contains("intervalSecs")));
}

#[tokio::test]
async fn test_restart_unknown_environment_is_404() {
    let app = spawn_app().await;
    let (status, body) = send(
        &app.router,
        request(
            Method::POST,
            &format!("/api/v1/environments/{}/restart", Uuid::new_v4()),
            Some(&app.token),
            Some(json!({"force": false})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_versions_against_unreachable_registry_is_502() {
    let app = spawn_app().await;
    let mut body = environment_body("dead-upstream");
    body["upgrade"] = json!({
        "enabled": true,
        "versionList": {"url": "http://127.0.0.1:1/versions", "method": "GET"},
        "jsonPathResponse": "$.versions[*]",
        "upgradeCommand": {"kind": "http", "url": "http://127.0.0.1:1/deploy", "method": "POST"}
    });

    let (status, created) = send(
        &app.router,
        request(
            Method::POST,
            "/api/v1/environments",
            Some(&app.token),
            Some(body),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_str().unwrap();

    let (status, body) = send(
        &app.router,
        request(
            Method::GET,
            &format!("/api/v1/environments/{id}/versions"),
            Some(&app.token),
            None,
        ),
    )
    .await;
    assert!(
        status == StatusCode::BAD_GATEWAY || status == StatusCode::GATEWAY_TIMEOUT,
        "got {status}"
    );
    assert!(body["error"]["code"].is_string());
}

#[tokio::test]
async fn test_logs_capture_config_actions() {
    let app = spawn_app().await;
    let created = create_environment(&app, "audited-env").await;
    let id = created["id"].as_str().unwrap();

    // The sink flushes on shutdown; then the log API serves the events.
    app.flush_audit().await;

    let (status, listed) = send(
        &app.router,
        request(
            Method::GET,
            &format!("/api/v1/logs?environmentId={id}"),
            Some(&app.token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let logs = listed["logs"].as_array().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["actionType"], "create");
    assert_eq!(logs[0]["actorName"], TEST_USERNAME);

    let log_id = logs[0]["id"].as_str().unwrap();
    let (status, log) = send(
        &app.router,
        request(
            Method::GET,
            &format!("/api/v1/logs/{log_id}"),
            Some(&app.token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(log["environmentName"], "audited-env");

    let (status, count) = send(
        &app.router,
        request(
            Method::GET,
            "/api/v1/logs/count?kind=action",
            Some(&app.token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(count["count"], 1);
}

#[tokio::test]
async fn test_credentials_lifecycle_never_leaks_material() {
    let app = spawn_app().await;

    let (status, created) = send(
        &app.router,
        request(
            Method::POST,
            "/api/v1/credentials",
            Some(&app.token),
            Some(json!({"kind": "password", "label": "prod ssh", "secret": "hunter2"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["credentialId"].as_str().unwrap().to_string();

    let (status, listed) = send(
        &app.router,
        request(Method::GET, "/api/v1/credentials", Some(&app.token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let listing = listed.to_string();
    assert!(listing.contains("prod ssh"));
    assert!(!listing.contains("hunter2"));

    let (status, _) = send(
        &app.router,
        request(
            Method::DELETE,
            &format!("/api/v1/credentials/{id}"),
            Some(&app.token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &app.router,
        request(
            Method::DELETE,
            &format!("/api/v1/credentials/{id}"),
            Some(&app.token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_system_status_reports_gauges() {
    let app = spawn_app().await;
    let (status, body) = send(
        &app.router,
        request(Method::GET, "/api/v1/system/status", Some(&app.token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
    assert_eq!(body["connectedSessions"], 0);
    assert_eq!(body["runningOperations"], 0);
}
