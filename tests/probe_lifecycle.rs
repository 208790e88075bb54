//! Probe transitions end to end: verdicts, status persistence, fan-out on
//! health changes, and the audit trail they leave behind.

mod common;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use common::{environment_probing, spawn_app, spawn_fixture, spawn_scheduler};
use std::time::Duration;
use opsdeck::domain::{AuditFilter, AuditKind, Health, Page};
use opsdeck::hub::{ServerFrame, SessionHandle, SESSION_QUEUE_CAPACITY};
use opsdeck::probe::{ProbeOutcome, ProbeRunner};
use opsdeck::repository::{AuditRepository, EnvironmentRepository};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Fixture whose /health status code can be changed mid-test.
fn switchable_fixture(status: Arc<AtomicU16>) -> Router {
    Router::new().route(
        "/health",
        get(|State(status): State<Arc<AtomicU16>>| async move {
            let code = StatusCode::from_u16(status.load(Ordering::SeqCst)).unwrap();
            (code, "{\"status\":\"ok\"}")
        }),
    )
    .with_state(status)
}

#[tokio::test]
async fn test_probe_transitions_publish_once_per_change() {
    let app = spawn_app().await;
    let remote_status = Arc::new(AtomicU16::new(200));
    let addr = spawn_fixture(switchable_fixture(remote_status.clone())).await;

    let env = environment_probing(addr, "probe-transitions");
    app.store.create_environment(&env).await.unwrap();

    // Observe fan-out through a directly registered session.
    let session_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
    app.hub
        .register(SessionHandle { id: session_id, tx })
        .await
        .unwrap();
    app.hub.subscribe(session_id, vec![env.id]).await.unwrap();
    app.hub.session_count().await.unwrap();
    let _ack = rx.recv().await.unwrap();

    // 200 -> healthy, one frame
    let outcome = app.prober.probe(env.id).await.unwrap();
    assert!(matches!(
        outcome,
        ProbeOutcome::Completed {
            verdict: Health::Healthy,
            changed: true,
            applied: true
        }
    ));
    let loaded = app.store.get_environment(env.id).await.unwrap();
    assert_eq!(loaded.status.health, Health::Healthy);
    assert!(loaded.status.response_time_ms.is_some());
    let first_healthy_at = loaded.timestamps.last_healthy_at.expect("lastHealthyAt set");

    app.hub.session_count().await.unwrap();
    match rx.try_recv().unwrap() {
        ServerFrame::StatusUpdate {
            environment_id,
            status,
        } => {
            assert_eq!(environment_id, env.id);
            assert_eq!(status.health, Health::Healthy);
        }
        other => panic!("expected status_update, got {other:?}"),
    }

    // Still 200: status refreshed, but no new frame
    app.prober.probe(env.id).await.unwrap();
    app.hub.session_count().await.unwrap();
    assert!(rx.try_recv().is_err());

    // 500 -> unhealthy, exactly one frame
    remote_status.store(500, Ordering::SeqCst);
    let outcome = app.prober.probe(env.id).await.unwrap();
    assert!(matches!(
        outcome,
        ProbeOutcome::Completed {
            verdict: Health::Unhealthy,
            changed: true,
            ..
        }
    ));
    let loaded = app.store.get_environment(env.id).await.unwrap();
    assert_eq!(loaded.status.health, Health::Unhealthy);
    assert!(loaded.status.message.contains("500"));

    app.hub.session_count().await.unwrap();
    match rx.try_recv().unwrap() {
        ServerFrame::StatusUpdate { status, .. } => {
            assert_eq!(status.health, Health::Unhealthy)
        }
        other => panic!("expected status_update, got {other:?}"),
    }

    // Back to 200 -> healthy again; lastHealthyAt advances
    remote_status.store(200, Ordering::SeqCst);
    app.prober.probe(env.id).await.unwrap();
    let loaded = app.store.get_environment(env.id).await.unwrap();
    assert_eq!(loaded.status.health, Health::Healthy);
    assert!(loaded.timestamps.last_healthy_at.unwrap() >= first_healthy_at);

    app.hub.session_count().await.unwrap();
    assert!(matches!(
        rx.try_recv().unwrap(),
        ServerFrame::StatusUpdate { .. }
    ));

    // The two transitions out of the initial state left healthCheck audits.
    app.flush_audit().await;
    let audits = app
        .store
        .list_audit(
            &AuditFilter {
                kind: Some(AuditKind::HealthCheck),
                ..Default::default()
            },
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(audits.len(), 3);
}

#[tokio::test]
async fn test_json_regex_validator_drives_verdict() {
    let app = spawn_app().await;
    let healthy_body = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let body_flag = healthy_body.clone();
    let router = Router::new().route(
        "/health",
        get(move || {
            let flag = body_flag.clone();
            async move {
                if flag.load(Ordering::SeqCst) {
                    r#"{"status":"ok","details":{"db":"up"}}"#
                } else {
                    r#"{"status":"degraded","details":{"db":"down"}}"#
                }
            }
        }),
    );
    let addr = spawn_fixture(router).await;

    let mut env = environment_probing(addr, "json-regex");
    env.health_check.validation = opsdeck::domain::ProbeValidation::JsonRegex {
        json_regex: opsdeck::domain::JsonRegexRule {
            path: "$.status".to_string(),
            pattern: "^ok$".to_string(),
        },
    };
    app.store.create_environment(&env).await.unwrap();

    app.prober.probe(env.id).await.unwrap();
    let loaded = app.store.get_environment(env.id).await.unwrap();
    assert_eq!(loaded.status.health, Health::Healthy);

    healthy_body.store(false, Ordering::SeqCst);
    app.prober.probe(env.id).await.unwrap();
    let loaded = app.store.get_environment(env.id).await.unwrap();
    assert_eq!(loaded.status.health, Health::Unhealthy);
    assert!(loaded.status.message.contains("$.status"));
}

#[tokio::test]
async fn test_probe_sends_configured_headers() {
    let app = spawn_app().await;
    let router = Router::new().route(
        "/health",
        get(|headers: axum::http::HeaderMap| async move {
            match headers.get("x-probe-auth").and_then(|v| v.to_str().ok()) {
                Some("letmein") => StatusCode::OK,
                _ => StatusCode::FORBIDDEN,
            }
        }),
    );
    let addr = spawn_fixture(router).await;

    let mut env = environment_probing(addr, "header-probe");
    env.health_check
        .headers
        .insert("x-probe-auth".to_string(), "letmein".to_string());
    app.store.create_environment(&env).await.unwrap();

    app.prober.probe(env.id).await.unwrap();
    let loaded = app.store.get_environment(env.id).await.unwrap();
    assert_eq!(loaded.status.health, Health::Healthy);
}

#[tokio::test]
async fn test_unreachable_remote_is_unhealthy_with_transport_message() {
    let app = spawn_app().await;
    // Port 1 is closed; the connection is refused or times out.
    let env = environment_probing("127.0.0.1:1".parse().unwrap(), "unreachable");
    app.store.create_environment(&env).await.unwrap();

    let outcome = app.prober.probe(env.id).await.unwrap();
    assert!(matches!(
        outcome,
        ProbeOutcome::Completed {
            verdict: Health::Unhealthy,
            ..
        }
    ));
    let loaded = app.store.get_environment(env.id).await.unwrap();
    assert_eq!(loaded.status.health, Health::Unhealthy);
    assert!(!loaded.status.message.is_empty());
}

#[tokio::test]
async fn test_disabled_health_check_leaves_status_untouched() {
    let app = spawn_app().await;
    let mut env = environment_probing("127.0.0.1:1".parse().unwrap(), "disabled-check");
    env.health_check.enabled = false;
    app.store.create_environment(&env).await.unwrap();

    let outcome = app.prober.probe(env.id).await.unwrap();
    assert_eq!(outcome, ProbeOutcome::Skipped);

    let loaded = app.store.get_environment(env.id).await.unwrap();
    assert_eq!(loaded.status.health, Health::Unknown);
    assert!(loaded.status.last_check.is_none());
}

#[tokio::test]
async fn test_scheduler_drives_probes_to_verdict() {
    let app = spawn_app().await;
    let remote_status = Arc::new(AtomicU16::new(200));
    let addr = spawn_fixture(switchable_fixture(remote_status)).await;
    let env = environment_probing(addr, "scheduled");
    app.store.create_environment(&env).await.unwrap();

    let scheduler = spawn_scheduler(&app, Duration::from_millis(100));

    // The first tick fires immediately; wait for the verdict to land.
    let mut verdict = Health::Unknown;
    for _ in 0..100 {
        verdict = app
            .store
            .get_environment(env.id)
            .await
            .unwrap()
            .status
            .health;
        if verdict == Health::Healthy {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(verdict, Health::Healthy);

    // Cooperative stop returns promptly.
    app.shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), scheduler)
        .await
        .expect("scheduler did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_last_check_is_monotonic_across_probes() {
    let app = spawn_app().await;
    let remote_status = Arc::new(AtomicU16::new(200));
    let addr = spawn_fixture(switchable_fixture(remote_status)).await;
    let env = environment_probing(addr, "monotonic");
    app.store.create_environment(&env).await.unwrap();

    app.prober.probe(env.id).await.unwrap();
    let first = app
        .store
        .get_environment(env.id)
        .await
        .unwrap()
        .status
        .last_check
        .unwrap();

    app.prober.probe(env.id).await.unwrap();
    let second = app
        .store
        .get_environment(env.id)
        .await
        .unwrap()
        .status
        .last_check
        .unwrap();

    assert!(second >= first);
}
