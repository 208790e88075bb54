//! Shared fixtures: a fully wired application over the in-memory store and
//! small axum servers standing in for remote environments.

#![allow(dead_code)]

use axum::Router;
use chrono::Utc;
use opsdeck::api::auth::hash_password;
use opsdeck::api::{create_router, AppState, AuthKeys};
use opsdeck::audit::AuditSink;
use opsdeck::coordination::Shutdown;
use opsdeck::credentials::CredentialStore;
use opsdeck::domain::{
    CommandSpec, EnvStatus, Environment, HealthCheckConfig, ProbeValidation, SystemInfo, Target,
    Timestamps, User,
};
use opsdeck::executor::{ExecutorConfig, OperationExecutor};
use opsdeck::hub::{Hub, HubHandle, SessionConfig};
use opsdeck::probe::{ProbeEngine, ProbeRunner};
use opsdeck::repository::UserRepository;
use opsdeck::scheduler::{HealthScheduler, SchedulerConfig};
use opsdeck::transport::{HttpClient, SshPool, SshPoolConfig};
use opsdeck::{MemoryStore, Store};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const TEST_USERNAME: &str = "operator";
pub const TEST_PASSWORD: &str = "correct-horse-battery";

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub hub: HubHandle,
    pub shutdown: Shutdown,
    pub executor: Arc<OperationExecutor>,
    pub prober: Arc<dyn ProbeRunner>,
    /// A valid bearer token for the seeded operator user
    pub token: String,
}

impl TestApp {
    /// Flush queued audit events to storage. Stops background tasks, so
    /// call it only once assertions move to the audit log.
    pub async fn flush_audit(&self) {
        self.shutdown.trigger();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    /// Wait for every in-flight operation to reach a terminal state.
    pub async fn wait_for_operations(&self) {
        for _ in 0..200 {
            if self.executor.running_operations() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("operations did not finish in time");
    }
}

pub async fn spawn_app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let shutdown = Shutdown::new(Duration::from_secs(5));

    let (audit, _audit_task) = AuditSink::spawn(store.clone(), shutdown.subscribe());
    let (hub, _hub_task) = Hub::spawn(shutdown.subscribe());

    let http = HttpClient::new().unwrap();
    let ssh = Arc::new(SshPool::new(SshPoolConfig {
        connection_timeout: Duration::from_secs(2),
        command_timeout: Duration::from_secs(5),
        ..Default::default()
    }));
    let credentials = Arc::new(CredentialStore::new(store.clone(), [9u8; 32]));
    let credentials_for_state = credentials.clone();

    let erased: Arc<dyn Store> = store.clone();
    let prober: Arc<dyn ProbeRunner> = Arc::new(ProbeEngine::new(
        erased.clone(),
        http.clone(),
        audit.clone(),
        hub.clone(),
        Duration::from_secs(10),
    ));
    let executor = Arc::new(OperationExecutor::new(
        erased,
        credentials,
        ssh,
        http,
        audit.clone(),
        hub.clone(),
        ExecutorConfig {
            command_timeout: Duration::from_secs(5),
            version_list_timeout: Duration::from_secs(5),
        },
        shutdown.subscribe(),
    ));

    // Seed the operator account and mint a token for it.
    let user = User::new(TEST_USERNAME, &hash_password(TEST_PASSWORD).unwrap());
    store.create_user(&user).await.unwrap();
    let auth = Arc::new(AuthKeys::new("integration-test-secret", 3600));
    let (token, _) = auth.issue(&user).unwrap();

    let state = AppState {
        store: store.clone(),
        audit,
        hub: hub.clone(),
        executor: executor.clone(),
        prober: prober.clone(),
        credentials: credentials_for_state,
        auth,
        ws: SessionConfig {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            max_message_bytes: 512 * 1024,
        },
        start_time: Utc::now(),
    };
    let router = create_router(state.clone(), &[], Duration::from_secs(30));

    TestApp {
        router,
        state,
        store,
        hub,
        shutdown,
        executor,
        prober,
        token,
    }
}

/// Run a scheduler over the app's store for direct scheduler-driven tests.
pub fn spawn_scheduler(app: &TestApp, tick: Duration) -> tokio::task::JoinHandle<()> {
    let scheduler = HealthScheduler::new(
        app.store.clone(),
        app.prober.clone(),
        app.state.audit.clone(),
        SchedulerConfig {
            tick_interval: tick,
            concurrency: 10,
            drain_timeout: Duration::from_secs(5),
        },
    );
    tokio::spawn(scheduler.run(app.shutdown.subscribe()))
}

/// Serve a fixture router on an ephemeral local port.
pub async fn spawn_fixture(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A minimal environment probing `http://{addr}/health` for a 200.
pub fn environment_probing(addr: SocketAddr, name: &str) -> Environment {
    Environment {
        id: Uuid::new_v4(),
        name: name.to_string(),
        target: Target {
            host: addr.ip().to_string(),
            port: addr.port(),
            domain: None,
            host_key_fingerprint: None,
            insecure_skip_host_key: false,
        },
        credential: None,
        health_check: HealthCheckConfig {
            enabled: true,
            endpoint: "/health".to_string(),
            method: "GET".to_string(),
            interval_secs: 5,
            timeout_ms: 2000,
            headers: HashMap::new(),
            validation: ProbeValidation::StatusCode { status_code: 200 },
        },
        restart: None,
        upgrade: None,
        status: EnvStatus::default(),
        system_info: SystemInfo::default(),
        timestamps: Timestamps::now(),
    }
}

pub fn with_restart(mut env: Environment, details: opsdeck::domain::CommandDetails) -> Environment {
    env.restart = Some(CommandSpec {
        enabled: true,
        details,
    });
    env
}
