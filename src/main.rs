use chrono::Utc;
use clap::{Parser, Subcommand};
use opsdeck::api::{create_router, AppState, AuthKeys};
use opsdeck::audit::AuditSink;
use opsdeck::config::AppConfig;
use opsdeck::coordination::{wait_for_signal, Shutdown};
use opsdeck::credentials::CredentialStore;
use opsdeck::error::{OpsdeckError, Result};
use opsdeck::executor::{ExecutorConfig, OperationExecutor};
use opsdeck::hub::{Hub, SessionConfig};
use opsdeck::probe::{ProbeEngine, ProbeRunner};
use opsdeck::repository::{AuditRepository as _, Store};
use opsdeck::scheduler::{HealthScheduler, SchedulerConfig};
use opsdeck::transport::{HttpClient, SshPool, SshPoolConfig};
use opsdeck::{MemoryStore, PostgresStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "opsdeck", about = "Environment control plane", version)]
struct Cli {
    /// Config directory or file
    #[arg(short, long, default_value = "config", env = "OPSDECK_CONFIG")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane (default)
    Serve {
        /// Override the configured listen port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Load and validate the configuration, then exit
    CheckConfig,
    /// Print an argon2 hash for bootstrapping a user row
    HashPassword {
        /// Read the password from this argument instead of stdin
        #[arg(long)]
        password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::CheckConfig) => {
            let config = AppConfig::load_from(&cli.config)?;
            match config.validate() {
                Ok(()) => {
                    println!("configuration is valid");
                    Ok(())
                }
                Err(errors) => {
                    for error in &errors {
                        eprintln!("config error: {error}");
                    }
                    Err(OpsdeckError::Validation(errors.join("; ")))
                }
            }
        }
        Some(Commands::HashPassword { password }) => {
            let password = match password {
                Some(password) => password,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_line(&mut buf)?;
                    buf.trim_end_matches(['\r', '\n']).to_string()
                }
            };
            if password.is_empty() {
                return Err(OpsdeckError::Validation("password must not be empty".into()));
            }
            println!("{}", opsdeck::api::auth::hash_password(&password)?);
            Ok(())
        }
        Some(Commands::Serve { port }) => serve(&cli.config, port).await,
        None => serve(&cli.config, None).await,
    }
}

async fn serve(config_path: &str, port_override: Option<u16>) -> Result<()> {
    let mut config = AppConfig::load_from(config_path)?;
    if let Some(port) = port_override {
        config.server.port = port;
    }

    init_logging(&config);

    if let Err(errors) = config.validate() {
        for error in &errors {
            error!("config error: {error}");
        }
        return Err(OpsdeckError::Validation(errors.join("; ")));
    }

    info!(
        host = %config.server.host,
        port = config.server.port,
        storage = %storage_label(&config.storage.uri),
        "starting opsdeck"
    );

    // Storage. The concrete Arc is erased into each contract it serves.
    let (store, audit_repo, credential_repo) = if config.storage.uri == "memory" {
        warn!("using the in-memory store; state is lost on exit");
        erase_store(Arc::new(MemoryStore::new()))
    } else {
        let postgres = PostgresStore::new(
            &config.storage.uri,
            config.storage.max_connections,
            Duration::from_secs(config.storage.timeout_secs),
        )
        .await?;
        postgres.migrate().await?;
        erase_store(Arc::new(postgres))
    };

    let shutdown = Shutdown::new(Duration::from_secs(config.shutdown_timeout_secs));

    // Audit pipeline
    let (audit, audit_task) = AuditSink::spawn(audit_repo, shutdown.subscribe());

    // Fan-out hub
    let (hub, hub_task) = Hub::spawn(shutdown.subscribe());

    // Transports
    let http = HttpClient::new()?;
    let ssh = Arc::new(SshPool::new(SshPoolConfig {
        max_connections: config.ssh.max_connections,
        connection_timeout: Duration::from_secs(config.ssh.connection_timeout_secs),
        command_timeout: Duration::from_secs(config.ssh.command_timeout_secs),
        idle_ttl: Duration::from_secs(config.ssh.idle_ttl_secs),
    }));

    // Credential store (key length validated above)
    let key = config
        .credentials
        .key_bytes()
        .map_err(OpsdeckError::Validation)?;
    let credentials = Arc::new(CredentialStore::new(credential_repo, key));

    // Probe engine + scheduler
    let prober: Arc<dyn ProbeRunner> = Arc::new(ProbeEngine::new(
        store.clone(),
        http.clone(),
        audit.clone(),
        hub.clone(),
        Duration::from_secs(config.health.timeout_secs),
    ));
    let scheduler = HealthScheduler::new(
        store.clone(),
        prober.clone(),
        audit.clone(),
        SchedulerConfig {
            tick_interval: Duration::from_secs(config.health.interval_secs),
            concurrency: config.health.concurrency,
            drain_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        },
    );
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.subscribe()));

    // Operation executor
    let executor = Arc::new(OperationExecutor::new(
        store.clone(),
        credentials.clone(),
        ssh.clone(),
        http.clone(),
        audit.clone(),
        hub.clone(),
        ExecutorConfig {
            command_timeout: Duration::from_secs(config.ssh.command_timeout_secs),
            ..Default::default()
        },
        shutdown.subscribe(),
    ));

    // Optional audit retention sweep
    if let Some(retention_days) = config.audit.retention_days {
        let store = store.clone();
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(24 * 3600));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
                        match store.delete_audit_before(cutoff).await {
                            Ok(removed) if removed > 0 => {
                                info!(removed, "audit retention sweep completed")
                            }
                            Ok(_) => {}
                            Err(e) => warn!("audit retention sweep failed: {e}"),
                        }
                    }
                    _ = stop.changed() => return,
                }
            }
        });
    }

    // API surface
    let state = AppState {
        store,
        audit,
        hub,
        executor,
        prober,
        credentials,
        auth: Arc::new(AuthKeys::new(
            &config.auth.jwt_secret,
            config.auth.token_expiration_secs,
        )),
        ws: SessionConfig {
            ping_interval: Duration::from_secs(config.ws.ping_interval_secs),
            pong_timeout: Duration::from_secs(config.ws.pong_timeout_secs),
            max_message_bytes: config.ws.max_message_bytes,
        },
        start_time: Utc::now(),
    };
    let router = create_router(
        state,
        &config.allowed_origins,
        Duration::from_secs(config.server.read_timeout_secs + config.server.write_timeout_secs),
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| OpsdeckError::Validation(format!("invalid listen address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    let mut server_stop = shutdown.subscribe();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = server_stop.changed().await;
    });

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("server error: {e}");
            }
        }
        _ = wait_for_signal() => {}
    }

    // Stop accepting work, drain the scheduler, hub and audit sink within
    // the budget, then close the SSH pool.
    let clean = shutdown
        .drain(vec![
            ("scheduler", scheduler_task),
            ("hub", hub_task),
            ("audit", audit_task),
        ])
        .await;
    ssh.shutdown().await;

    if clean {
        info!("shutdown complete");
    } else {
        warn!("shutdown completed with aborted tasks");
    }
    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if let Some(directory) = &config.logging.directory {
        let appender = tracing_appender::rolling::daily(directory, "opsdeck.log");
        if config.logging.json {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(appender)
                .json()
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(appender)
                .init();
        }
    } else if config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn storage_label(uri: &str) -> &str {
    if uri == "memory" {
        "memory"
    } else {
        "postgres"
    }
}

type ErasedStore = (
    Arc<dyn Store>,
    Arc<dyn opsdeck::repository::AuditRepository>,
    Arc<dyn opsdeck::repository::CredentialRepository>,
);

fn erase_store<T: Store + 'static>(store: Arc<T>) -> ErasedStore {
    (store.clone(), store.clone(), store)
}
