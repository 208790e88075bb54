pub mod adapters;
pub mod api;
pub mod audit;
pub mod config;
pub mod coordination;
pub mod credentials;
pub mod domain;
pub mod error;
pub mod executor;
pub mod hub;
pub mod probe;
pub mod repository;
pub mod scheduler;
pub mod transport;

pub use adapters::{MemoryStore, PostgresStore};
pub use api::{create_router, AppState, AuthKeys};
pub use audit::AuditSink;
pub use config::AppConfig;
pub use coordination::{wait_for_signal, Shutdown};
pub use credentials::{CredentialStore, SecretMaterial};
pub use domain::{
    Actor, AuditEvent, AuditKind, AuditLevel, Environment, Health, Operation, OperationKind,
    OperationStatus,
};
pub use error::{OpsdeckError, Result};
pub use executor::{ExecutorConfig, OperationExecutor, VersionInfo};
pub use hub::{Hub, HubEvent, HubHandle, SessionConfig};
pub use probe::{ProbeEngine, ProbeOutcome, ProbeRunner};
pub use repository::Store;
pub use scheduler::{HealthScheduler, SchedulerConfig};
pub use transport::{HttpClient, SshPool, SshPoolConfig};
