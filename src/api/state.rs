use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::api::auth::AuthKeys;
use crate::audit::AuditSink;
use crate::credentials::CredentialStore;
use crate::executor::OperationExecutor;
use crate::hub::{HubHandle, SessionConfig};
use crate::probe::ProbeRunner;
use crate::repository::Store;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    /// Storage behind the repository contracts
    pub store: Arc<dyn Store>,

    /// Non-blocking audit producer
    pub audit: AuditSink,

    /// Fan-out hub handle
    pub hub: HubHandle,

    /// Operation executor (restart / upgrade / versions)
    pub executor: Arc<OperationExecutor>,

    /// Probe runner for on-demand health checks
    pub prober: Arc<dyn ProbeRunner>,

    /// Encrypted credential material (C2)
    pub credentials: Arc<CredentialStore>,

    /// Token issue/verify keys
    pub auth: Arc<AuthKeys>,

    /// Per-connection WebSocket settings
    pub ws: SessionConfig,

    /// Application start time
    pub start_time: DateTime<Utc>,
}

impl AppState {
    /// Get system uptime in seconds
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds()
    }
}
