use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    AuditEvent, CommandSpec, CredentialRef, EnvStatus, Environment, Health, HealthCheckConfig,
    SystemInfo, Target, Timestamps, UpgradeConfig,
};

// ============================================================================
// Auth Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: Uuid,
    pub username: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub user: UserView,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Environment Types
// ============================================================================

/// Create/update payload: the configurable subtree of an environment.
/// Identity, status and probe timestamps are server-owned.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentPayload {
    pub name: String,
    pub target: Target,
    #[serde(default)]
    pub credential: Option<CredentialRef>,
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub restart: Option<CommandSpec>,
    #[serde(default)]
    pub upgrade: Option<UpgradeConfig>,
}

impl EnvironmentPayload {
    /// Materialize a brand-new environment from this payload.
    pub fn into_new_environment(self) -> Environment {
        Environment {
            id: Uuid::new_v4(),
            name: self.name,
            target: self.target,
            credential: self.credential,
            health_check: self.health_check,
            restart: self.restart,
            upgrade: self.upgrade,
            status: EnvStatus::default(),
            system_info: SystemInfo::default(),
            timestamps: Timestamps::now(),
        }
    }

    /// Apply this payload onto an existing environment.
    pub fn apply_to(self, mut env: Environment) -> Environment {
        env.name = self.name;
        env.target = self.target;
        env.credential = self.credential;
        env.health_check = self.health_check;
        env.restart = self.restart;
        env.upgrade = self.upgrade;
        env
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentsListResponse {
    pub environments: Vec<Environment>,
    pub pagination: Pagination,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentsQuery {
    #[serde(default)]
    pub health: Option<Health>,
    #[serde(default)]
    pub check_enabled: Option<bool>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

// ============================================================================
// Operation Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeRequest {
    pub version: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    pub operation_id: Uuid,
    pub status: crate::domain::OperationStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionsResponse {
    pub current_version: Option<String>,
    pub available_versions: Vec<String>,
}

// ============================================================================
// Audit Log Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsQuery {
    #[serde(default)]
    pub environment_id: Option<Uuid>,
    #[serde(default)]
    pub kind: Option<crate::domain::AuditKind>,
    #[serde(default)]
    pub level: Option<crate::domain::AuditLevel>,
    #[serde(default)]
    pub actor_id: Option<Uuid>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

impl LogsQuery {
    pub fn filter(&self) -> crate::domain::AuditFilter {
        crate::domain::AuditFilter {
            environment_id: self.environment_id,
            kind: self.kind,
            level: self.level,
            actor_id: self.actor_id,
            from: self.from,
            to: self.to,
            search: self.search.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsListResponse {
    pub logs: Vec<AuditEvent>,
    pub pagination: Pagination,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: u64,
}

// ============================================================================
// System Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: i64,
    pub connected_sessions: usize,
    pub running_operations: usize,
}
